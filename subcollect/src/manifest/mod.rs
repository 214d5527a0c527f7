// Run manifest: which targets have completed an execute-mode migration

use crate::batch::BatchWriter;
use crate::document::{Fields, WriteOp};
use crate::error::{Result, SubcollectError};
use crate::report::TargetStats;
use crate::store::DocumentStore;
use crate::targets::MigrationTarget;
use serde::{Deserialize, Serialize};

/// Collection holding one manifest document per target.
pub const MANIFEST_COLLECTION: &str = "_subcollect_manifest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub collection: String,
    pub field: String,
    pub subcollection: String,
    pub last_migrated_at: String,
    pub migrate_runs: u64,
    pub children_created: u64,
    pub parents_migrated: u64,
}

impl ManifestEntry {
    /// The entry after one more completed pass over `target`.
    pub fn next(
        previous: Option<&ManifestEntry>,
        target: &MigrationTarget,
        migrated_at: &str,
        pass: &TargetStats,
    ) -> Self {
        let (runs, children, parents) = previous
            .map(|p| (p.migrate_runs, p.children_created, p.parents_migrated))
            .unwrap_or_default();
        ManifestEntry {
            collection: target.collection.clone(),
            field: target.field.clone(),
            subcollection: target.subcollection.clone(),
            last_migrated_at: migrated_at.to_string(),
            migrate_runs: runs + 1,
            children_created: children + pass.children_created as u64,
            parents_migrated: parents + pass.parents_migrated as u64,
        }
    }
}

/// Read the manifest entry for `target`, if it was ever migrated.
pub fn load_entry<S>(store: &S, target: &MigrationTarget) -> Result<Option<ManifestEntry>>
where
    S: DocumentStore + ?Sized,
{
    let Some(doc) = store.get_document(MANIFEST_COLLECTION, &target.key())? else {
        return Ok(None);
    };
    let entry = serde_json::from_value(serde_json::Value::Object(doc.data)).map_err(|e| {
        SubcollectError::Store(format!(
            "malformed manifest entry {MANIFEST_COLLECTION}/{}: {e}",
            target.key()
        ))
    })?;
    Ok(Some(entry))
}

/// Write `entry` through the batch writer and flush it. A dry-run writer
/// accepts the write without touching the store.
pub fn record_entry<S>(
    writer: &mut BatchWriter<'_, S>,
    target: &MigrationTarget,
    entry: &ManifestEntry,
) -> Result<()>
where
    S: DocumentStore + ?Sized,
{
    let data = to_fields(entry)?;
    writer
        .submit(WriteOp::SetDocument {
            collection: MANIFEST_COLLECTION.to_string(),
            id: target.key(),
            data,
        })
        .and_then(|()| writer.flush())
        .map_err(|failure| SubcollectError::Store(failure.to_string()))
}

fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(SubcollectError::Store(format!(
            "manifest entry must serialize to an object, got {other}"
        ))),
    }
}
