use crate::batch::BatchWriter;
use crate::document::{document_path, Document};
use crate::error::Result;
use crate::report::MigrationStats;
use crate::store::DocumentStore;
use crate::targets::MigrationTarget;
use crate::verifier::Verifier;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The field is already gone.
    FieldAbsent,
    /// Verification refused; nothing was written.
    Unsafe,
    /// The field still holds data but the parent never got its completion
    /// marker, so some elements may not have reached the subcollection.
    Unmarked,
    /// The field was removed (or would be, in dry-run).
    Removed,
    /// Verification passed but the delete did not commit.
    Failed,
}

/// Removes an embedded field once its data is known to live in the subcollection.
pub struct CleanupExecutor<'t> {
    target: &'t MigrationTarget,
}

impl<'t> CleanupExecutor<'t> {
    pub fn new(target: &'t MigrationTarget) -> Self {
        CleanupExecutor { target }
    }

    /// Verify the parent and, only if safe, delete the field. Never deletes
    /// the parent document itself.
    ///
    /// A non-empty field is also kept when the parent lacks `<field>MigratedAt`:
    /// a populated subcollection alone does not prove every element was moved.
    pub fn clean_parent<S>(
        &self,
        parent: &Document,
        writer: &mut BatchWriter<'_, S>,
        stats: &mut MigrationStats,
    ) -> Result<CleanupOutcome>
    where
        S: DocumentStore + ?Sized,
    {
        let target = self.target;
        let key = target.key();
        stats.target_mut(&key).parents_scanned += 1;

        if !parent.data.contains_key(&target.field) {
            return Ok(CleanupOutcome::FieldAbsent);
        }

        let verification = Verifier::new(writer.store()).verify(target, parent)?;
        let Some(permit) = verification.permit() else {
            stats.target_mut(&key).parents_unsafe += 1;
            stats.record_warning(format!(
                "{}: {}; cleanup skipped",
                verification.parent_path(),
                verification.reason.as_deref().unwrap_or("not verified")
            ));
            return Ok(CleanupOutcome::Unsafe);
        };

        let holds_data = match parent.get(&target.field) {
            None | Some(Value::Null) => false,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        };
        let marker = target.marker_field();
        if holds_data && parent.get(&marker).is_none() {
            stats.target_mut(&key).parents_unsafe += 1;
            stats.record_warning(format!(
                "{}: {} has data but no {marker}; migration incomplete, cleanup skipped",
                verification.parent_path(),
                target.field
            ));
            return Ok(CleanupOutcome::Unmarked);
        }

        match writer.submit(permit.into_op()).and_then(|()| writer.flush()) {
            Ok(()) => {
                log::debug!(
                    "{}: removed {} ({:?})",
                    verification.parent_path(),
                    target.field,
                    verification.basis
                );
                stats.target_mut(&key).fields_removed += 1;
                Ok(CleanupOutcome::Removed)
            }
            Err(failure) => {
                stats.record_error(format!(
                    "{}: removing {} failed: {failure}",
                    document_path(&target.collection, &parent.id),
                    target.field
                ));
                Ok(CleanupOutcome::Failed)
            }
        }
    }
}
