use crate::aggregate::{compute_aggregates, to_fields};
use crate::batch::{BatchFailure, BatchWriter};
use crate::document::{document_path, Document, Fields, WriteOp};
use crate::error::Result;
use crate::report::MigrationStats;
use crate::store::DocumentStore;
use crate::targets::MigrationTarget;
use serde_json::Value;

/// Field on every child naming the parent it was moved out of.
pub const PARENT_ID_FIELD: &str = "parentId";

/// What happened to one parent for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentOutcome {
    /// The parent already carries the completion marker.
    AlreadyMigrated,
    /// Nothing to move. `aggregates_written` when zero aggregates were recorded.
    Empty { aggregates_written: bool },
    /// The field holds something other than a list.
    NotAList,
    /// No marker, but the subcollection already has documents.
    Conflict,
    /// Every child and the parent update committed (or would, in dry-run).
    Migrated { children: usize },
    /// Some writes for this parent failed; the parent update was withheld or lost.
    Incomplete,
}

impl ParentOutcome {
    pub fn mutated_parent(self) -> bool {
        matches!(
            self,
            ParentOutcome::Migrated { .. } | ParentOutcome::Empty { aggregates_written: true }
        )
    }
}

/// Moves one embedded-array field of a parent into its subcollection.
pub struct FieldMigrator<'t> {
    target: &'t MigrationTarget,
    run_timestamp: String,
}

impl<'t> FieldMigrator<'t> {
    /// `run_timestamp` backfills missing child timestamps and stamps the
    /// completion marker, so every write of a run shares one instant.
    pub fn new(target: &'t MigrationTarget, run_timestamp: impl Into<String>) -> Self {
        FieldMigrator {
            target,
            run_timestamp: run_timestamp.into(),
        }
    }

    pub fn target(&self) -> &MigrationTarget {
        self.target
    }

    /// Synthesize a child document from one array element: original keys kept,
    /// timestamp backfilled when missing, parent id denormalized, fresh id.
    pub fn build_child(&self, parent_id: &str, payload: &Fields) -> (String, Fields) {
        let mut data = payload.clone();

        let timestamp_field = &self.target.timestamp_field;
        if data.get(timestamp_field).map_or(true, Value::is_null) {
            data.insert(
                timestamp_field.clone(),
                Value::String(self.run_timestamp.clone()),
            );
        }

        data.insert(
            PARENT_ID_FIELD.to_string(),
            Value::String(parent_id.to_string()),
        );
        if let Some(alias) = &self.target.parent_id_alias {
            data.insert(alias.clone(), Value::String(parent_id.to_string()));
        }

        (self.target.id_strategy.generate(), data)
    }

    /// Migrate the target field of one parent.
    ///
    /// Child writes are flushed before the parent update is submitted, and the
    /// update (aggregates plus the `<field>MigratedAt` marker) is only sent when
    /// every child batch committed. The embedded field itself is left in place.
    /// Store read errors are returned; everything else lands in `stats`.
    pub fn migrate_parent<S>(
        &self,
        parent: &Document,
        writer: &mut BatchWriter<'_, S>,
        stats: &mut MigrationStats,
    ) -> Result<ParentOutcome>
    where
        S: DocumentStore + ?Sized,
    {
        let target = self.target;
        let key = target.key();
        let parent_path = document_path(&target.collection, &parent.id);
        let marker = target.marker_field();
        stats.target_mut(&key).parents_scanned += 1;

        if parent.get(&marker).is_some() {
            log::debug!("{parent_path}: {} already migrated", target.field);
            stats.target_mut(&key).parents_already_migrated += 1;
            return Ok(ParentOutcome::AlreadyMigrated);
        }

        let elements: &[Value] = match parent.get(&target.field) {
            None | Some(Value::Null) => &[][..],
            Some(Value::Array(items)) => items.as_slice(),
            Some(other) => {
                stats.record_error(format!(
                    "{parent_path}: {} is not a list (found {})",
                    target.field,
                    json_type(other)
                ));
                return Ok(ParentOutcome::NotAList);
            }
        };

        if elements.is_empty() {
            stats.target_mut(&key).parents_empty += 1;
            let aggregates_written =
                target.write_empty_aggregates && self.update_parent(parent, &[], writer, stats);
            return Ok(ParentOutcome::Empty { aggregates_written });
        }

        if writer
            .store()
            .has_children(&target.collection, &parent.id, &target.subcollection)?
        {
            stats.target_mut(&key).parents_conflicting += 1;
            stats.record_warning(format!(
                "{parent_path}: {} has no {marker} but {} already holds documents; skipped",
                target.field, target.subcollection
            ));
            return Ok(ParentOutcome::Conflict);
        }

        let mut children: Vec<(String, Fields)> = Vec::with_capacity(elements.len());
        let mut malformed = 0usize;
        for (index, element) in elements.iter().enumerate() {
            match element {
                Value::Object(payload) => children.push(self.build_child(&parent.id, payload)),
                other => {
                    malformed += 1;
                    stats.record_error(format!(
                        "{parent_path}: {}[{index}] is not a record (found {}); skipped",
                        target.field,
                        json_type(other)
                    ));
                }
            }
        }
        if children.is_empty() {
            stats.record_error(format!(
                "{parent_path}: no usable {} elements; parent left unmigrated",
                target.field
            ));
            return Ok(ParentOutcome::Incomplete);
        }

        let mut failures: Vec<BatchFailure> = Vec::new();
        for (child_id, data) in &children {
            let op = WriteOp::CreateChild {
                parent_collection: target.collection.clone(),
                parent_id: parent.id.clone(),
                subcollection: target.subcollection.clone(),
                child_id: child_id.clone(),
                data: data.clone(),
            };
            if let Err(failure) = writer.submit(op) {
                failures.push(failure);
            }
        }
        if let Err(failure) = writer.flush() {
            failures.push(failure);
        }

        let lost: usize = failures.iter().map(|f| f.create_ops).sum();
        let committed = children.len() - lost;
        stats.target_mut(&key).children_created += committed;

        if !failures.is_empty() {
            for failure in &failures {
                stats.record_error(format!("{parent_path}: {failure}"));
            }
            stats.record_error(format!(
                "{parent_path}: {lost} of {} {} children not written; aggregates and {marker} withheld",
                children.len(),
                target.field
            ));
            return Ok(ParentOutcome::Incomplete);
        }

        // The embedded field still holds elements with no child copy.
        if malformed > 0 {
            stats.record_error(format!(
                "{parent_path}: {malformed} malformed {} element(s) skipped; aggregates and {marker} withheld",
                target.field
            ));
            return Ok(ParentOutcome::Incomplete);
        }

        let data: Vec<Fields> = children.into_iter().map(|(_, data)| data).collect();
        if self.update_parent(parent, &data, writer, stats) {
            stats.target_mut(&key).parents_migrated += 1;
            log::debug!("{parent_path}: moved {committed} {} into {}", target.field, target.subcollection);
            Ok(ParentOutcome::Migrated {
                children: committed,
            })
        } else {
            Ok(ParentOutcome::Incomplete)
        }
    }

    /// Submit and flush the parent update. Returns whether it went through.
    fn update_parent<S>(
        &self,
        parent: &Document,
        children: &[Fields],
        writer: &mut BatchWriter<'_, S>,
        stats: &mut MigrationStats,
    ) -> bool
    where
        S: DocumentStore + ?Sized,
    {
        let target = self.target;

        let (mut fields, aggregate_count) = match &target.aggregates {
            Some(spec) => {
                let aggregates = compute_aggregates(children, spec);
                (to_fields(&aggregates), aggregates.len())
            }
            None => (Fields::new(), 0),
        };
        fields.insert(
            target.marker_field(),
            Value::String(self.run_timestamp.clone()),
        );

        let op = WriteOp::UpdateParent {
            collection: target.collection.clone(),
            id: parent.id.clone(),
            fields,
        };
        match writer.submit(op).and_then(|()| writer.flush()) {
            Ok(()) => {
                stats.target_mut(&target.key()).aggregate_fields_updated += aggregate_count;
                true
            }
            Err(failure) => {
                stats.record_error(format!(
                    "{}: parent update failed: {failure}",
                    document_path(&target.collection, &parent.id)
                ));
                false
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "record",
    }
}
