use crate::document::{child_collection_path, Document, WriteOp};
use crate::error::Result;

mod sqlite;

pub use sqlite::SqliteStore;

/// The document store the pipeline runs against.
///
/// Collections are addressed by path: `dogs` for a top-level collection,
/// `dogs/dog-1/health_tests` for a subcollection under one parent.
pub trait DocumentStore {
    /// List every document in a collection, ordered by id.
    fn list_documents(&self, collection_path: &str) -> Result<Vec<Document>>;

    /// Get a single document, or `None` if it does not exist.
    fn get_document(&self, collection_path: &str, id: &str) -> Result<Option<Document>>;

    /// Commit a group of writes atomically: either all ops apply or none do.
    fn commit(&self, ops: &[WriteOp]) -> Result<()>;

    /// List the documents of `sub` under `collection/parent_id`.
    fn list_children(&self, collection: &str, parent_id: &str, sub: &str) -> Result<Vec<Document>> {
        self.list_documents(&child_collection_path(collection, parent_id, sub))
    }

    /// Whether `sub` under `collection/parent_id` holds at least one document.
    fn has_children(&self, collection: &str, parent_id: &str, sub: &str) -> Result<bool> {
        Ok(!self.list_children(collection, parent_id, sub)?.is_empty())
    }
}
