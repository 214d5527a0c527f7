// Documents and write operations as the pipeline sees them

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map of a document. Values are JSON so any store can round-trip them.
pub type Fields = Map<String, Value>;

/// A loaded document: its id within its collection plus its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Fields) -> Self {
        Document {
            id: id.into(),
            data,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// Path of the subcollection `sub` under `collection/parent_id`.
pub fn child_collection_path(collection: &str, parent_id: &str, sub: &str) -> String {
    format!("{collection}/{parent_id}/{sub}")
}

/// Full path of a document inside a (possibly nested) collection.
pub fn document_path(collection_path: &str, id: &str) -> String {
    format!("{collection_path}/{id}")
}

/// A single write queued on the batch writer.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create a new child document. Fails if the document already exists.
    CreateChild {
        parent_collection: String,
        parent_id: String,
        subcollection: String,
        child_id: String,
        data: Fields,
    },
    /// Merge top-level fields into an existing parent document.
    UpdateParent {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Remove one field from an existing parent document.
    DeleteField {
        collection: String,
        id: String,
        field: String,
    },
    /// Create or fully replace a document.
    SetDocument {
        collection: String,
        id: String,
        data: Fields,
    },
}

impl WriteOp {
    /// Path of the collection holding the written document.
    pub fn collection_path(&self) -> String {
        match self {
            WriteOp::CreateChild {
                parent_collection,
                parent_id,
                subcollection,
                ..
            } => child_collection_path(parent_collection, parent_id, subcollection),
            WriteOp::UpdateParent { collection, .. }
            | WriteOp::DeleteField { collection, .. }
            | WriteOp::SetDocument { collection, .. } => collection.clone(),
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            WriteOp::CreateChild { child_id, .. } => child_id,
            WriteOp::UpdateParent { id, .. }
            | WriteOp::DeleteField { id, .. }
            | WriteOp::SetDocument { id, .. } => id,
        }
    }

    /// Identifier of the op: the full path of the document it writes.
    pub fn path(&self) -> String {
        document_path(&self.collection_path(), self.document_id())
    }

    /// Id of the top-level document this op belongs to.
    pub fn owner_id(&self) -> &str {
        match self {
            WriteOp::CreateChild { parent_id, .. } => parent_id,
            other => other.document_id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::CreateChild { .. } => "create-child",
            WriteOp::UpdateParent { .. } => "update-parent",
            WriteOp::DeleteField { .. } => "delete-field",
            WriteOp::SetDocument { .. } => "set-document",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_child_paths() {
        let op = WriteOp::CreateChild {
            parent_collection: "dogs".into(),
            parent_id: "dog-1".into(),
            subcollection: "health_tests".into(),
            child_id: "01abc".into(),
            data: Fields::new(),
        };
        assert_eq!(op.collection_path(), "dogs/dog-1/health_tests");
        assert_eq!(op.path(), "dogs/dog-1/health_tests/01abc");
        assert_eq!(op.owner_id(), "dog-1");
        assert_eq!(op.kind(), "create-child");
    }

    #[test]
    fn test_parent_op_paths() {
        let op = WriteOp::DeleteField {
            collection: "litters".into(),
            id: "litter-2".into(),
            field: "expenses".into(),
        };
        assert_eq!(op.path(), "litters/litter-2");
        assert_eq!(op.owner_id(), "litter-2");
    }
}
