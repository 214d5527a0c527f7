use crate::document::{document_path, Document, WriteOp};
use crate::error::Result;
use crate::store::DocumentStore;
use crate::targets::MigrationTarget;
use serde::Serialize;
use serde_json::Value;

/// Why a verification came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationBasis {
    SubcollectionPopulated,
    FieldEmpty,
    FieldAbsent,
    NotMigrated,
}

/// Whether one embedded field of one parent may be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub collection: String,
    pub field: String,
    pub parent_id: String,
    pub safe_to_clean: bool,
    pub basis: VerificationBasis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verification {
    pub fn target_key(&self) -> String {
        format!("{}.{}", self.collection, self.field)
    }

    pub fn parent_path(&self) -> String {
        document_path(&self.collection, &self.parent_id)
    }

    /// The permit to delete the field, present only for a safe verification.
    pub fn permit(&self) -> Option<CleanupPermit> {
        self.safe_to_clean.then(|| CleanupPermit {
            collection: self.collection.clone(),
            id: self.parent_id.clone(),
            field: self.field.clone(),
        })
    }
}

/// Proof that a field passed verification. A `DeleteField` write can only be
/// built from one of these.
#[derive(Debug, PartialEq, Eq)]
pub struct CleanupPermit {
    collection: String,
    id: String,
    field: String,
}

impl CleanupPermit {
    pub fn into_op(self) -> WriteOp {
        WriteOp::DeleteField {
            collection: self.collection,
            id: self.id,
            field: self.field,
        }
    }
}

/// Checks that a parent's embedded data already lives in its subcollection.
pub struct Verifier<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: DocumentStore + ?Sized> Verifier<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Verifier { store }
    }

    /// Verify one (parent, target) pair against the current store contents.
    pub fn verify(&self, target: &MigrationTarget, parent: &Document) -> Result<Verification> {
        let populated =
            self.store
                .has_children(&target.collection, &parent.id, &target.subcollection)?;

        let basis = if populated {
            VerificationBasis::SubcollectionPopulated
        } else {
            match parent.get(&target.field) {
                None | Some(Value::Null) => VerificationBasis::FieldAbsent,
                Some(Value::Array(items)) if items.is_empty() => VerificationBasis::FieldEmpty,
                Some(_) => VerificationBasis::NotMigrated,
            }
        };

        let safe_to_clean = basis != VerificationBasis::NotMigrated;
        Ok(Verification {
            collection: target.collection.clone(),
            field: target.field.clone(),
            parent_id: parent.id.clone(),
            safe_to_clean,
            basis,
            reason: (!safe_to_clean)
                .then(|| format!("{} has data but no subcollection", target.field)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::fields;
    use crate::store::SqliteStore;
    use crate::targets::builtin_targets;
    use serde_json::json;

    fn puppies() -> MigrationTarget {
        builtin_targets()
            .unwrap()
            .into_iter()
            .find(|t| t.key() == "litters.puppies")
            .unwrap()
    }

    #[test]
    fn test_populated_subcollection_is_safe() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_document("litters/litter-1/puppies", "p1", &fields(json!({ "sex": "male" })))
            .unwrap();
        let parent = Document::new("litter-1", fields(json!({ "puppies": [{ "sex": "male" }] })));

        let verification = Verifier::new(&store).verify(&puppies(), &parent).unwrap();
        assert!(verification.safe_to_clean);
        assert_eq!(verification.basis, VerificationBasis::SubcollectionPopulated);
        assert!(verification.permit().is_some());
    }

    #[test]
    fn test_empty_field_is_safe() {
        let store = SqliteStore::open_in_memory().unwrap();
        let verifier = Verifier::new(&store);

        let empty = Document::new("litter-2", fields(json!({ "puppies": [] })));
        let verification = verifier.verify(&puppies(), &empty).unwrap();
        assert!(verification.safe_to_clean);
        assert_eq!(verification.basis, VerificationBasis::FieldEmpty);

        let absent = Document::new("litter-4", fields(json!({ "name": "spring" })));
        assert_eq!(
            verifier.verify(&puppies(), &absent).unwrap().basis,
            VerificationBasis::FieldAbsent
        );
    }

    #[test]
    fn test_data_without_subcollection_is_unsafe() {
        let store = SqliteStore::open_in_memory().unwrap();
        let parent = Document::new(
            "litter-3",
            fields(json!({ "puppies": [{ "sex": "male" }, { "sex": "female" }, { "sex": "male" }] })),
        );

        let verification = Verifier::new(&store).verify(&puppies(), &parent).unwrap();
        assert!(!verification.safe_to_clean);
        assert_eq!(
            verification.reason.as_deref(),
            Some("puppies has data but no subcollection")
        );
        assert_eq!(verification.parent_path(), "litters/litter-3");
        assert!(verification.permit().is_none());
    }

    #[test]
    fn test_permit_becomes_field_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let parent = Document::new("litter-2", fields(json!({ "puppies": [] })));
        let op = Verifier::new(&store)
            .verify(&puppies(), &parent)
            .unwrap()
            .permit()
            .unwrap()
            .into_op();

        assert_eq!(
            op,
            WriteOp::DeleteField {
                collection: "litters".into(),
                id: "litter-2".into(),
                field: "puppies".into(),
            }
        );
    }
}
