use crate::document::{child_collection_path, document_path, Document, Fields, WriteOp};
use crate::error::{Result, SubcollectError};
use crate::store::DocumentStore;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// A document store persisted in a single sqlite file.
///
/// Every document, top-level or nested, is one row keyed by its full path.
/// `parent_path` is the path of the collection that holds it, so listing a
/// subcollection is a single indexed lookup.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = SqliteStore { conn };
        store.initialize_tables()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore { conn };
        store.initialize_tables()?;
        Ok(store)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                parent_path TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(parent_path);
            ",
        )?;
        Ok(())
    }

    /// Create or replace a document outside of any batch.
    pub fn put_document(&self, collection_path: &str, id: &str, data: &Fields) -> Result<()> {
        check_id(id)?;
        let path = document_path(collection_path, id);
        let data_json = serde_json::to_string(data)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO documents (path, parent_path, id, data_json) VALUES (?1, ?2, ?3, ?4)",
            params![path, collection_path, id, data_json],
        )?;
        Ok(())
    }

    /// Count the documents in a collection.
    pub fn count_documents(&self, collection_path: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE parent_path = ?1",
            params![collection_path],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn read_data(&self, path: &str) -> Result<Option<Fields>> {
        let data_json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM documents WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        match data_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn write_data(&self, path: &str, data: &Fields) -> Result<()> {
        let data_json = serde_json::to_string(data)?;
        self.conn.execute(
            "UPDATE documents SET data_json = ?2, updated_at = datetime('now') WHERE path = ?1",
            params![path, data_json],
        )?;
        Ok(())
    }

    fn apply(&self, op: &WriteOp) -> Result<()> {
        let path = op.path();
        match op {
            WriteOp::CreateChild { data, .. } => {
                if self.read_data(&path)?.is_some() {
                    return Err(SubcollectError::Store(format!(
                        "Document already exists: {path}"
                    )));
                }
                self.put_document(&op.collection_path(), op.document_id(), data)
            }
            WriteOp::UpdateParent { fields, .. } => {
                let mut data = self
                    .read_data(&path)?
                    .ok_or_else(|| SubcollectError::NotFound { path: path.clone() })?;
                for (key, value) in fields {
                    data.insert(key.clone(), value.clone());
                }
                self.write_data(&path, &data)
            }
            WriteOp::DeleteField { field, .. } => {
                let mut data = self
                    .read_data(&path)?
                    .ok_or_else(|| SubcollectError::NotFound { path: path.clone() })?;
                data.remove(field);
                self.write_data(&path, &data)
            }
            WriteOp::SetDocument { data, .. } => {
                self.put_document(&op.collection_path(), op.document_id(), data)
            }
        }
    }

    // ── Transaction Support ──────────────────────────────────────────

    fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Roll back after a failed op. The op's error is what the caller sees;
    /// a rollback failure is only logged.
    fn abort_transaction(&self, cause: SubcollectError) -> SubcollectError {
        if let Err(e) = self.rollback_transaction() {
            log::warn!("Rollback after failed batch also failed: {e}");
        }
        cause
    }

    /// Every stored row as (path, data_json), ordered by path.
    #[cfg(test)]
    pub(crate) fn all_documents(&self) -> Vec<(String, String)> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, data_json FROM documents ORDER BY path")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        rows.map(|r| r.unwrap()).collect()
    }
}

impl DocumentStore for SqliteStore {
    fn list_documents(&self, collection_path: &str) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, data_json FROM documents WHERE parent_path = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection_path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, data_json) = row?;
            docs.push(Document::new(id, serde_json::from_str(&data_json)?));
        }
        Ok(docs)
    }

    fn get_document(&self, collection_path: &str, id: &str) -> Result<Option<Document>> {
        let data = self.read_data(&document_path(collection_path, id))?;
        Ok(data.map(|data| Document::new(id, data)))
    }

    fn commit(&self, ops: &[WriteOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        self.begin_transaction()?;
        for op in ops {
            if let Err(e) = self.apply(op) {
                return Err(self.abort_transaction(e));
            }
        }
        self.commit_transaction()
    }

    fn has_children(&self, collection: &str, parent_id: &str, sub: &str) -> Result<bool> {
        let parent_path = child_collection_path(collection, parent_id, sub);
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE parent_path = ?1)",
            params![parent_path],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') {
        return Err(SubcollectError::InvalidPath(format!(
            "document id '{id}' must be non-empty and contain no '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::fields;
    use serde_json::json;

    fn create_child(parent_id: &str, child_id: &str, data: serde_json::Value) -> WriteOp {
        WriteOp::CreateChild {
            parent_collection: "dogs".into(),
            parent_id: parent_id.into(),
            subcollection: "health_tests".into(),
            child_id: child_id.into(),
            data: fields(data),
        }
    }

    #[test]
    fn test_put_and_get_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_document("dogs", "dog-1", &fields(json!({ "name": "Rex" })))
            .unwrap();

        let doc = store.get_document("dogs", "dog-1").unwrap().unwrap();
        assert_eq!(doc.id, "dog-1");
        assert_eq!(doc.data["name"], "Rex");
        assert!(store.get_document("dogs", "dog-2").unwrap().is_none());
    }

    #[test]
    fn test_list_documents_is_scoped_to_collection() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_document("dogs", "b", &fields(json!({}))).unwrap();
        store.put_document("dogs", "a", &fields(json!({}))).unwrap();
        store
            .put_document("dogs/a/health_tests", "t1", &fields(json!({})))
            .unwrap();

        let ids: Vec<String> = store
            .list_documents("dogs")
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.list_children("dogs", "a", "health_tests").unwrap().len(), 1);
        assert_eq!(store.count_documents("dogs").unwrap(), 2);
    }

    #[test]
    fn test_has_children() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.has_children("dogs", "dog-1", "health_tests").unwrap());

        store.commit(&[create_child("dog-1", "t1", json!({ "type": "OFA" }))]).unwrap();
        assert!(store.has_children("dogs", "dog-1", "health_tests").unwrap());
        assert!(!store.has_children("dogs", "dog-2", "health_tests").unwrap());
    }

    #[test]
    fn test_update_parent_merges_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_document("litters", "l1", &fields(json!({ "name": "A", "puppyCount": 1 })))
            .unwrap();

        store
            .commit(&[WriteOp::UpdateParent {
                collection: "litters".into(),
                id: "l1".into(),
                fields: fields(json!({ "puppyCount": 2, "maleCount": 1 })),
            }])
            .unwrap();

        let doc = store.get_document("litters", "l1").unwrap().unwrap();
        assert_eq!(doc.data["name"], "A");
        assert_eq!(doc.data["puppyCount"], 2);
        assert_eq!(doc.data["maleCount"], 1);
    }

    #[test]
    fn test_delete_field_keeps_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put_document("litters", "l2", &fields(json!({ "name": "B", "expenses": [] })))
            .unwrap();

        store
            .commit(&[WriteOp::DeleteField {
                collection: "litters".into(),
                id: "l2".into(),
                field: "expenses".into(),
            }])
            .unwrap();

        let doc = store.get_document("litters", "l2").unwrap().unwrap();
        assert!(doc.get("expenses").is_none());
        assert_eq!(doc.data["name"], "B");
    }

    #[test]
    fn test_update_missing_parent_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.commit(&[WriteOp::UpdateParent {
            collection: "litters".into(),
            id: "ghost".into(),
            fields: fields(json!({ "puppyCount": 0 })),
        }]);
        assert!(matches!(result, Err(SubcollectError::NotFound { .. })));
    }

    #[test]
    fn test_commit_rolls_back_whole_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit(&[create_child("dog-1", "t1", json!({}))]).unwrap();

        // Second op collides with the existing child, so the first must not land either.
        let result = store.commit(&[
            create_child("dog-1", "t2", json!({})),
            create_child("dog-1", "t1", json!({})),
        ]);
        assert!(result.is_err());

        let children = store.list_children("dogs", "dog-1", "health_tests").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "t1");
    }

    #[test]
    fn test_failed_rollback_keeps_original_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        // No transaction is open, so ROLLBACK itself fails.
        let err = store.abort_transaction(SubcollectError::NotFound {
            path: "litters/ghost".into(),
        });
        assert!(matches!(err, SubcollectError::NotFound { path } if path == "litters/ghost"));
    }

    #[test]
    fn test_rejects_ids_with_slashes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.put_document("dogs", "a/b", &fields(json!({})));
        assert!(matches!(result, Err(SubcollectError::InvalidPath(_))));
    }

    #[test]
    fn test_open_on_disk_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_document("dogs", "dog-1", &fields(json!({ "name": "Rex" }))).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_documents("dogs").unwrap(), 1);
    }
}
