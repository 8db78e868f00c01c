use std::cell::RefCell;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use super::DurableStore;
use crate::cache::CacheSnapshot;
use crate::error::StoreError;
use crate::queue::PendingMutationRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    client_mutation_id TEXT NOT NULL UNIQUE,
    record TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS cache_snapshot (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    snapshot TEXT NOT NULL
);
";

/// Outbox and snapshot in a SQLite database. Calls run synchronously on the engine's thread.
pub struct SqliteStore {
    conn: RefCell<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: RefCell::new(conn),
        })
    }
}

impl DurableStore for SqliteStore {
    async fn put_pending(&self, record: &PendingMutationRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.conn.borrow().execute(
            "INSERT INTO pending_mutations (client_mutation_id, record) VALUES (?1, ?2)
             ON CONFLICT(client_mutation_id) DO UPDATE SET record = excluded.record",
            params![record.client_mutation_id, json],
        )?;
        Ok(())
    }

    async fn delete_pending(&self, client_mutation_id: &str) -> Result<(), StoreError> {
        self.conn.borrow().execute(
            "DELETE FROM pending_mutations WHERE client_mutation_id = ?1",
            params![client_mutation_id],
        )?;
        Ok(())
    }

    async fn all_pending(&self) -> Result<Vec<PendingMutationRecord>, StoreError> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare("SELECT record FROM pending_mutations ORDER BY seq")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str(&json) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Skipping unreadable pending mutation row: {e}"),
            }
        }
        Ok(records)
    }

    async fn put_snapshot(&self, snapshot: &CacheSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot)?;
        self.conn.borrow().execute(
            "INSERT INTO cache_snapshot (id, snapshot) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET snapshot = excluded.snapshot",
            params![json],
        )?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Option<CacheSnapshot>, StoreError> {
        let json: Option<String> = self
            .conn
            .borrow()
            .query_row(
                "SELECT snapshot FROM cache_snapshot WHERE id = 0",
                [],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Operation;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: &str, state: &str) -> PendingMutationRecord {
        PendingMutationRecord {
            client_mutation_id: id.to_string(),
            operation: Operation::new("UpdatePatient", "mutation UpdatePatient"),
            variables: json!({ "id": "p1", "data": { "state": state } }),
            plan_key: "UpdatePatient".to_string(),
            entity_type: Some("Patient".to_string()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_original_position() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_pending(&record("a", "WAIT")).await.unwrap();
        store.put_pending(&record("b", "WAIT")).await.unwrap();
        store.put_pending(&record("a", "ADMITTED")).await.unwrap();

        let pending = store.all_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].client_mutation_id, "a");
        assert_eq!(pending[0].variables["data"]["state"], json!("ADMITTED"));

        store.delete_pending("a").await.unwrap();
        assert_eq!(store.all_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_slot_is_single_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.snapshot().await.unwrap().is_none());

        store.put_snapshot(&CacheSnapshot::default()).await.unwrap();
        store.put_snapshot(&CacheSnapshot::default()).await.unwrap();
        assert_eq!(
            store.snapshot().await.unwrap(),
            Some(CacheSnapshot::default())
        );
    }
}
