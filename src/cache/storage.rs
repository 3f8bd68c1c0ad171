//! Durable local store traits and SQLite implementation.
//!
//! The store keeps one collection per entity type, keyed by id, and the
//! ordered list of queued sync operations. Both survive process restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::is_temp_id;
use crate::error::{Error, Result};
use crate::sync::{OperationKind, OperationStatus, SyncOperation};

/// Per-entity-type key/value mirror used for offline reads and staged writes.
#[async_trait]
pub trait EntityStore: Send + Sync {
  /// Get a single record. Missing records are `None`, never an error.
  async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Value>>;

  /// Get every record of a type, ordered by id.
  async fn get_all(&self, entity_type: &str) -> Result<Vec<Value>>;

  /// Insert or overwrite a record.
  async fn put(&self, entity_type: &str, id: &str, data: &Value) -> Result<()>;

  /// Remove a record. Removing a missing record is a no-op.
  async fn delete(&self, entity_type: &str, id: &str) -> Result<()>;

  /// Mirror a complete remote listing: upsert every record and drop stored
  /// records the listing no longer contains. Records with temporary ids are
  /// kept, they are pending creates the server has not seen yet.
  async fn replace_all(&self, entity_type: &str, records: &[(String, Value)]) -> Result<()>;
}

/// Persistence for the sync queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
  /// All operations, in enqueue order.
  async fn load_operations(&self) -> Result<Vec<SyncOperation>>;

  /// Append a new operation.
  async fn insert_operation(&self, op: &SyncOperation) -> Result<()>;

  /// Persist changes to an existing operation.
  async fn update_operation(&self, op: &SyncOperation) -> Result<()>;

  /// Remove an operation. Removing a missing operation is a no-op.
  async fn remove_operation(&self, id: &str) -> Result<()>;

  /// Remember that the server assigned `server_id` to the record created
  /// under `temp_id`.
  async fn record_alias(&self, temp_id: &str, server_id: &str) -> Result<()>;

  /// Server id that replaced a temporary id, if its create was replayed.
  async fn resolve_alias(&self, temp_id: &str) -> Result<Option<String>>;
}

/// Everything the accessor and replay engine need from local persistence.
pub trait LocalStore: EntityStore + QueueStore {}

impl<S: EntityStore + QueueStore> LocalStore for S {}

/// SQLite-based local store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create store directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("resync").join("store.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for store tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run store migrations: {}", e)))?;
    Ok(())
  }
}

/// Schema for store tables.
const STORE_SCHEMA: &str = r#"
-- Local mirror of remote entities (serialized JSON)
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_id)
);

-- Pending offline mutations; seq gives the replay order
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    last_error TEXT,
    next_attempt_at TEXT,
    idempotency_key TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_type ON sync_queue(entity_type, seq);

-- Temporary ids of replayed creates and the server ids that replaced them
CREATE TABLE IF NOT EXISTS id_aliases (
    temp_id TEXT PRIMARY KEY,
    server_id TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn updated_at_of(data: &Value) -> Option<String> {
  data
    .get("updatedAt")
    .or_else(|| data.get("updated_at"))
    .and_then(Value::as_str)
    .map(String::from)
}

fn upsert_entity(conn: &Connection, entity_type: &str, id: &str, data: &Value) -> Result<()> {
  let bytes = serde_json::to_vec(data)?;
  conn.execute(
    "INSERT OR REPLACE INTO entities (entity_type, entity_id, data, updated_at, stored_at)
     VALUES (?, ?, ?, ?, datetime('now'))",
    params![entity_type, id, bytes, updated_at_of(data)],
  )?;
  Ok(())
}

#[async_trait]
impl EntityStore for SqliteStorage {
  async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Value>> {
    let conn = self.lock()?;
    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM entities WHERE entity_type = ? AND entity_id = ?",
        params![entity_type, id],
        |row| row.get(0),
      )
      .optional()?;

    data
      .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
      .transpose()
  }

  async fn get_all(&self, entity_type: &str) -> Result<Vec<Value>> {
    let conn = self.lock()?;
    let mut stmt =
      conn.prepare("SELECT data FROM entities WHERE entity_type = ? ORDER BY entity_id")?;

    let rows: Vec<Vec<u8>> = stmt
      .query_map(params![entity_type], |row| row.get(0))?
      .collect::<rusqlite::Result<_>>()?;

    rows
      .iter()
      .map(|bytes| serde_json::from_slice(bytes).map_err(Error::from))
      .collect()
  }

  async fn put(&self, entity_type: &str, id: &str, data: &Value) -> Result<()> {
    let conn = self.lock()?;
    upsert_entity(&conn, entity_type, id, data)
  }

  async fn delete(&self, entity_type: &str, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM entities WHERE entity_type = ? AND entity_id = ?",
      params![entity_type, id],
    )?;
    Ok(())
  }

  async fn replace_all(&self, entity_type: &str, records: &[(String, Value)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn.transaction()?;

    let keep: HashSet<&str> = records.iter().map(|(id, _)| id.as_str()).collect();
    let existing: Vec<String> = {
      let mut stmt = tx.prepare("SELECT entity_id FROM entities WHERE entity_type = ?")?;
      let ids: Vec<String> = stmt
        .query_map(params![entity_type], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
      ids
    };

    for id in existing {
      if !keep.contains(id.as_str()) && !is_temp_id(&id) {
        tx.execute(
          "DELETE FROM entities WHERE entity_type = ? AND entity_id = ?",
          params![entity_type, id],
        )?;
      }
    }

    for (id, data) in records {
      upsert_entity(&tx, entity_type, id, data)?;
    }

    tx.commit()?;
    Ok(())
  }
}

const OPERATION_COLUMNS: &str = "seq, id, entity_type, kind, target_id, payload, created_at, \
  retry_count, status, last_error, next_attempt_at, idempotency_key";

fn operation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawOperation> {
  Ok(RawOperation {
    seq: row.get(0)?,
    id: row.get(1)?,
    entity_type: row.get(2)?,
    kind: row.get(3)?,
    target_id: row.get(4)?,
    payload: row.get(5)?,
    created_at: row.get(6)?,
    retry_count: row.get(7)?,
    status: row.get(8)?,
    last_error: row.get(9)?,
    next_attempt_at: row.get(10)?,
    idempotency_key: row.get(11)?,
  })
}

/// Row as stored, before parsing the text columns.
struct RawOperation {
  seq: i64,
  id: String,
  entity_type: String,
  kind: String,
  target_id: String,
  payload: Vec<u8>,
  created_at: String,
  retry_count: i64,
  status: String,
  last_error: Option<String>,
  next_attempt_at: Option<String>,
  idempotency_key: String,
}

impl RawOperation {
  fn parse(self) -> Result<SyncOperation> {
    let kind = OperationKind::parse(&self.kind)
      .ok_or_else(|| Error::Storage(format!("Unknown operation kind '{}'", self.kind)))?;
    let status = OperationStatus::parse(&self.status)
      .ok_or_else(|| Error::Storage(format!("Unknown operation status '{}'", self.status)))?;

    Ok(SyncOperation {
      id: self.id,
      seq: self.seq as u64,
      entity_type: self.entity_type,
      kind,
      target_id: self.target_id,
      payload: serde_json::from_slice(&self.payload)?,
      created_at: parse_datetime(&self.created_at)?,
      retry_count: self.retry_count as u32,
      status,
      last_error: self.last_error,
      next_attempt_at: self
        .next_attempt_at
        .as_deref()
        .map(parse_datetime)
        .transpose()?,
      idempotency_key: self.idempotency_key,
    })
  }
}

#[async_trait]
impl QueueStore for SqliteStorage {
  async fn load_operations(&self) -> Result<Vec<SyncOperation>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM sync_queue ORDER BY seq",
      OPERATION_COLUMNS
    ))?;

    let rows: Vec<RawOperation> = stmt
      .query_map([], operation_from_row)?
      .collect::<rusqlite::Result<_>>()?;

    rows.into_iter().map(RawOperation::parse).collect()
  }

  async fn insert_operation(&self, op: &SyncOperation) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      &format!(
        "INSERT INTO sync_queue ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        OPERATION_COLUMNS
      ),
      params![
        op.seq as i64,
        op.id,
        op.entity_type,
        op.kind.as_str(),
        op.target_id,
        serde_json::to_vec(&op.payload)?,
        op.created_at.to_rfc3339(),
        op.retry_count as i64,
        op.status.as_str(),
        op.last_error,
        op.next_attempt_at.map(|t| t.to_rfc3339()),
        op.idempotency_key,
      ],
    )?;
    Ok(())
  }

  async fn update_operation(&self, op: &SyncOperation) -> Result<()> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "UPDATE sync_queue
       SET target_id = ?, payload = ?, retry_count = ?, status = ?, last_error = ?,
           next_attempt_at = ?
       WHERE id = ?",
      params![
        op.target_id,
        serde_json::to_vec(&op.payload)?,
        op.retry_count as i64,
        op.status.as_str(),
        op.last_error,
        op.next_attempt_at.map(|t| t.to_rfc3339()),
        op.id,
      ],
    )?;

    if changed == 0 {
      return Err(Error::OperationNotFound(op.id.clone()));
    }
    Ok(())
  }

  async fn remove_operation(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id])?;
    Ok(())
  }

  async fn record_alias(&self, temp_id: &str, server_id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO id_aliases (temp_id, server_id, created_at)
       VALUES (?, ?, datetime('now'))",
      params![temp_id, server_id],
    )?;
    Ok(())
  }

  async fn resolve_alias(&self, temp_id: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let server_id: Option<String> = conn
      .query_row(
        "SELECT server_id FROM id_aliases WHERE temp_id = ?",
        params![temp_id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(server_id)
  }
}

/// Parse an RFC 3339 timestamp as written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  fn op(seq: u64, id: &str) -> SyncOperation {
    SyncOperation {
      id: id.to_string(),
      seq,
      entity_type: "product".to_string(),
      kind: OperationKind::Update,
      target_id: "p1".to_string(),
      payload: json!({"id": "p1", "price": seq}),
      created_at: Utc::now(),
      retry_count: 0,
      status: OperationStatus::Pending,
      last_error: None,
      next_attempt_at: None,
      idempotency_key: format!("key-{}", id),
    }
  }

  #[tokio::test]
  async fn test_get_missing_is_none() {
    let s = store();
    assert_eq!(s.get("product", "nope").await.unwrap(), None);
    assert!(s.get_all("product").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_put_overwrites_by_id() {
    let s = store();
    s.put("product", "p1", &json!({"id": "p1", "price": 1}))
      .await
      .unwrap();
    s.put("product", "p1", &json!({"id": "p1", "price": 2}))
      .await
      .unwrap();

    let all = s.get_all("product").await.unwrap();
    assert_eq!(all, vec![json!({"id": "p1", "price": 2})]);
  }

  #[tokio::test]
  async fn test_types_are_separate_collections() {
    let s = store();
    s.put("product", "1", &json!({"id": "1"})).await.unwrap();
    s.put("order", "1", &json!({"id": "1", "total": 5}))
      .await
      .unwrap();

    assert_eq!(s.get_all("product").await.unwrap().len(), 1);
    assert_eq!(
      s.get("order", "1").await.unwrap(),
      Some(json!({"id": "1", "total": 5}))
    );
  }

  #[tokio::test]
  async fn test_delete_missing_is_noop() {
    let s = store();
    s.delete("product", "ghost").await.unwrap();
  }

  #[tokio::test]
  async fn test_replace_all_keeps_temp_records() {
    let s = store();
    s.put("product", "old", &json!({"id": "old"})).await.unwrap();
    s.put("product", "tmp_abc", &json!({"id": "tmp_abc"}))
      .await
      .unwrap();

    s.replace_all("product", &[("new".to_string(), json!({"id": "new"}))])
      .await
      .unwrap();

    assert_eq!(s.get("product", "old").await.unwrap(), None);
    assert!(s.get("product", "tmp_abc").await.unwrap().is_some());
    assert!(s.get("product", "new").await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_queue_roundtrip_preserves_order() {
    let s = store();
    s.insert_operation(&op(2, "b")).await.unwrap();
    s.insert_operation(&op(1, "a")).await.unwrap();

    let mut a = op(1, "a");
    a.status = OperationStatus::Failed;
    a.retry_count = 4;
    a.last_error = Some("boom".to_string());
    s.update_operation(&a).await.unwrap();

    let ops = s.load_operations().await.unwrap();
    let ids: Vec<&str> = ops.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(ops[0].status, OperationStatus::Failed);
    assert_eq!(ops[0].retry_count, 4);
    assert_eq!(ops[0].last_error.as_deref(), Some("boom"));

    assert_eq!(ops[0].idempotency_key, "key-a");

    s.remove_operation("a").await.unwrap();
    assert_eq!(s.load_operations().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_aliases_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let s = SqliteStorage::open_at(&path).unwrap();
      assert_eq!(s.resolve_alias("tmp_a").await.unwrap(), None);
      s.record_alias("tmp_a", "41").await.unwrap();
    }

    let s = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(s.resolve_alias("tmp_a").await.unwrap().as_deref(), Some("41"));
    assert_eq!(s.resolve_alias("tmp_b").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_update_missing_operation_errors() {
    let s = store();
    let err = s.update_operation(&op(1, "ghost")).await.unwrap_err();
    assert_eq!(err, Error::OperationNotFound("ghost".to_string()));
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let s = SqliteStorage::open_at(&path).unwrap();
      s.put("product", "p1", &json!({"id": "p1"})).await.unwrap();
      s.insert_operation(&op(1, "a")).await.unwrap();
    }

    let s = SqliteStorage::open_at(&path).unwrap();
    assert!(s.get("product", "p1").await.unwrap().is_some());
    assert_eq!(s.load_operations().await.unwrap()[0].id, "a");
  }
}
