//! Ordered queue of pending offline mutations.
//!
//! Operations live in one lane per entity type, ordered by `seq`. Writes are
//! append-only at the tail of a lane; operations leave the queue only by
//! explicit removal after a successful replay or a manual discard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{is_temp_id, QueueStore};
use crate::error::{Error, Result};

/// What a queued operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(OperationKind::Create),
      "update" => Some(OperationKind::Update),
      "delete" => Some(OperationKind::Delete),
      _ => None,
    }
  }
}

/// Replay status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
  /// Waiting for the next drain
  Pending,
  /// Being sent to the remote
  Inflight,
  /// Hit the retry ceiling; needs manual resolution
  Failed,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationStatus::Pending => "pending",
      OperationStatus::Inflight => "inflight",
      OperationStatus::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(OperationStatus::Pending),
      "inflight" => Some(OperationStatus::Inflight),
      "failed" => Some(OperationStatus::Failed),
      _ => None,
    }
  }
}

/// A mutation issued while offline, waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
  pub id: String,
  /// Position in the queue; replay order within a lane
  pub seq: u64,
  pub entity_type: String,
  pub kind: OperationKind,
  /// The entity snapshot (create/update) or an empty object (delete)
  pub payload: Value,
  /// Id of the entity the operation applies to; a temporary id for creates
  pub target_id: String,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: OperationStatus,
  pub last_error: Option<String>,
  /// Earliest time the next replay may be attempted
  pub next_attempt_at: Option<DateTime<Utc>>,
  /// Sent with every replay attempt. Carries over the key of an online
  /// attempt whose outcome is unknown.
  pub idempotency_key: String,
}

impl SyncOperation {
  /// Whether the operation may be attempted at `now`.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

#[derive(Default)]
struct QueueState {
  lanes: BTreeMap<String, VecDeque<SyncOperation>>,
  next_seq: u64,
}

impl QueueState {
  fn find_mut(&mut self, id: &str) -> Option<&mut SyncOperation> {
    self
      .lanes
      .values_mut()
      .flat_map(|lane| lane.iter_mut())
      .find(|op| op.id == id)
  }

  fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
    self.lanes.values().flat_map(|lane| lane.iter())
  }
}

/// Persisted FIFO of offline mutations, one lane per entity type.
pub struct SyncQueue<S> {
  store: Arc<S>,
  state: Mutex<QueueState>,
  enqueued: Notify,
}

impl<S: QueueStore> SyncQueue<S> {
  /// Load the queue from `store`.
  ///
  /// Operations persisted as in flight belonged to a replay that never
  /// finished; they go back to pending.
  pub async fn open(store: Arc<S>) -> Result<Self> {
    let mut state = QueueState::default();

    for mut op in store.load_operations().await? {
      if op.status == OperationStatus::Inflight {
        op.status = OperationStatus::Pending;
        store.update_operation(&op).await?;
      }
      state.next_seq = state.next_seq.max(op.seq + 1);
      state
        .lanes
        .entry(op.entity_type.clone())
        .or_default()
        .push_back(op);
    }

    let queued: usize = state.lanes.values().map(VecDeque::len).sum();
    if queued > 0 {
      info!(queued, "Loaded sync queue");
    }

    Ok(Self {
      store,
      state: Mutex::new(state),
      enqueued: Notify::new(),
    })
  }

  /// Append an operation at the tail of its entity type's lane. The
  /// operation is persisted before it becomes visible.
  pub async fn enqueue(
    &self,
    kind: OperationKind,
    entity_type: &str,
    payload: Value,
    target_id: &str,
  ) -> Result<String> {
    self
      .enqueue_with_key(kind, entity_type, payload, target_id, None)
      .await
  }

  /// [`enqueue`](Self::enqueue) with the idempotency key replay must send.
  /// Without one the operation id is used.
  ///
  /// Temporary ids whose create was already replayed are replaced by their
  /// server ids, in the target and inside the payload.
  pub async fn enqueue_with_key(
    &self,
    kind: OperationKind,
    entity_type: &str,
    mut payload: Value,
    target_id: &str,
    idempotency_key: Option<String>,
  ) -> Result<String> {
    let target_id = self.resolve_id(target_id).await?;
    self.resolve_refs(&mut payload).await?;

    let mut state = self.state.lock().await;
    let id = Uuid::new_v4().to_string();
    let op = SyncOperation {
      idempotency_key: idempotency_key.unwrap_or_else(|| id.clone()),
      id,
      seq: state.next_seq,
      entity_type: entity_type.to_string(),
      kind,
      payload,
      target_id,
      created_at: Utc::now(),
      retry_count: 0,
      status: OperationStatus::Pending,
      last_error: None,
      next_attempt_at: None,
    };

    self.store.insert_operation(&op).await?;
    state.next_seq += 1;

    debug!(
      id = %op.id,
      entity_type,
      kind = op.kind.as_str(),
      target = %op.target_id,
      "Queued offline operation"
    );
    let id = op.id.clone();
    state.lanes.entry(op.entity_type.clone()).or_default().push_back(op);
    drop(state);

    self.enqueued.notify_one();
    Ok(id)
  }

  /// Completes once an operation has been enqueued. An enqueue that
  /// happened while nobody was waiting completes the next call at once.
  pub async fn enqueued(&self) {
    self.enqueued.notified().await
  }

  /// The server id for `id` if it is a temporary id whose create was
  /// already replayed, otherwise `id` itself.
  pub async fn resolve_id(&self, id: &str) -> Result<String> {
    if !is_temp_id(id) {
      return Ok(id.to_string());
    }
    Ok(
      self
        .store
        .resolve_alias(id)
        .await?
        .unwrap_or_else(|| id.to_string()),
    )
  }

  /// Replace every replayed temporary id inside `value` with its server id.
  /// Returns whether anything changed.
  pub async fn resolve_refs(&self, value: &mut Value) -> Result<bool> {
    let mut mentioned = Vec::new();
    temp_ids_in(value, &mut mentioned);

    let mut changed = false;
    for temp_id in mentioned {
      if let Some(server_id) = self.store.resolve_alias(&temp_id).await? {
        changed |= rewrite_id(value, &temp_id, &server_id);
      }
    }
    Ok(changed)
  }

  /// Number of queued operations, failed ones included.
  pub async fn len(&self) -> usize {
    self.state.lock().await.iter().count()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Every queued operation, in enqueue order.
  pub async fn operations(&self) -> Vec<SyncOperation> {
    let state = self.state.lock().await;
    let mut ops: Vec<SyncOperation> = state.iter().cloned().collect();
    ops.sort_by_key(|op| op.seq);
    ops
  }

  /// Operations that hit the retry ceiling and wait for manual resolution.
  pub async fn failed(&self) -> Vec<SyncOperation> {
    self
      .operations()
      .await
      .into_iter()
      .filter(|op| op.status == OperationStatus::Failed)
      .collect()
  }

  pub async fn get(&self, id: &str) -> Option<SyncOperation> {
    self.state.lock().await.iter().find(|op| op.id == id).cloned()
  }

  /// Entity types with at least one queued operation.
  pub async fn entity_types(&self) -> Vec<String> {
    self.state.lock().await.lanes.keys().cloned().collect()
  }

  /// Ids of the operations in one lane, in replay order.
  pub async fn lane(&self, entity_type: &str) -> Vec<String> {
    self
      .state
      .lock()
      .await
      .lanes
      .get(entity_type)
      .map(|lane| lane.iter().map(|op| op.id.clone()).collect())
      .unwrap_or_default()
  }

  /// Whether any queued operation targets this entity.
  pub async fn has_pending_for(&self, entity_type: &str, id: &str) -> bool {
    self
      .state
      .lock()
      .await
      .lanes
      .get(entity_type)
      .is_some_and(|lane| lane.iter().any(|op| op.target_id == id))
  }

  /// Temporary ids whose create has not been replayed yet.
  pub async fn unsynced_temp_ids(&self) -> HashSet<String> {
    self
      .state
      .lock()
      .await
      .iter()
      .filter(|op| op.kind == OperationKind::Create && is_temp_id(&op.target_id))
      .map(|op| op.target_id.clone())
      .collect()
  }

  /// Earliest future time at which a rescheduled operation becomes due.
  pub async fn next_due(&self) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    self
      .state
      .lock()
      .await
      .iter()
      .filter(|op| op.status == OperationStatus::Pending)
      .filter_map(|op| op.next_attempt_at)
      .filter(|at| *at > now)
      .min()
  }

  /// Persist changes to an existing operation.
  pub async fn update(&self, op: &SyncOperation) -> Result<()> {
    let mut state = self.state.lock().await;
    let slot = state
      .find_mut(&op.id)
      .ok_or_else(|| Error::OperationNotFound(op.id.clone()))?;
    self.store.update_operation(op).await?;
    *slot = op.clone();
    Ok(())
  }

  /// Remove an operation, returning it if it was queued.
  pub async fn remove(&self, id: &str) -> Result<Option<SyncOperation>> {
    let mut state = self.state.lock().await;
    self.store.remove_operation(id).await?;

    let mut removed = None;
    for lane in state.lanes.values_mut() {
      if let Some(pos) = lane.iter().position(|op| op.id == id) {
        removed = lane.remove(pos);
        break;
      }
    }
    state.lanes.retain(|_, lane| !lane.is_empty());
    Ok(removed)
  }

  /// Replace every reference to `temp_id` in queued operations (targets and
  /// payloads, across all lanes) with `server_id`. Returns the operations
  /// that changed.
  ///
  /// The mapping is persisted so callers still holding the temporary id can
  /// be resolved later.
  pub async fn remap_id(&self, temp_id: &str, server_id: &str) -> Result<Vec<SyncOperation>> {
    let mut state = self.state.lock().await;
    self.store.record_alias(temp_id, server_id).await?;
    let mut changed = Vec::new();

    for op in state.lanes.values_mut().flat_map(|lane| lane.iter_mut()) {
      let mut touched = rewrite_id(&mut op.payload, temp_id, server_id);
      if op.target_id == temp_id {
        op.target_id = server_id.to_string();
        touched = true;
      }
      if touched {
        self.store.update_operation(op).await?;
        changed.push(op.clone());
      }
    }

    if !changed.is_empty() {
      debug!(temp_id, server_id, changed = changed.len(), "Remapped queued operations");
    }
    Ok(changed)
  }

  /// Put a failed operation back in line with a fresh retry budget.
  pub async fn retry_failed(&self, id: &str) -> Result<()> {
    let mut state = self.state.lock().await;
    let op = state
      .find_mut(id)
      .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

    op.status = OperationStatus::Pending;
    op.retry_count = 0;
    op.next_attempt_at = None;
    self.store.update_operation(op).await
  }

  /// Drop an operation without replaying it.
  pub async fn discard(&self, id: &str) -> Result<SyncOperation> {
    let op = self
      .remove(id)
      .await?
      .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
    info!(id, entity_type = %op.entity_type, kind = op.kind.as_str(), "Discarded queued operation");
    Ok(op)
  }
}

/// Replace every string equal to `from` inside `value` with `to`.
pub(crate) fn rewrite_id(value: &mut Value, from: &str, to: &str) -> bool {
  match value {
    Value::String(s) if s == from => {
      *s = to.to_string();
      true
    }
    Value::Array(items) => items
      .iter_mut()
      .fold(false, |acc, item| rewrite_id(item, from, to) || acc),
    Value::Object(map) => map
      .values_mut()
      .fold(false, |acc, item| rewrite_id(item, from, to) || acc),
    _ => false,
  }
}

/// Every temporary id mentioned anywhere inside `value`.
pub(crate) fn temp_ids_in(value: &Value, out: &mut Vec<String>) {
  match value {
    Value::String(s) if is_temp_id(s) => out.push(s.clone()),
    Value::Array(items) => items.iter().for_each(|item| temp_ids_in(item, out)),
    Value::Object(map) => map.values().for_each(|item| temp_ids_in(item, out)),
    _ => {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use serde_json::json;

  async fn queue() -> (Arc<SqliteStorage>, SyncQueue<SqliteStorage>) {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let queue = SyncQueue::open(Arc::clone(&store)).await.unwrap();
    (store, queue)
  }

  #[test]
  fn test_rewrite_id_is_deep() {
    let mut v = json!({
      "id": "tmp_1",
      "lines": [{"product": "tmp_1"}, {"product": "42"}],
      "note": "tmp_1 is not rewritten inside longer text"
    });
    assert!(rewrite_id(&mut v, "tmp_1", "99"));
    assert_eq!(v["id"], "99");
    assert_eq!(v["lines"][0]["product"], "99");
    assert_eq!(v["lines"][1]["product"], "42");
    assert!(!rewrite_id(&mut v, "tmp_1", "99"));
  }

  #[test]
  fn test_temp_ids_in_collects_nested() {
    let v = json!({"a": "tmp_x", "b": ["1", {"c": "tmp_y"}]});
    let mut ids = Vec::new();
    temp_ids_in(&v, &mut ids);
    ids.sort();
    assert_eq!(ids, vec!["tmp_x".to_string(), "tmp_y".to_string()]);
  }

  #[tokio::test]
  async fn test_enqueue_persists_in_order() {
    let (store, q) = queue().await;
    let a = q
      .enqueue(OperationKind::Create, "product", json!({"id": "tmp_a"}), "tmp_a")
      .await
      .unwrap();
    let b = q
      .enqueue(OperationKind::Update, "product", json!({"id": "tmp_a", "price": 10}), "tmp_a")
      .await
      .unwrap();

    assert_eq!(q.lane("product").await, vec![a.clone(), b.clone()]);

    let reopened = SyncQueue::open(store).await.unwrap();
    let ops = reopened.operations().await;
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].id, a);
    assert_eq!(ops[1].id, b);
    assert!(ops[0].seq < ops[1].seq);
  }

  #[tokio::test]
  async fn test_reopen_resets_inflight() {
    let (store, q) = queue().await;
    let id = q
      .enqueue(OperationKind::Delete, "product", json!({}), "7")
      .await
      .unwrap();
    let mut op = q.get(&id).await.unwrap();
    op.status = OperationStatus::Inflight;
    q.update(&op).await.unwrap();

    let reopened = SyncQueue::open(store).await.unwrap();
    assert_eq!(
      reopened.get(&id).await.unwrap().status,
      OperationStatus::Pending
    );

    // New ids continue after the loaded ones
    let next = reopened
      .enqueue(OperationKind::Delete, "product", json!({}), "8")
      .await
      .unwrap();
    assert!(reopened.get(&next).await.unwrap().seq > op.seq);
  }

  #[tokio::test]
  async fn test_remap_rewrites_targets_and_payloads_across_lanes() {
    let (_, q) = queue().await;
    q.enqueue(OperationKind::Create, "product", json!({"id": "tmp_p"}), "tmp_p")
      .await
      .unwrap();
    let update = q
      .enqueue(OperationKind::Update, "product", json!({"id": "tmp_p", "price": 3}), "tmp_p")
      .await
      .unwrap();
    let order = q
      .enqueue(OperationKind::Create, "order", json!({"id": "tmp_o", "product": "tmp_p"}), "tmp_o")
      .await
      .unwrap();

    assert_eq!(q.remap_id("tmp_p", "100").await.unwrap().len(), 3);

    let update = q.get(&update).await.unwrap();
    assert_eq!(update.target_id, "100");
    assert_eq!(update.payload["id"], "100");
    assert_eq!(q.get(&order).await.unwrap().payload["product"], "100");
    assert!(q.has_pending_for("product", "100").await);
    assert!(!q.has_pending_for("product", "tmp_p").await);
  }

  #[tokio::test]
  async fn test_enqueue_after_remap_uses_server_id() {
    let (store, q) = queue().await;
    let create = q
      .enqueue(OperationKind::Create, "product", json!({"id": "tmp_p"}), "tmp_p")
      .await
      .unwrap();
    q.remove(&create).await.unwrap();
    q.remap_id("tmp_p", "100").await.unwrap();

    let update = q
      .enqueue(OperationKind::Update, "product", json!({"id": "tmp_p", "price": 4}), "tmp_p")
      .await
      .unwrap();
    let order = q
      .enqueue(OperationKind::Create, "order", json!({"id": "tmp_o", "product": "tmp_p"}), "tmp_o")
      .await
      .unwrap();

    let update = q.get(&update).await.unwrap();
    assert_eq!(update.target_id, "100");
    assert_eq!(update.payload["id"], "100");
    let order = q.get(&order).await.unwrap();
    assert_eq!(order.target_id, "tmp_o");
    assert_eq!(order.payload, json!({"id": "tmp_o", "product": "100"}));

    // The mapping outlives the queue
    let reopened = SyncQueue::open(store).await.unwrap();
    assert_eq!(reopened.resolve_id("tmp_p").await.unwrap(), "100");
    assert_eq!(reopened.resolve_id("tmp_x").await.unwrap(), "tmp_x");
    assert_eq!(reopened.resolve_id("7").await.unwrap(), "7");
  }

  #[tokio::test]
  async fn test_idempotency_key_defaults_to_operation_id() {
    let (store, q) = queue().await;
    let plain = q
      .enqueue(OperationKind::Delete, "product", json!({}), "1")
      .await
      .unwrap();
    let keyed = q
      .enqueue_with_key(OperationKind::Delete, "product", json!({}), "2", Some("k-2".to_string()))
      .await
      .unwrap();

    assert_eq!(q.get(&plain).await.unwrap().idempotency_key, plain);
    let reopened = SyncQueue::open(store).await.unwrap();
    assert_eq!(reopened.get(&keyed).await.unwrap().idempotency_key, "k-2");
  }

  #[tokio::test]
  async fn test_enqueue_wakes_waiter() {
    let (_, q) = queue().await;
    let q = Arc::new(q);

    let waiter = tokio::spawn({
      let q = Arc::clone(&q);
      async move { q.enqueued().await }
    });
    tokio::task::yield_now().await;
    q.enqueue(OperationKind::Delete, "product", json!({}), "1")
      .await
      .unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
      .await
      .unwrap()
      .unwrap();

    // Nobody waiting: the next call completes at once
    q.enqueue(OperationKind::Delete, "product", json!({}), "2")
      .await
      .unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(1), q.enqueued())
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_failed_ops_are_listed_and_retryable() {
    let (_, q) = queue().await;
    let id = q
      .enqueue(OperationKind::Update, "product", json!({"id": "1"}), "1")
      .await
      .unwrap();

    let mut op = q.get(&id).await.unwrap();
    op.status = OperationStatus::Failed;
    op.retry_count = 5;
    q.update(&op).await.unwrap();
    assert_eq!(q.failed().await.len(), 1);

    q.retry_failed(&id).await.unwrap();
    let op = q.get(&id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 0);
    assert!(q.failed().await.is_empty());
  }

  #[tokio::test]
  async fn test_discard_removes_and_cleans_lane() {
    let (_, q) = queue().await;
    let id = q
      .enqueue(OperationKind::Delete, "product", json!({}), "1")
      .await
      .unwrap();

    let op = q.discard(&id).await.unwrap();
    assert_eq!(op.id, id);
    assert!(q.is_empty().await);
    assert!(q.entity_types().await.is_empty());
    assert_eq!(
      q.discard(&id).await.unwrap_err(),
      Error::OperationNotFound(id)
    );
  }

  #[tokio::test]
  async fn test_next_due_ignores_past_and_failed() {
    let (_, q) = queue().await;
    let a = q
      .enqueue(OperationKind::Delete, "product", json!({}), "1")
      .await
      .unwrap();
    let b = q
      .enqueue(OperationKind::Delete, "product", json!({}), "2")
      .await
      .unwrap();
    assert_eq!(q.next_due().await, None);

    let later = Utc::now() + chrono::Duration::seconds(30);
    let mut op = q.get(&a).await.unwrap();
    op.next_attempt_at = Some(later);
    q.update(&op).await.unwrap();

    let mut op = q.get(&b).await.unwrap();
    op.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(30));
    q.update(&op).await.unwrap();

    assert_eq!(q.next_due().await, Some(later));
  }
}
