//! Shared fixtures: an in-memory remote with scripted failures and two
//! entity types.

#![allow(dead_code)]

use async_trait::async_trait;
use resync::cache::{CacheLayer, CachePolicy, Entity, SqliteStorage};
use resync::connectivity::ConnectivityMonitor;
use resync::error::{Error, Result};
use resync::remote::{CallContext, Remote, RemoteRecord};
use resync::retry::RetryPolicy;
use resync::sync::{ReplayConfig, ReplayEngine, SyncQueue};
use resync::EntityAccessor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  #[serde(default)]
  pub id: String,
  pub name: String,
  pub price: u32,
}

impl Product {
  pub fn new(name: &str, price: u32) -> Self {
    Self {
      id: String::new(),
      name: name.to_string(),
      price,
    }
  }
}

impl Entity for Product {
  fn id(&self) -> &str {
    &self.id
  }

  fn set_id(&mut self, id: String) {
    self.id = id;
  }

  fn entity_type() -> &'static str {
    "product"
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  #[serde(default)]
  pub id: String,
  pub product: String,
  pub qty: u32,
}

impl Entity for Order {
  fn id(&self) -> &str {
    &self.id
  }

  fn set_id(&mut self, id: String) {
    self.id = id;
  }

  fn entity_type() -> &'static str {
    "order"
  }
}

/// One call received by [`FakeRemote`].
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
  pub method: &'static str,
  pub entity_type: String,
  pub id: Option<String>,
  pub payload: Option<Value>,
  pub idempotency_key: Option<String>,
}

#[derive(Default)]
struct FakeState {
  records: HashMap<String, BTreeMap<String, Value>>,
  next_id: u64,
  calls: Vec<Call>,
  fail_next: VecDeque<Error>,
  fail_target: HashMap<String, Error>,
  delay: Duration,
}

/// In-memory server. Ids are assigned as "1", "2", ...
#[derive(Default)]
pub struct FakeRemote {
  state: Mutex<FakeState>,
}

pub fn unavailable() -> Error {
  Error::Status {
    status: 503,
    message: "unavailable".to_string(),
  }
}

pub fn offline() -> Error {
  Error::Network("connection refused".to_string())
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn calls(&self) -> Vec<Call> {
    self.state.lock().unwrap().calls.clone()
  }

  pub fn call_count(&self) -> usize {
    self.state.lock().unwrap().calls.len()
  }

  /// Fail the next call with `err`.
  pub fn fail_next(&self, err: Error) {
    self.state.lock().unwrap().fail_next.push_back(err);
  }

  /// Fail every call for this id (or, for list/create, entity type).
  pub fn fail_target(&self, target: &str, err: Error) {
    self
      .state
      .lock()
      .unwrap()
      .fail_target
      .insert(target.to_string(), err);
  }

  pub fn heal(&self, target: &str) {
    self.state.lock().unwrap().fail_target.remove(target);
  }

  pub fn set_delay(&self, delay: Duration) {
    self.state.lock().unwrap().delay = delay;
  }

  pub fn seed(&self, entity_type: &str, record: Value) {
    let mut state = self.state.lock().unwrap();
    let id = record["id"].as_str().unwrap().to_string();
    state
      .records
      .entry(entity_type.to_string())
      .or_default()
      .insert(id, record);
  }

  pub fn record(&self, entity_type: &str, id: &str) -> Option<Value> {
    let state = self.state.lock().unwrap();
    state.records.get(entity_type)?.get(id).cloned()
  }

  /// Log the call and return the scripted failure for it, if any.
  async fn enter(
    &self,
    method: &'static str,
    entity_type: &str,
    id: Option<&str>,
    payload: Option<&Value>,
    ctx: &CallContext,
  ) -> Result<()> {
    let delay = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(Call {
        method,
        entity_type: entity_type.to_string(),
        id: id.map(str::to_string),
        payload: payload.cloned(),
        idempotency_key: ctx.idempotency_key.clone(),
      });
      if let Some(err) = state.fail_next.pop_front() {
        return Err(err);
      }
      if let Some(err) = state.fail_target.get(id.unwrap_or(entity_type)) {
        return Err(err.clone());
      }
      state.delay
    };

    if !delay.is_zero() {
      tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => {}
      }
    }
    Ok(())
  }

  fn not_found(id: &str) -> Error {
    Error::Status {
      status: 404,
      message: format!("{} not found", id),
    }
  }
}

#[async_trait]
impl Remote for FakeRemote {
  async fn list(&self, entity_type: &str, ctx: &CallContext) -> Result<Vec<Value>> {
    self.enter("list", entity_type, None, None, ctx).await?;
    let state = self.state.lock().unwrap();
    Ok(
      state
        .records
        .get(entity_type)
        .map(|r| r.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn get(&self, entity_type: &str, id: &str, ctx: &CallContext) -> Result<Value> {
    self.enter("get", entity_type, Some(id), None, ctx).await?;
    self
      .record(entity_type, id)
      .ok_or_else(|| Self::not_found(id))
  }

  async fn create(
    &self,
    entity_type: &str,
    payload: &Value,
    ctx: &CallContext,
  ) -> Result<RemoteRecord> {
    self
      .enter("create", entity_type, None, Some(payload), ctx)
      .await?;
    let mut state = self.state.lock().unwrap();
    state.next_id += 1;
    let id = state.next_id.to_string();
    let mut data = payload.clone();
    data["id"] = Value::String(id.clone());
    state
      .records
      .entry(entity_type.to_string())
      .or_default()
      .insert(id.clone(), data.clone());
    Ok(RemoteRecord { id, data })
  }

  async fn update(
    &self,
    entity_type: &str,
    id: &str,
    payload: &Value,
    ctx: &CallContext,
  ) -> Result<Value> {
    self
      .enter("update", entity_type, Some(id), Some(payload), ctx)
      .await?;
    let mut state = self.state.lock().unwrap();
    let records = state.records.entry(entity_type.to_string()).or_default();
    let Some(record) = records.get_mut(id) else {
      return Err(Self::not_found(id));
    };
    *record = payload.clone();
    record["id"] = Value::String(id.to_string());
    Ok(record.clone())
  }

  async fn delete(&self, entity_type: &str, id: &str, ctx: &CallContext) -> Result<()> {
    self.enter("delete", entity_type, Some(id), None, ctx).await?;
    let mut state = self.state.lock().unwrap();
    let removed = state
      .records
      .get_mut(entity_type)
      .and_then(|r| r.remove(id));
    match removed {
      Some(_) => Ok(()),
      None => Err(Self::not_found(id)),
    }
  }
}

/// Replay settings with no backoff so rescheduled operations are due at once.
pub fn fast_replay(max_retries: u32) -> ReplayConfig {
  ReplayConfig {
    max_retries,
    base_delay: Duration::ZERO,
    max_delay: Duration::ZERO,
    timeout: Duration::from_secs(5),
  }
}

pub fn fast_cache() -> CachePolicy {
  CachePolicy {
    retry: RetryPolicy {
      base_delay: Duration::ZERO,
      jitter: 0.0,
      ..Default::default()
    },
    ..Default::default()
  }
}

pub type Store = SqliteStorage;
pub type Engine = ReplayEngine<Store, FakeRemote>;

/// Everything wired together around one store.
pub struct Harness {
  pub store: Arc<Store>,
  pub queue: Arc<SyncQueue<Store>>,
  pub remote: Arc<FakeRemote>,
  pub monitor: ConnectivityMonitor,
  pub cache: CacheLayer<Store>,
  pub engine: Engine,
}

impl Harness {
  pub async fn new(online: bool) -> Self {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    Self::with_store(store, online, fast_replay(5)).await
  }

  pub async fn with_store(store: Arc<Store>, online: bool, replay: ReplayConfig) -> Self {
    let queue = Arc::new(SyncQueue::open(Arc::clone(&store)).await.unwrap());
    let remote = Arc::new(FakeRemote::new());
    let monitor = ConnectivityMonitor::new(online, Duration::ZERO);
    let cache = CacheLayer::with_policy(Arc::clone(&store), fast_cache());
    let engine = ReplayEngine::new(
      Arc::clone(&queue),
      Arc::clone(&store),
      Arc::clone(&remote),
      replay,
    );

    let invalidate = cache.clone();
    engine.on_synced(move |entity_type| {
      invalidate.invalidate_prefix(&format!("{}:", entity_type));
    });

    Self {
      store,
      queue,
      remote,
      monitor,
      cache,
      engine,
    }
  }

  pub fn products(&self) -> EntityAccessor<Product, Store, FakeRemote> {
    self.accessor()
  }

  pub fn orders(&self) -> EntityAccessor<Order, Store, FakeRemote> {
    self.accessor()
  }

  fn accessor<T: Entity>(&self) -> EntityAccessor<T, Store, FakeRemote> {
    EntityAccessor::new(
      self.cache.clone(),
      Arc::clone(&self.store),
      Arc::clone(&self.remote),
      Arc::clone(&self.queue),
      self.monitor.clone(),
    )
  }
}
