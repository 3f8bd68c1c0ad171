//! Typed per-entity facade over the read and write paths.
//!
//! Online reads go through the cache layer and are mirrored into the local
//! store; offline reads come straight from the store. Online writes go to the
//! remote and are mirrored locally; offline writes are applied to the store
//! right away and queued for replay.

use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{
  is_temp_id, new_temp_id, CacheLayer, CacheResult, Entity, LoadOptions, LocalStore,
};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ClassifiedError, Error, ErrorKind, Result};
use crate::operation::OperationContext;
use crate::remote::{CallContext, Remote};
use crate::retry;
use crate::sync::{OperationKind, SyncQueue};

/// Reads and writes entities of type `T`.
pub struct EntityAccessor<T, S, R> {
  cache: CacheLayer<S>,
  store: Arc<S>,
  remote: Arc<R>,
  queue: Arc<SyncQueue<S>>,
  monitor: ConnectivityMonitor,
  _entity: PhantomData<fn() -> T>,
}

impl<T, S, R> Clone for EntityAccessor<T, S, R> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      store: Arc::clone(&self.store),
      remote: Arc::clone(&self.remote),
      queue: Arc::clone(&self.queue),
      monitor: self.monitor.clone(),
      _entity: PhantomData,
    }
  }
}

fn is_network(err: &Error) -> bool {
  ClassifiedError::from(err).kind == ErrorKind::Network
}

fn decode<T: Entity>(value: Value) -> Result<T> {
  serde_json::from_value(value).map_err(|e| Error::InvalidResponse(e.to_string()))
}

impl<T, S, R> EntityAccessor<T, S, R>
where
  T: Entity,
  S: LocalStore + 'static,
  R: Remote,
{
  pub fn new(
    cache: CacheLayer<S>,
    store: Arc<S>,
    remote: Arc<R>,
    queue: Arc<SyncQueue<S>>,
    monitor: ConnectivityMonitor,
  ) -> Self {
    Self {
      cache,
      store,
      remote,
      queue,
      monitor,
      _entity: PhantomData,
    }
  }

  fn list_key() -> String {
    format!("{}:all", T::entity_type())
  }

  fn item_key(id: &str) -> String {
    format!("{}:{}", T::entity_type(), id)
  }

  fn invalidate(&self) {
    self.cache.invalidate_prefix(&format!("{}:", T::entity_type()));
  }

  /// A network failure is also a connectivity observation.
  fn note_failure(&self, err: &Error) -> bool {
    if is_network(err) {
      self.monitor.report(false);
      return true;
    }
    false
  }

  /// All entities of this type.
  pub async fn get_all(&self, options: LoadOptions) -> Result<CacheResult<Vec<T>>> {
    if !self.monitor.is_online() {
      return self.local_all().await;
    }

    let key = Self::list_key();
    let stale = self.cache.is_stale(&key);
    let remote = Arc::clone(&self.remote);
    let loaded = self
      .cache
      .load_entities(
        &key,
        move |cancel| {
          let remote = Arc::clone(&remote);
          async move {
            let items = remote
              .list(T::entity_type(), &CallContext::new(cancel))
              .await?;
            items.into_iter().map(decode::<T>).collect()
          }
        },
        options,
      )
      .await;

    match loaded {
      Ok(data) => Ok(CacheResult::from_network(data, stale)),
      Err(e) if self.note_failure(&e) => {
        warn!(entity_type = T::entity_type(), error = %e, "Serving local copy");
        self.local_all().await
      }
      Err(e) => Err(e),
    }
  }

  /// One entity, or `None` when it does not exist.
  pub async fn get(&self, id: &str, options: LoadOptions) -> Result<CacheResult<Option<T>>> {
    let id = self.queue.resolve_id(id).await?;
    let id = id.as_str();
    if !self.monitor.is_online() || is_temp_id(id) {
      return self.local_one(id).await;
    }

    let key = Self::item_key(id);
    let stale = self.cache.is_stale(&key);
    let remote = Arc::clone(&self.remote);
    let target = id.to_string();
    let loaded = self
      .cache
      .load_entity(
        &key,
        move |cancel| {
          let remote = Arc::clone(&remote);
          let target = target.clone();
          async move {
            let value = remote
              .get(T::entity_type(), &target, &CallContext::new(cancel))
              .await?;
            decode::<T>(value)
          }
        },
        options,
      )
      .await;

    match loaded {
      Ok(data) => Ok(CacheResult::from_network(Some(data), stale)),
      Err(Error::Status { status: 404, .. }) => Ok(CacheResult::from_network(None, false)),
      Err(e) if self.note_failure(&e) => {
        warn!(entity_type = T::entity_type(), id, error = %e, "Serving local copy");
        self.local_one(id).await
      }
      Err(e) => Err(e),
    }
  }

  /// Create an entity. Returns it with its server id, or with a temporary
  /// id when the create was queued.
  pub async fn create(&self, entity: T, ctx: &OperationContext) -> Result<T> {
    let mut entity = entity;
    if is_temp_id(entity.id()) && self.queue.resolve_id(entity.id()).await? != entity.id() {
      // That record already exists on the server; this is a new one
      entity.set_id(String::new());
    }
    let (mut entity, mut payload) = self.resolve(entity).await?;
    let key = Uuid::new_v4().to_string();

    if self.monitor.is_online() {
      if let Some(obj) = payload.as_object_mut() {
        let drop_id = obj
          .get("id")
          .and_then(Value::as_str)
          .is_some_and(|id| id.is_empty() || is_temp_id(id));
        if drop_id {
          obj.remove("id");
        }
      }

      let remote = Arc::clone(&self.remote);
      let sent_key = key.clone();
      let sent = self
        .with_retry(ctx, move |cancel| {
          let remote = Arc::clone(&remote);
          let payload = payload.clone();
          let ctx = CallContext::new(cancel).with_idempotency_key(sent_key.clone());
          async move { remote.create(T::entity_type(), &payload, &ctx).await }
        })
        .await;

      match sent {
        Ok(record) => {
          let created = decode::<T>(record.data.clone())?;
          self.store.put(T::entity_type(), &record.id, &record.data).await?;
          self.invalidate();
          debug!(entity_type = T::entity_type(), id = %record.id, "Created");
          return Ok(created);
        }
        Err(e) if self.note_failure(&e) => {
          warn!(entity_type = T::entity_type(), error = %e, "Create failed, queueing");
        }
        Err(e) => return Err(e),
      }
    }

    if !is_temp_id(entity.id()) {
      entity.set_id(new_temp_id());
    }
    let payload = serde_json::to_value(&entity)?;
    self.store.put(T::entity_type(), entity.id(), &payload).await?;
    self
      .queue
      .enqueue_with_key(
        OperationKind::Create,
        T::entity_type(),
        payload,
        entity.id(),
        Some(key),
      )
      .await?;
    self.invalidate();
    Ok(entity)
  }

  /// Replace an entity. Changes to an entity with queued operations are
  /// queued behind them.
  pub async fn update(&self, entity: T, ctx: &OperationContext) -> Result<T> {
    let (entity, payload) = self.resolve(entity).await?;
    let key = Uuid::new_v4().to_string();

    if self.writes_directly(entity.id()).await {
      let remote = Arc::clone(&self.remote);
      let id = entity.id().to_string();
      let body = payload.clone();
      let sent_key = key.clone();
      let sent = self
        .with_retry(ctx, move |cancel| {
          let remote = Arc::clone(&remote);
          let (id, body) = (id.clone(), body.clone());
          let ctx = CallContext::new(cancel).with_idempotency_key(sent_key.clone());
          async move { remote.update(T::entity_type(), &id, &body, &ctx).await }
        })
        .await;

      match sent {
        Ok(response) => {
          // Prefer the server's copy when it is a full record
          let updated = decode::<T>(response).unwrap_or(entity);
          let stored = serde_json::to_value(&updated)?;
          self.store.put(T::entity_type(), updated.id(), &stored).await?;
          self.invalidate();
          return Ok(updated);
        }
        Err(e) if self.note_failure(&e) => {
          warn!(entity_type = T::entity_type(), id = entity.id(), error = %e, "Update failed, queueing");
        }
        Err(e) => return Err(e),
      }
    }

    self.store.put(T::entity_type(), entity.id(), &payload).await?;
    self
      .queue
      .enqueue_with_key(
        OperationKind::Update,
        T::entity_type(),
        payload,
        entity.id(),
        Some(key),
      )
      .await?;
    self.invalidate();
    Ok(entity)
  }

  /// Delete an entity. Deleting an id that does not exist is not an error.
  pub async fn delete(&self, id: &str, ctx: &OperationContext) -> Result<()> {
    let id = self.queue.resolve_id(id).await?;
    let id = id.as_str();
    let key = Uuid::new_v4().to_string();

    if self.writes_directly(id).await {
      let remote = Arc::clone(&self.remote);
      let target = id.to_string();
      let sent_key = key.clone();
      let sent = self
        .with_retry(ctx, move |cancel| {
          let remote = Arc::clone(&remote);
          let target = target.clone();
          let ctx = CallContext::new(cancel).with_idempotency_key(sent_key.clone());
          async move { remote.delete(T::entity_type(), &target, &ctx).await }
        })
        .await;

      match sent {
        Ok(()) | Err(Error::Status { status: 404, .. }) => {
          self.store.delete(T::entity_type(), id).await?;
          self.invalidate();
          return Ok(());
        }
        Err(e) if self.note_failure(&e) => {
          warn!(entity_type = T::entity_type(), id, error = %e, "Delete failed, queueing");
        }
        Err(e) => return Err(e),
      }
    }

    self.store.delete(T::entity_type(), id).await?;
    self
      .queue
      .enqueue_with_key(OperationKind::Delete, T::entity_type(), json!({}), id, Some(key))
      .await?;
    self.invalidate();
    Ok(())
  }

  /// Point temporary ids whose create was already replayed at their server
  /// ids. Returns the entity and its serialized form.
  async fn resolve(&self, entity: T) -> Result<(T, Value)> {
    let mut entity = entity;
    let id = self.queue.resolve_id(entity.id()).await?;
    if id != entity.id() {
      entity.set_id(id);
    }

    let mut payload = serde_json::to_value(&entity)?;
    if self.queue.resolve_refs(&mut payload).await? {
      entity = serde_json::from_value(payload.clone())?;
    }
    Ok((entity, payload))
  }

  /// Whether a write to `id` can go straight to the remote. Temporary ids
  /// and entities with queued operations must wait for replay.
  async fn writes_directly(&self, id: &str) -> bool {
    self.monitor.is_online()
      && !is_temp_id(id)
      && !self.queue.has_pending_for(T::entity_type(), id).await
  }

  async fn with_retry<V, F, Fut>(&self, ctx: &OperationContext, f: F) -> Result<V>
  where
    F: FnMut(tokio_util::sync::CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<V>>,
  {
    retry::run(&self.cache.policy().retry, &ctx.cancel, &ctx.progress, f).await
  }

  async fn local_all(&self) -> Result<CacheResult<Vec<T>>> {
    let records = self.store.get_all(T::entity_type()).await?;
    let data = records
      .into_iter()
      .map(|v| serde_json::from_value(v).map_err(Error::from))
      .collect::<Result<Vec<T>>>()?;
    Ok(CacheResult::offline(data))
  }

  async fn local_one(&self, id: &str) -> Result<CacheResult<Option<T>>> {
    let data = match self.store.get(T::entity_type(), id).await? {
      Some(v) => Some(serde_json::from_value(v)?),
      None => None,
    };
    Ok(CacheResult::offline(data))
  }
}
