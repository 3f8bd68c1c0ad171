//! Cache layer that orchestrates caching logic with network fetching.
//!
//! Reads go through [`CacheLayer::load`]: a fresh in-memory entry is
//! returned as is, a stale one is returned and refreshed in the background,
//! and a miss joins or starts the single in-flight request for that key.
//! Network attempts run in spawned tasks bounded by a timeout and retried
//! with backoff.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::storage::EntityStore;
use super::traits::Entity;
use crate::error::{Error, Result};
use crate::operation::{OperationContext, Progress};
use crate::retry::{self, RetryPolicy};

type AnyValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<AnyValue>>>;
type Mirror<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Defaults applied to every load unless overridden in [`LoadOptions`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
  /// How long an entry may be served
  pub ttl: Duration,
  /// Fraction of the TTL after which an entry counts as stale
  pub stale_fraction: f64,
  /// Refresh stale entries in the background while serving them
  pub stale_while_revalidate: bool,
  pub retry: RetryPolicy,
}

impl Default for CachePolicy {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(5 * 60),
      stale_fraction: 0.8,
      stale_while_revalidate: true,
      retry: RetryPolicy::default(),
    }
  }
}

/// Per-call options for [`CacheLayer::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
  pub ttl: Option<Duration>,
  pub stale_while_revalidate: Option<bool>,
  pub retry: Option<RetryPolicy>,
  /// Cancel the request in flight for this key and fetch again
  pub supersede: bool,
  /// Owner token; cancelling it cancels the request this call started
  pub cancel: Option<CancellationToken>,
  pub progress: Progress,
}

impl LoadOptions {
  /// Bind the load to a running operation so cancellation and retry
  /// progress flow through it.
  pub fn with_context(ctx: &OperationContext) -> Self {
    Self {
      cancel: Some(ctx.cancel.clone()),
      progress: ctx.progress.clone(),
      ..Default::default()
    }
  }

  pub fn ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn supersede(mut self) -> Self {
    self.supersede = true;
    self
  }

  pub fn revalidate(mut self, enabled: bool) -> Self {
    self.stale_while_revalidate = Some(enabled);
    self
  }
}

/// A successful fetch held in memory.
struct CacheEntry {
  key: String,
  data: AnyValue,
  timestamp: Instant,
  expires_at: Instant,
}

impl CacheEntry {
  fn is_expired(&self, now: Instant) -> bool {
    now > self.expires_at
  }

  fn is_stale(&self, now: Instant, fraction: f64) -> bool {
    let ttl = self.expires_at.saturating_duration_since(self.timestamp);
    now.saturating_duration_since(self.timestamp) > ttl.mul_f64(fraction)
  }
}

struct InFlight {
  id: u64,
  token: CancellationToken,
  result: SharedFetch,
}

#[derive(Default)]
struct State {
  entries: HashMap<String, CacheEntry>,
  in_flight: HashMap<String, InFlight>,
  next_id: u64,
}

struct Inner<S> {
  storage: Arc<S>,
  policy: CachePolicy,
  state: Mutex<State>,
  shutdown: CancellationToken,
}

impl<S> Inner<S> {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Record the outcome of request `id` and clear its in-flight marker.
  fn complete(&self, key: &str, id: u64, value: Option<(AnyValue, Duration)>) {
    let mut state = self.lock();
    let current = state.in_flight.get(key).map(|f| f.id);

    if let Some((data, ttl)) = value {
      // A superseded request must not overwrite its replacement's result.
      if current.is_none() || current == Some(id) {
        let now = Instant::now();
        state.entries.insert(
          key.to_string(),
          CacheEntry {
            key: key.to_string(),
            data,
            timestamp: now,
            expires_at: now + ttl,
          },
        );
      }
    }

    if current == Some(id) {
      state.in_flight.remove(key);
    }
  }
}

enum Lookup<T> {
  Fresh(T),
  Stale(T),
  Miss,
}

/// Resilient fetch orchestrator: in-memory TTL cache, request
/// deduplication, stale-while-revalidate, timeout, retry and cancellation.
///
/// Instances are independent; tests create their own and `dispose` them.
pub struct CacheLayer<S> {
  inner: Arc<Inner<S>>,
}

impl<S> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: Send + Sync + 'static> CacheLayer<S> {
  /// Create a new cache layer mirroring into the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self::with_policy(storage, CachePolicy::default())
  }

  pub fn with_policy(storage: Arc<S>, policy: CachePolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        storage,
        policy,
        state: Mutex::new(State::default()),
        shutdown: CancellationToken::new(),
      }),
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.inner.policy
  }

  /// Load `key`, calling `fetch` only when no usable cache entry exists and
  /// no identical request is already in flight.
  pub async fn load<T, F, Fut>(&self, key: &str, fetch: F, options: LoadOptions) -> Result<T>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.load_with(key, fetch, options, None).await
  }

  async fn load_with<T, F, Fut>(
    &self,
    key: &str,
    fetch: F,
    options: LoadOptions,
    mirror: Option<Mirror<T>>,
  ) -> Result<T>
  where
    T: Clone + Send + Sync + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let owner = options.cancel.clone().unwrap_or_default();
    if owner.is_cancelled() || self.inner.shutdown.is_cancelled() {
      return Err(Error::Cancelled);
    }

    let fetch = Arc::new(fetch);
    let revalidate = options
      .stale_while_revalidate
      .unwrap_or(self.inner.policy.stale_while_revalidate);

    let pending = {
      let mut state = self.inner.lock();

      if options.supersede {
        if let Some(previous) = state.in_flight.remove(key) {
          debug!(key, "Superseding in-flight request");
          previous.token.cancel();
        }
      } else {
        match self.lookup::<T>(&state, key) {
          Lookup::Fresh(value) => {
            debug!(key, "Cache hit");
            return Ok(value);
          }
          Lookup::Stale(value) => {
            debug!(key, "Serving stale entry");
            if revalidate && !state.in_flight.contains_key(key) {
              let _ = self.start_fetch(
                &mut state,
                key,
                Arc::clone(&fetch),
                &options,
                CancellationToken::new(),
                Progress::noop(),
                mirror,
              );
            }
            return Ok(value);
          }
          Lookup::Miss => {}
        }
      }

      match state.in_flight.get(key) {
        Some(existing) => {
          debug!(key, "Joining in-flight request");
          existing.result.clone()
        }
        None => self.start_fetch(
          &mut state,
          key,
          fetch,
          &options,
          owner.clone(),
          options.progress.clone(),
          mirror,
        ),
      }
    };

    let value = tokio::select! {
      result = pending => result?,
      _ = owner.cancelled() => return Err(Error::Cancelled),
    };

    value.downcast::<T>().map(|v| (*v).clone()).map_err(|_| {
      Error::InvalidResponse(format!("cached value for '{}' has a different type", key))
    })
  }

  fn lookup<T: Clone + 'static>(&self, state: &State, key: &str) -> Lookup<T> {
    let Some(entry) = state.entries.get(key) else {
      return Lookup::Miss;
    };
    let now = Instant::now();
    if entry.is_expired(now) {
      return Lookup::Miss;
    }

    let Some(value) = entry.data.downcast_ref::<T>() else {
      warn!(key, "Cache entry type mismatch, refetching");
      return Lookup::Miss;
    };

    if entry.is_stale(now, self.inner.policy.stale_fraction) {
      Lookup::Stale(value.clone())
    } else {
      Lookup::Fresh(value.clone())
    }
  }

  /// Spawn the network request for `key` and register it as in flight.
  ///
  /// Must be called with the state lock held so the task cannot clear its
  /// marker before it is registered.
  #[allow(clippy::too_many_arguments)]
  fn start_fetch<T, F, Fut>(
    &self,
    state: &mut State,
    key: &str,
    fetch: Arc<F>,
    options: &LoadOptions,
    owner: CancellationToken,
    progress: Progress,
    mirror: Option<Mirror<T>>,
  ) -> SharedFetch
  where
    T: Clone + Send + Sync + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let id = state.next_id;
    state.next_id += 1;

    let token = self.inner.shutdown.child_token();
    let policy = options
      .retry
      .clone()
      .unwrap_or_else(|| self.inner.policy.retry.clone());
    let ttl = options.ttl.unwrap_or(self.inner.policy.ttl);
    let inner = Arc::clone(&self.inner);
    let task_token = token.clone();
    let task_key = key.to_string();

    let handle: JoinHandle<Result<AnyValue>> = tokio::spawn(async move {
      let fetch = &*fetch;
      let result = tokio::select! {
        result = retry::run(&policy, &task_token, &progress, |attempt| fetch(attempt)) => result,
        _ = owner.cancelled() => Err(Error::Cancelled),
      };

      match result {
        Ok(value) if !task_token.is_cancelled() => {
          if let Some(mirror) = &mirror {
            mirror(value.clone()).await;
          }
          let data: AnyValue = Arc::new(value);
          inner.complete(&task_key, id, Some((Arc::clone(&data), ttl)));
          Ok(data)
        }
        Ok(_) => {
          inner.complete(&task_key, id, None);
          Err(Error::Cancelled)
        }
        Err(err) => {
          if !err.is_cancelled() {
            debug!(key = %task_key, error = %err, "Fetch failed");
          }
          inner.complete(&task_key, id, None);
          Err(err)
        }
      }
    });

    let result = async move { handle.await.unwrap_or(Err(Error::Cancelled)) }
      .boxed()
      .shared();

    state.in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        token,
        result: result.clone(),
      },
    );
    result
  }

  /// Drop the entry for `key` so the next load fetches again.
  pub fn invalidate(&self, key: &str) {
    self.inner.lock().entries.remove(key);
  }

  /// Drop every entry whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) {
    self
      .inner
      .lock()
      .entries
      .retain(|key, _| !key.starts_with(prefix));
  }

  /// Whether `key` holds a valid entry that is past its stale threshold.
  /// Missing and expired entries are not stale, they are absent.
  pub fn is_stale(&self, key: &str) -> bool {
    let state = self.inner.lock();
    let now = Instant::now();
    state.entries.get(key).is_some_and(|entry| {
      !entry.is_expired(now) && entry.is_stale(now, self.inner.policy.stale_fraction)
    })
  }

  /// Whether `key` holds an entry that has not expired.
  pub fn contains(&self, key: &str) -> bool {
    let state = self.inner.lock();
    let now = Instant::now();
    state
      .entries
      .get(key)
      .is_some_and(|entry| !entry.is_expired(now))
  }

  /// Whether a request for `key` is currently in flight.
  pub fn is_loading(&self, key: &str) -> bool {
    self.inner.lock().in_flight.contains_key(key)
  }

  /// Remove expired entries. Returns how many were removed.
  pub fn sweep_expired(&self) -> usize {
    let mut state = self.inner.lock();
    let now = Instant::now();
    let before = state.entries.len();
    state.entries.retain(|_, entry| {
      let expired = entry.is_expired(now);
      if expired {
        debug!(key = %entry.key, "Evicting expired entry");
      }
      !expired
    });
    before - state.entries.len()
  }

  /// Sweep expired entries every `interval` until [`dispose`](Self::dispose).
  pub fn start_janitor(&self, interval: Duration) -> JoinHandle<()> {
    let layer = self.clone();
    let shutdown = self.inner.shutdown.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          _ = ticker.tick() => {
            let removed = layer.sweep_expired();
            if removed > 0 {
              debug!(removed, "Swept expired cache entries");
            }
          }
        }
      }
    })
  }

  /// Cancel every in-flight request, stop the janitor and clear the cache.
  pub fn dispose(&self) {
    self.inner.shutdown.cancel();
    let mut state = self.inner.lock();
    for (_, in_flight) in state.in_flight.drain() {
      in_flight.token.cancel();
    }
    state.entries.clear();
  }
}

impl<S: EntityStore + 'static> CacheLayer<S> {
  /// Load a list of entities and mirror it into the local store.
  pub async fn load_entities<T, F, Fut>(
    &self,
    key: &str,
    fetch: F,
    options: LoadOptions,
  ) -> Result<Vec<T>>
  where
    T: Entity,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let storage = Arc::clone(&self.inner.storage);
    let mirror: Mirror<Vec<T>> = Arc::new(move |entities: Vec<T>| {
      let storage = Arc::clone(&storage);
      async move {
        let records: Result<Vec<(String, Value)>> = entities
          .iter()
          .map(|e| -> Result<(String, Value)> {
            Ok((e.id().to_string(), serde_json::to_value(e)?))
          })
          .collect();
        let result = match records {
          Ok(records) => storage.replace_all(T::entity_type(), &records).await,
          Err(e) => Err(e),
        };
        if let Err(e) = result {
          warn!(entity_type = T::entity_type(), error = %e, "Failed to mirror entities");
        }
      }
      .boxed()
    });

    self.load_with(key, fetch, options, Some(mirror)).await
  }

  /// Load a single entity and mirror it into the local store.
  pub async fn load_entity<T, F, Fut>(&self, key: &str, fetch: F, options: LoadOptions) -> Result<T>
  where
    T: Entity,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let storage = Arc::clone(&self.inner.storage);
    let mirror: Mirror<T> = Arc::new(move |entity: T| {
      let storage = Arc::clone(&storage);
      async move {
        let result = match serde_json::to_value(&entity) {
          Ok(data) => {
            storage
              .put(T::entity_type(), entity.id(), &data)
              .await
          }
          Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
          warn!(entity_type = T::entity_type(), error = %e, "Failed to mirror entity");
        }
      }
      .boxed()
    });

    self.load_with(key, fetch, options, Some(mirror)).await
  }
}
