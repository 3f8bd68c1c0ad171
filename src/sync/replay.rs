//! Replays the sync queue against the remote.
//!
//! A drain walks each entity type's lane in order. An operation whose
//! target has an earlier unresolved operation is held back, so writes to one
//! entity are applied in the order they were made while unrelated entities
//! keep flowing. Creates are sent without their temporary id; the id the
//! server assigns replaces the temporary one everywhere it is still
//! referenced.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{rewrite_id, temp_ids_in, OperationKind, OperationStatus, SyncOperation, SyncQueue};
use crate::cache::{is_temp_id, LocalStore};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{ClassifiedError, Error, Result};
use crate::operation::{Operation, Outcome};
use crate::remote::{CallContext, Remote, RemoteRecord};
use crate::retry;

/// Replay tuning.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
  /// Failed attempts after which an operation is parked as failed
  pub max_retries: u32,
  /// Delay before the first re-attempt; doubles per failure
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Deadline for a single remote call
  pub timeout: Duration,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(300),
      timeout: Duration::from_secs(10),
    }
  }
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainResult {
  /// Operations the remote accepted and that left the queue
  pub applied: usize,
  /// Temporary ids replaced by server ids, as `(temp, server)`
  pub remapped: Vec<(String, String)>,
  /// Operations that failed and were put back with a later attempt time
  pub rescheduled: usize,
  /// Operations left untouched because they were not due or were blocked
  pub deferred: usize,
  /// Operations that reached the retry ceiling during this drain
  pub failed: Vec<SyncOperation>,
  last_failure: Option<Error>,
}

impl DrainResult {
  /// Error reported through the engine's status when operations were
  /// parked as failed.
  pub fn failure(&self) -> Option<Error> {
    let last = self.last_failure.clone()?;
    Some(Error::ReplayFailed {
      count: self.failed.len(),
      last: Box::new(last),
    })
  }
}

#[derive(Default)]
struct PassStats {
  applied: usize,
  waiting_on_create: usize,
}

type SharedDrain = Shared<BoxFuture<'static, Result<DrainResult>>>;
type SyncHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Inner<S, R> {
  queue: Arc<SyncQueue<S>>,
  store: Arc<S>,
  remote: Arc<R>,
  config: ReplayConfig,
  /// The running drain, tagged with its run number
  current: Mutex<Option<(u64, SharedDrain)>>,
  runs: AtomicU64,
  status: Operation<DrainResult>,
  hooks: RwLock<Vec<SyncHook>>,
  shutdown: CancellationToken,
}

/// Drains the sync queue against the remote. Cheap to clone.
pub struct ReplayEngine<S, R> {
  inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for ReplayEngine<S, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: LocalStore + 'static, R: Remote> ReplayEngine<S, R> {
  pub fn new(
    queue: Arc<SyncQueue<S>>,
    store: Arc<S>,
    remote: Arc<R>,
    config: ReplayConfig,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        queue,
        store,
        remote,
        config,
        current: Mutex::new(None),
        runs: AtomicU64::new(0),
        status: Operation::new(),
        hooks: RwLock::new(Vec::new()),
        shutdown: CancellationToken::new(),
      }),
    }
  }

  pub fn queue(&self) -> &Arc<SyncQueue<S>> {
    &self.inner.queue
  }

  /// State of the most recent [`sync`](Self::sync).
  pub fn status(&self) -> &Operation<DrainResult> {
    &self.inner.status
  }

  /// Call `hook` with the entity type after a drain applied changes to it.
  pub fn on_synced(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
    self
      .inner
      .hooks
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .push(Arc::new(hook));
  }

  /// Replay every due operation. A drain already running is joined instead
  /// of starting a second one.
  pub async fn drain(&self) -> Result<DrainResult> {
    let run = {
      let mut current = self.inner.lock_current();
      match current.as_ref() {
        Some((_, run)) => {
          debug!("Drain already running, joining it");
          run.clone()
        }
        None => {
          let number = self.inner.runs.fetch_add(1, Ordering::Relaxed);
          let inner = Arc::clone(&self.inner);
          let handle = tokio::spawn(async move {
            // Frees the slot even if the drain panics
            let _finished = FinishedRun {
              inner: Arc::clone(&inner),
              number,
            };
            inner.drain_passes().await
          });
          let run = async move {
            handle.await.unwrap_or_else(|e| {
              warn!(error = %e, "Drain task failed");
              Err(Error::Cancelled)
            })
          }
          .boxed()
          .shared();
          *current = Some((number, run.clone()));
          run
        }
      }
    };
    run.await
  }

  /// [`drain`](Self::drain) tracked by [`status`](Self::status).
  /// Operations parked as failed turn the status into an error.
  pub async fn sync(&self) -> Outcome<DrainResult> {
    // The status operation lives inside the engine; hold it weakly.
    let weak = Arc::downgrade(&self.inner);
    self
      .inner
      .status
      .execute(move |_ctx| {
        let inner = weak.upgrade();
        async move {
          let inner = inner.ok_or(Error::Cancelled)?;
          let result = ReplayEngine { inner }.drain().await?;
          match result.failure() {
            Some(err) => Err(err),
            None => Ok(result),
          }
        }
      })
      .await
  }

  /// Operations waiting for manual resolution.
  pub async fn failed(&self) -> Vec<SyncOperation> {
    self.inner.queue.failed().await
  }

  /// Give a failed operation a fresh retry budget.
  pub async fn retry_failed(&self, id: &str) -> Result<()> {
    self.inner.queue.retry_failed(id).await
  }

  /// Drop a queued operation without replaying it.
  pub async fn discard(&self, id: &str) -> Result<SyncOperation> {
    self.inner.queue.discard(id).await
  }

  /// Sync when connectivity returns, when an operation is enqueued while
  /// online, and whenever a rescheduled operation becomes due while online.
  /// Runs until [`dispose`](Self::dispose).
  pub fn spawn_replay_on_reconnect(&self, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
    let engine = self.clone();
    let mut events = monitor.subscribe();
    let online = monitor.watch();

    tokio::spawn(async move {
      let shutdown = engine.inner.shutdown.clone();
      let starts_online = *online.borrow();
      if starts_online && !engine.inner.queue.is_empty().await {
        engine.sync().await;
      }

      loop {
        let due = engine.inner.queue.next_due().await;
        let wait = due
          .and_then(|at| (at - Utc::now()).to_std().ok())
          .unwrap_or(Duration::ZERO);

        tokio::select! {
          _ = shutdown.cancelled() => break,
          event = events.recv() => match event {
            Ok(ConnectivityEvent::BecameOnline) => {
              info!("Back online, replaying queued changes");
              engine.sync().await;
            }
            Ok(ConnectivityEvent::WentOffline) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
          },
          _ = engine.inner.queue.enqueued() => {
            let is_online = *online.borrow();
            if is_online {
              engine.sync().await;
            }
          }
          _ = tokio::time::sleep(wait), if due.is_some() => {
            let is_online = *online.borrow();
            if is_online {
              engine.sync().await;
            }
          }
        }
      }
      debug!("Replay runner stopped");
    })
  }

  /// Stop background replay and abort a drain in progress. Operations
  /// interrupted mid-flight go back to pending.
  pub fn dispose(&self) {
    self.inner.shutdown.cancel();
    self.inner.status.cancel();
  }
}

/// Clears the engine's drain slot when a drain task ends, however it ends.
struct FinishedRun<S, R> {
  inner: Arc<Inner<S, R>>,
  number: u64,
}

impl<S, R> Drop for FinishedRun<S, R> {
  fn drop(&mut self) {
    let mut current = self.inner.lock_current();
    if current.as_ref().is_some_and(|(number, _)| *number == self.number) {
      *current = None;
    }
  }
}

impl<S, R> Inner<S, R> {
  fn lock_current(&self) -> MutexGuard<'_, Option<(u64, SharedDrain)>> {
    self.current.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<S: LocalStore + 'static, R: Remote> Inner<S, R> {

  async fn drain_passes(&self) -> Result<DrainResult> {
    let mut result = DrainResult::default();
    let mut touched = HashSet::new();

    // A create applied in one lane can unblock operations in a lane that
    // was already visited.
    loop {
      result.deferred = 0;
      let pass = self.drain_pass(&mut result, &mut touched).await?;
      if pass.applied == 0 || pass.waiting_on_create == 0 {
        break;
      }
    }

    if result.applied > 0 || !result.failed.is_empty() || result.rescheduled > 0 {
      info!(
        applied = result.applied,
        remapped = result.remapped.len(),
        rescheduled = result.rescheduled,
        deferred = result.deferred,
        failed = result.failed.len(),
        "Drained sync queue"
      );
    }

    let hooks: Vec<SyncHook> = self
      .hooks
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone();
    for entity_type in &touched {
      for hook in &hooks {
        hook(entity_type);
      }
    }

    Ok(result)
  }

  async fn drain_pass(
    &self,
    result: &mut DrainResult,
    touched: &mut HashSet<String>,
  ) -> Result<PassStats> {
    let mut stats = PassStats::default();
    let now = Utc::now();

    for entity_type in self.queue.entity_types().await {
      let mut blocked: HashSet<String> = HashSet::new();

      for op_id in self.queue.lane(&entity_type).await {
        if self.shutdown.is_cancelled() {
          return Err(Error::Cancelled);
        }
        let Some(op) = self.queue.get(&op_id).await else {
          continue;
        };

        if op.status == OperationStatus::Failed {
          blocked.insert(op.target_id);
          continue;
        }
        if blocked.contains(&op.target_id) {
          result.deferred += 1;
          continue;
        }
        if !op.is_due(now) {
          blocked.insert(op.target_id);
          result.deferred += 1;
          continue;
        }
        if self.waits_on_create(&op).await {
          blocked.insert(op.target_id);
          result.deferred += 1;
          stats.waiting_on_create += 1;
          continue;
        }

        let target = op.target_id.clone();
        if self.replay(op, result).await? {
          stats.applied += 1;
          touched.insert(entity_type.clone());
        } else {
          blocked.insert(target);
        }
      }
    }

    Ok(stats)
  }

  /// Whether `op` mentions the temporary id of a create that has not been
  /// replayed yet, other than its own target.
  async fn waits_on_create(&self, op: &SyncOperation) -> bool {
    let mut mentioned = Vec::new();
    temp_ids_in(&op.payload, &mut mentioned);
    if mentioned.iter().all(|id| *id == op.target_id) {
      return false;
    }
    let unsynced = self.queue.unsynced_temp_ids().await;
    mentioned
      .iter()
      .any(|id| *id != op.target_id && unsynced.contains(id))
  }

  /// Send one operation. Returns whether it was applied.
  async fn replay(&self, mut op: SyncOperation, result: &mut DrainResult) -> Result<bool> {
    op.status = OperationStatus::Inflight;
    self.queue.update(&op).await?;

    let sent = &op;
    let outcome = retry::attempt(self.config.timeout, &self.shutdown, |token| {
      let ctx = CallContext::new(token).with_idempotency_key(sent.idempotency_key.clone());
      async move { self.send(sent, &ctx).await }
    })
    .await;

    match outcome {
      Ok(record) => {
        self.queue.remove(&op.id).await?;
        debug!(id = %op.id, kind = op.kind.as_str(), target = %op.target_id, "Replayed operation");

        if let Some(record) = record {
          if record.id != op.target_id {
            let changed = self.queue.remap_id(&op.target_id, &record.id).await?;
            self
              .remap_local(&op.entity_type, &op.target_id, &record)
              .await?;
            self
              .remap_references(&changed, &op.entity_type, &op.target_id, &record.id)
              .await?;
            result.remapped.push((op.target_id.clone(), record.id));
          }
        }
        result.applied += 1;
        Ok(true)
      }
      Err(Error::Cancelled) => {
        op.status = OperationStatus::Pending;
        self.queue.update(&op).await?;
        Err(Error::Cancelled)
      }
      Err(err) => {
        let classified = ClassifiedError::from(&err);
        op.retry_count += 1;
        op.last_error = Some(err.to_string());

        if !classified.retryable || op.retry_count >= self.config.max_retries {
          op.status = OperationStatus::Failed;
          op.next_attempt_at = None;
          warn!(
            id = %op.id,
            entity_type = %op.entity_type,
            kind = op.kind.as_str(),
            target = %op.target_id,
            attempts = op.retry_count,
            error = %classified,
            "Queued operation failed, needs manual resolution"
          );
          self.queue.update(&op).await?;
          result.failed.push(op);
          result.last_failure = Some(err);
        } else {
          let delay = retry::exponential(
            self.config.base_delay,
            self.config.max_delay,
            op.retry_count,
          );
          op.status = OperationStatus::Pending;
          op.next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
          warn!(
            id = %op.id,
            attempts = op.retry_count,
            ?delay,
            error = %classified,
            "Rescheduled queued operation"
          );
          self.queue.update(&op).await?;
          result.rescheduled += 1;
        }
        Ok(false)
      }
    }
  }

  async fn send(&self, op: &SyncOperation, ctx: &CallContext) -> Result<Option<RemoteRecord>> {
    let remote = &self.remote;
    match op.kind {
      OperationKind::Create => {
        let mut body = op.payload.clone();
        if let Some(obj) = body.as_object_mut() {
          if obj.get("id").and_then(Value::as_str).is_some_and(is_temp_id) {
            obj.remove("id");
          }
        }
        remote.create(&op.entity_type, &body, ctx).await.map(Some)
      }
      OperationKind::Update => remote
        .update(&op.entity_type, &op.target_id, &op.payload, ctx)
        .await
        .map(|_| None),
      OperationKind::Delete => {
        match remote.delete(&op.entity_type, &op.target_id, ctx).await {
          // Already gone on the server
          Err(Error::Status { status: 404, .. }) => Ok(None),
          other => other.map(|_| None),
        }
      }
    }
  }

  /// Rewrite the local copies of other queued entities that referenced the
  /// temporary id.
  async fn remap_references(
    &self,
    changed: &[SyncOperation],
    entity_type: &str,
    temp_id: &str,
    server_id: &str,
  ) -> Result<()> {
    let mut seen = HashSet::new();
    for op in changed {
      // The created record itself was already moved
      let is_created = op.entity_type == entity_type && op.target_id == server_id;
      if is_created || !seen.insert((&op.entity_type, &op.target_id)) {
        continue;
      }
      let Some(mut local) = self.store.get(&op.entity_type, &op.target_id).await? else {
        continue;
      };
      if rewrite_id(&mut local, temp_id, server_id) {
        self.store.put(&op.entity_type, &op.target_id, &local).await?;
      }
    }
    Ok(())
  }

  /// Move the local record from its temporary id to the server id. Fields
  /// edited locally since the create win over the server's copy.
  async fn remap_local(&self, entity_type: &str, temp_id: &str, record: &RemoteRecord) -> Result<()> {
    let Some(mut local) = self.store.get(entity_type, temp_id).await? else {
      // Deleted locally before the create was replayed
      return Ok(());
    };
    rewrite_id(&mut local, temp_id, &record.id);

    let merged = match (record.data.clone(), local) {
      (Value::Object(mut server), Value::Object(local)) => {
        server.extend(local);
        Value::Object(server)
      }
      (_, local) => local,
    };

    self.store.put(entity_type, &record.id, &merged).await?;
    self.store.delete(entity_type, temp_id).await?;
    debug!(entity_type, temp_id, server_id = %record.id, "Moved local record to server id");
    Ok(())
  }
}
