//! Operation state machine.
//!
//! One [`Operation`] per logical call site. It moves through
//! `Idle -> Loading -> (Retrying ->)* Success | Error`, can be retried from
//! `Error`, and returns to `Idle` on `reset()` or `cancel()`. Every
//! transition is broadcast to subscribers so a UI can render progress.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{ClassifiedError, Error, Result};
use crate::retry::{self, RetryPolicy};

/// Current state of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationState<T> {
  Idle,
  Loading,
  /// An automatic retry is in progress; `attempt` is the attempt being made
  Retrying {
    attempt: u32,
    last_error: ClassifiedError,
  },
  Success(T),
  Error(ClassifiedError),
}

/// Payload-free view of [`OperationState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Loading,
  Retrying,
  Success,
  Error,
}

impl<T> OperationState<T> {
  pub fn phase(&self) -> Phase {
    match self {
      OperationState::Idle => Phase::Idle,
      OperationState::Loading => Phase::Loading,
      OperationState::Retrying { .. } => Phase::Retrying,
      OperationState::Success(_) => Phase::Success,
      OperationState::Error(_) => Phase::Error,
    }
  }

  pub fn is_busy(&self) -> bool {
    matches!(
      self,
      OperationState::Loading | OperationState::Retrying { .. }
    )
  }

  pub fn error(&self) -> Option<&ClassifiedError> {
    match self {
      OperationState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// How a single `execute` or `retry` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
  Success(T),
  Failed(ClassifiedError),
  /// Cancelled, reset or superseded by a newer run
  Cancelled,
}

impl<T> Outcome<T> {
  pub fn success(self) -> Option<T> {
    match self {
      Outcome::Success(v) => Some(v),
      _ => None,
    }
  }
}

/// Progress events reported from inside a running operation.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
  Retrying {
    attempt: u32,
    error: ClassifiedError,
  },
}

/// Handle that lets code running inside an operation report retries.
#[derive(Clone, Default)]
pub struct Progress {
  report: Option<Arc<dyn Fn(ProgressEvent) + Send + Sync>>,
}

impl Progress {
  pub fn new(report: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
    Self {
      report: Some(Arc::new(report)),
    }
  }

  /// A handle that drops every event.
  pub fn noop() -> Self {
    Self::default()
  }

  pub fn retrying(&self, attempt: u32, error: ClassifiedError) {
    if let Some(report) = &self.report {
      report(ProgressEvent::Retrying { attempt, error });
    }
  }
}

impl fmt::Debug for Progress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Progress")
      .field("attached", &self.report.is_some())
      .finish()
  }
}

/// Passed to every action run by an [`Operation`].
#[derive(Debug, Clone)]
pub struct OperationContext {
  /// Cancelled when the operation is cancelled, reset or re-executed
  pub cancel: CancellationToken,
  pub progress: Progress,
}

impl OperationContext {
  /// A context not bound to any operation.
  pub fn detached() -> Self {
    Self {
      cancel: CancellationToken::new(),
      progress: Progress::noop(),
    }
  }
}

type Action<T> = Arc<dyn Fn(OperationContext) -> BoxFuture<'static, Result<T>> + Send + Sync>;

struct Inner<T> {
  state: OperationState<T>,
  generation: u64,
  cancel: Option<CancellationToken>,
  action: Option<Action<T>>,
}

struct Shared<T> {
  inner: Mutex<Inner<T>>,
  events: broadcast::Sender<OperationState<T>>,
}

impl<T: Clone> Shared<T> {
  fn lock(&self) -> MutexGuard<'_, Inner<T>> {
    // A panic while holding the lock leaves the state itself consistent.
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn transition(&self, inner: &mut Inner<T>, state: OperationState<T>) {
    inner.state = state.clone();
    let _ = self.events.send(state);
  }
}

/// Finite-state controller for one logical asynchronous operation.
pub struct Operation<T> {
  shared: Arc<Shared<T>>,
  retry: Option<RetryPolicy>,
}

impl<T> Clone for Operation<T> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      retry: self.retry.clone(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Default for Operation<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + Sync + 'static> Operation<T> {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      shared: Arc::new(Shared {
        inner: Mutex::new(Inner {
          state: OperationState::Idle,
          generation: 0,
          cancel: None,
          action: None,
        }),
        events,
      }),
      retry: None,
    }
  }

  /// Retry retryable failures automatically with `policy`.
  ///
  /// Leave this unset for actions that already retry internally, such as
  /// [`CacheLayer::load`](crate::cache::CacheLayer::load).
  pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
    self.retry = Some(policy);
    self
  }

  pub fn state(&self) -> OperationState<T> {
    self.shared.lock().state.clone()
  }

  /// Receive every subsequent transition.
  pub fn subscribe(&self) -> broadcast::Receiver<OperationState<T>> {
    self.shared.events.subscribe()
  }

  /// Start `action`. A run already in progress is cancelled first.
  pub async fn execute<F, Fut>(&self, action: F) -> Outcome<T>
  where
    F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let action: Action<T> = Arc::new(move |ctx| Box::pin(action(ctx)));
    self.run(action).await
  }

  /// Re-invoke the last action. Returns `None` unless the operation is in
  /// the `Error` state.
  pub async fn retry(&self) -> Option<Outcome<T>> {
    let action = {
      let inner = self.shared.lock();
      match (&inner.state, &inner.action) {
        (OperationState::Error(_), Some(action)) => Arc::clone(action),
        _ => return None,
      }
    };
    Some(self.run(action).await)
  }

  /// Cancel any run in progress and return to `Idle`.
  pub fn cancel(&self) {
    let mut inner = self.shared.lock();
    inner.generation += 1;
    if let Some(token) = inner.cancel.take() {
      token.cancel();
    }
    if !matches!(inner.state, OperationState::Idle) {
      self.shared.transition(&mut inner, OperationState::Idle);
    }
  }

  /// Like [`cancel`](Self::cancel), and also forget the last action.
  pub fn reset(&self) {
    self.cancel();
    self.shared.lock().action = None;
  }

  async fn run(&self, action: Action<T>) -> Outcome<T> {
    let (generation, token) = {
      let mut inner = self.shared.lock();
      if let Some(previous) = inner.cancel.take() {
        previous.cancel();
      }
      inner.generation += 1;
      let token = CancellationToken::new();
      inner.cancel = Some(token.clone());
      inner.action = Some(Arc::clone(&action));
      self.shared.transition(&mut inner, OperationState::Loading);
      (inner.generation, token)
    };

    let ctx = OperationContext {
      cancel: token.clone(),
      progress: self.progress_for(generation),
    };

    let result = match &self.retry {
      Some(policy) => {
        retry::run(policy, &token, &ctx.progress, |attempt_token| {
          action(OperationContext {
            cancel: attempt_token,
            progress: ctx.progress.clone(),
          })
        })
        .await
      }
      None => {
        tokio::select! {
          result = action(ctx) => result,
          _ = token.cancelled() => Err(Error::Cancelled),
        }
      }
    };

    self.settle(generation, &token, result)
  }

  fn settle(&self, generation: u64, token: &CancellationToken, result: Result<T>) -> Outcome<T> {
    let mut inner = self.shared.lock();
    if inner.generation != generation {
      return Outcome::Cancelled;
    }
    inner.cancel = None;

    match result {
      Ok(value) => {
        self
          .shared
          .transition(&mut inner, OperationState::Success(value.clone()));
        Outcome::Success(value)
      }
      Err(err) if err.is_cancelled() || token.is_cancelled() => {
        self.shared.transition(&mut inner, OperationState::Idle);
        Outcome::Cancelled
      }
      Err(err) => {
        let classified = ClassifiedError::from(&err);
        self
          .shared
          .transition(&mut inner, OperationState::Error(classified.clone()));
        Outcome::Failed(classified)
      }
    }
  }

  fn progress_for(&self, generation: u64) -> Progress {
    let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
    Progress::new(move |event| {
      let Some(shared) = weak.upgrade() else {
        return;
      };
      let mut inner = shared.lock();
      if inner.generation != generation || !inner.state.is_busy() {
        return;
      }
      match event {
        ProgressEvent::Retrying { attempt, error } => {
          shared.transition(
            &mut inner,
            OperationState::Retrying {
              attempt,
              last_error: error,
            },
          );
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn phases<T: Clone>(rx: &mut broadcast::Receiver<OperationState<T>>) -> Vec<Phase> {
    let mut out = Vec::new();
    while let Ok(state) = rx.try_recv() {
      out.push(state.phase());
    }
    out
  }

  #[tokio::test]
  async fn test_success_path() {
    let op: Operation<u32> = Operation::new();
    let mut rx = op.subscribe();
    assert_eq!(op.state(), OperationState::Idle);

    let outcome = op.execute(|_| async { Ok(7) }).await;

    assert_eq!(outcome, Outcome::Success(7));
    assert_eq!(op.state(), OperationState::Success(7));
    assert_eq!(phases(&mut rx), vec![Phase::Loading, Phase::Success]);
  }

  #[tokio::test]
  async fn test_failure_is_classified() {
    let op: Operation<()> = Operation::new();
    let outcome = op
      .execute(|_| async {
        Err(Error::Status {
          status: 403,
          message: "forbidden".to_string(),
        })
      })
      .await;

    let err = match outcome {
      Outcome::Failed(err) => err,
      other => panic!("expected failure, got {:?}", other),
    };
    assert_eq!(err.kind, ErrorKind::Permission);
    assert_eq!(op.state().error().map(|e| e.kind), Some(ErrorKind::Permission));
  }

  #[tokio::test]
  async fn test_retry_reinvokes_original_action() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let op: Operation<u32> = Operation::new();

    let first = op
      .execute(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Err(Error::Network("down".to_string()))
          } else {
            Ok(n)
          }
        }
      })
      .await;
    assert!(matches!(first, Outcome::Failed(_)));

    let second = op.retry().await;
    assert_eq!(second, Some(Outcome::Success(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Only valid from the error state
    assert_eq!(op.retry().await, None);
  }

  #[tokio::test]
  async fn test_cancel_returns_to_idle_not_error() {
    let op: Operation<()> = Operation::new();
    let runner = op.clone();
    let mut rx = op.subscribe();

    let handle = tokio::spawn(async move {
      runner
        .execute(|ctx| async move {
          ctx.cancel.cancelled().await;
          Err(Error::Cancelled)
        })
        .await
    });

    tokio::task::yield_now().await;
    while op.state() != OperationState::Loading {
      tokio::task::yield_now().await;
    }
    op.cancel();

    assert_eq!(handle.await.unwrap(), Outcome::Cancelled);
    assert_eq!(op.state(), OperationState::Idle);
    assert!(!phases(&mut rx).contains(&Phase::Error));
  }

  #[tokio::test]
  async fn test_reset_clears_error() {
    let op: Operation<()> = Operation::new();
    op.execute(|_| async { Err(Error::Network("x".to_string())) })
      .await;
    assert_eq!(op.state().phase(), Phase::Error);

    op.reset();
    assert_eq!(op.state(), OperationState::Idle);
    assert_eq!(op.retry().await, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_with_retry_reports_retrying() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let op: Operation<&'static str> = Operation::new().with_retry(RetryPolicy {
      max_attempts: 3,
      jitter: 0.0,
      base_delay: Duration::from_millis(10),
      ..Default::default()
    });
    let mut rx = op.subscribe();

    let outcome = op
      .execute(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if n == 0 {
            Err(Error::Status {
              status: 500,
              message: "oops".to_string(),
            })
          } else {
            Ok("ok")
          }
        }
      })
      .await;

    assert_eq!(outcome, Outcome::Success("ok"));
    assert_eq!(
      phases(&mut rx),
      vec![Phase::Loading, Phase::Retrying, Phase::Success]
    );
  }
}
