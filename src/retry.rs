//! Timeouts and retry with exponential backoff.
//!
//! Every attempt runs under its own child [`CancellationToken`]. When the
//! attempt times out or its parent is cancelled, the child token is cancelled
//! and the attempt future is dropped, so nothing keeps running after the
//! caller has been told the attempt is over.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ClassifiedError, Error, Result};
use crate::operation::Progress;

/// How many times to try, how long to wait between tries and how long a
/// single try may take.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  /// Delay after the first failure
  pub base_delay: Duration,
  /// Upper bound for any single delay
  pub max_delay: Duration,
  /// Random spread applied to each delay, as a fraction of it (0.1 = ±10%)
  pub jitter: f64,
  /// Deadline for a single attempt
  pub timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(300),
      max_delay: Duration::from_secs(5),
      jitter: 0.1,
      timeout: Duration::from_secs(10),
    }
  }
}

impl RetryPolicy {
  /// Delay to wait after `failures` consecutive failed attempts.
  pub fn backoff(&self, failures: u32) -> Duration {
    let delay = exponential(self.base_delay, self.max_delay, failures);
    if self.jitter <= 0.0 || delay.is_zero() {
      return delay;
    }

    let secs = delay.as_secs_f64();
    let spread = secs * self.jitter;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((secs + offset).max(0.0))
  }
}

/// `base * 2^(failures - 1)`, capped at `max`.
pub fn exponential(base: Duration, max: Duration, failures: u32) -> Duration {
  let exp = failures.saturating_sub(1).min(16);
  base.saturating_mul(1u32 << exp).min(max)
}

/// Run a single attempt bounded by `timeout` and `cancel`.
pub async fn attempt<T, F, Fut>(timeout: Duration, cancel: &CancellationToken, f: F) -> Result<T>
where
  F: FnOnce(CancellationToken) -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let token = cancel.child_token();
  let fut = f(token.clone());

  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(Error::Cancelled),
    result = tokio::time::timeout(timeout, fut) => match result {
      Ok(result) => result,
      Err(_) => {
        token.cancel();
        Err(Error::Timeout(timeout))
      }
    },
  }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. Cancellation is returned immediately and
/// never retried.
pub async fn run<T, F, Fut>(
  policy: &RetryPolicy,
  cancel: &CancellationToken,
  progress: &Progress,
  mut f: F,
) -> Result<T>
where
  F: FnMut(CancellationToken) -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt_no = 1;

  loop {
    let err = match attempt(policy.timeout, cancel, |token| f(token)).await {
      Ok(value) => return Ok(value),
      Err(err) if err.is_cancelled() => return Err(err),
      Err(err) => err,
    };

    let classified = ClassifiedError::from(&err);
    if !classified.retryable || attempt_no >= max_attempts {
      return Err(err);
    }

    let delay = policy.backoff(attempt_no);
    attempt_no += 1;
    debug!(attempt = attempt_no, ?delay, error = %err, "Retrying after failure");
    progress.retrying(attempt_no, classified);

    tokio::select! {
      _ = cancel.cancelled() => return Err(Error::Cancelled),
      _ = tokio::time::sleep(delay) => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      jitter: 0.0,
      ..Default::default()
    }
  }

  fn unavailable() -> Error {
    Error::Status {
      status: 503,
      message: "unavailable".to_string(),
    }
  }

  #[test]
  fn test_exponential_doubles_and_caps() {
    let base = Duration::from_millis(100);
    let max = Duration::from_millis(1000);
    assert_eq!(exponential(base, max, 1), Duration::from_millis(100));
    assert_eq!(exponential(base, max, 2), Duration::from_millis(200));
    assert_eq!(exponential(base, max, 3), Duration::from_millis(400));
    assert_eq!(exponential(base, max, 10), max);
  }

  #[test]
  fn test_jitter_stays_within_spread() {
    let policy = RetryPolicy {
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(10),
      jitter: 0.1,
      ..Default::default()
    };
    for _ in 0..50 {
      let d = policy.backoff(1);
      assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_retries_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = run(&policy(3), &CancellationToken::new(), &Progress::noop(), |_| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < 2 {
          Err(unavailable())
        } else {
          Ok("done")
        }
      }
    })
    .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<()> = run(&policy(2), &CancellationToken::new(), &Progress::noop(), |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err(unavailable()) }
    })
    .await;

    assert_eq!(result, Err(unavailable()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_non_retryable_fails_fast() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<()> = run(&policy(5), &CancellationToken::new(), &Progress::noop(), |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      async {
        Err(Error::Status {
          status: 422,
          message: "bad".to_string(),
        })
      }
    })
    .await;

    assert!(matches!(result, Err(Error::Status { status: 422, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_local_failure_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<()> = run(&policy(5), &CancellationToken::new(), &Progress::noop(), |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      async { Err(Error::Storage("database is locked".to_string())) }
    })
    .await;

    assert!(matches!(result, Err(Error::Storage(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_cancels_attempt_token() {
    let seen = Arc::new(std::sync::Mutex::new(None::<CancellationToken>));
    let slot = seen.clone();

    let result: Result<()> = attempt(
      Duration::from_secs(1),
      &CancellationToken::new(),
      |token| {
        *slot.lock().unwrap() = Some(token);
        futures::future::pending()
      },
    )
    .await;

    assert_eq!(result, Err(Error::Timeout(Duration::from_secs(1))));
    let token = seen.lock().unwrap().take().unwrap();
    assert!(token.is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancellation_is_not_retried() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let trigger = cancel.clone();

    let result: Result<()> = run(&policy(5), &cancel, &Progress::noop(), |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      trigger.cancel();
      async { Err(unavailable()) }
    })
    .await;

    assert_eq!(result, Err(Error::Cancelled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
