//! Error types and the failure taxonomy shared by the read and write paths.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by remote calls, the local store and the sync queue.
///
/// Cloneable so that every caller joined onto one deduplicated request can
/// receive the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
  /// The remote answered with a non-success status code.
  #[error("request failed with status {status}: {message}")]
  Status { status: u16, message: String },

  /// The request never produced a response (connection refused, reset, DNS).
  #[error("network error: {0}")]
  Network(String),

  /// An attempt did not settle within its deadline.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  /// The attempt was cancelled by its owner or superseded.
  #[error("request cancelled")]
  Cancelled,

  /// The remote answered but the body was not what we expected.
  #[error("invalid response: {0}")]
  InvalidResponse(String),

  /// Local store failure.
  #[error("storage error: {0}")]
  Storage(String),

  /// Serialization failure.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// No queued operation with this id.
  #[error("operation not found: {0}")]
  OperationNotFound(String),

  /// Invalid configuration (bad url, missing section).
  #[error("configuration error: {0}")]
  Config(String),

  /// Queued operations reached the retry ceiling during a drain.
  #[error("{count} queued change(s) could not be synced: {last}")]
  ReplayFailed { count: usize, last: Box<Error> },
}

impl Error {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Error::Cancelled)
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

/// Failure category used to pick a presentation and a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
  Network,
  Validation,
  Server,
  Permission,
  Unknown,
}

/// Visual weight of a surfaced error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Low,
  Medium,
  High,
  Critical,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorKind::Network => "network",
      ErrorKind::Validation => "validation",
      ErrorKind::Server => "server",
      ErrorKind::Permission => "permission",
      ErrorKind::Unknown => "unknown",
    };
    f.write_str(s)
  }
}

/// An error as presented to a caller: what went wrong, how bad it is and
/// whether trying again can help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
  pub kind: ErrorKind,
  pub severity: Severity,
  pub message: String,
  pub retryable: bool,
  pub details: Option<String>,
}

impl ClassifiedError {
  fn new(kind: ErrorKind, severity: Severity, retryable: bool, message: String) -> Self {
    Self {
      kind,
      severity,
      message,
      retryable,
      details: None,
    }
  }

  /// Classify an HTTP-like status code.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 | 403 => Self::new(ErrorKind::Permission, Severity::Critical, false, message),
      400 | 422 => Self::new(ErrorKind::Validation, Severity::Low, false, message),
      // Remaining client errors cannot succeed on a resend.
      402..=499 => Self::new(ErrorKind::Unknown, Severity::Medium, false, message),
      500..=599 => Self::new(ErrorKind::Server, Severity::High, true, message),
      _ => Self::new(ErrorKind::Unknown, Severity::Medium, true, message),
    }
  }

  pub fn with_details(mut self, details: impl Into<String>) -> Self {
    self.details = Some(details.into());
    self
  }
}

impl From<&Error> for ClassifiedError {
  fn from(err: &Error) -> Self {
    match err {
      Error::Status { status, message } => {
        Self::from_status(*status, message.clone()).with_details(format!("status {}", status))
      }
      Error::Network(_) | Error::Timeout(_) => {
        Self::new(ErrorKind::Network, Severity::Medium, true, err.to_string())
      }
      Error::Cancelled => Self::new(ErrorKind::Unknown, Severity::Low, false, err.to_string()),
      Error::ReplayFailed { last, .. } => {
        let inner = ClassifiedError::from(last.as_ref());
        Self {
          message: err.to_string(),
          retryable: false,
          details: Some(inner.message),
          ..inner
        }
      }
      Error::InvalidResponse(_) => {
        Self::new(ErrorKind::Unknown, Severity::Medium, true, err.to_string())
      }
      // Local failures; a resend does not change the outcome
      Error::Storage(_) | Error::Serialization(_) | Error::OperationNotFound(_) => {
        Self::new(ErrorKind::Unknown, Severity::High, false, err.to_string())
      }
      Error::Config(_) => Self::new(ErrorKind::Unknown, Severity::High, false, err.to_string()),
    }
  }
}

impl fmt::Display for ClassifiedError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] {}", self.kind, self.message)
  }
}
