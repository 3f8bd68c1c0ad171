//! Boundary to the authoritative server.

mod http;

pub use http::HttpRemote;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Per-call context handed to the remote.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
  /// Cancelled when the caller gives up (timeout, supersede, shutdown)
  pub cancel: CancellationToken,
  /// Sent with mutations so a replayed request is applied at most once
  pub idempotency_key: Option<String>,
}

impl CallContext {
  pub fn new(cancel: CancellationToken) -> Self {
    Self {
      cancel,
      idempotency_key: None,
    }
  }

  pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
    self.idempotency_key = Some(key.into());
    self
  }
}

/// A record as returned by the server on create.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
  /// Server-assigned id
  pub id: String,
  pub data: Value,
}

impl RemoteRecord {
  /// Extract the server id from a record body. Numeric ids are accepted and
  /// kept as their decimal string.
  pub fn from_value(data: Value) -> Result<Self> {
    let id = match data.get("id") {
      Some(Value::String(s)) => s.clone(),
      Some(Value::Number(n)) => n.to_string(),
      _ => {
        return Err(Error::InvalidResponse(
          "record is missing an id".to_string(),
        ))
      }
    };

    let mut data = data;
    if let Some(obj) = data.as_object_mut() {
      obj.insert("id".to_string(), Value::String(id.clone()));
    }
    Ok(Self { id, data })
  }
}

/// CRUD operations against the authoritative server, per entity type.
///
/// Implementations must honor `ctx.cancel` and return [`Error::Cancelled`]
/// once it fires.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
  async fn list(&self, entity_type: &str, ctx: &CallContext) -> Result<Vec<Value>>;

  async fn get(&self, entity_type: &str, id: &str, ctx: &CallContext) -> Result<Value>;

  async fn create(
    &self,
    entity_type: &str,
    payload: &Value,
    ctx: &CallContext,
  ) -> Result<RemoteRecord>;

  async fn update(
    &self,
    entity_type: &str,
    id: &str,
    payload: &Value,
    ctx: &CallContext,
  ) -> Result<Value>;

  async fn delete(&self, entity_type: &str, id: &str, ctx: &CallContext) -> Result<()>;
}
