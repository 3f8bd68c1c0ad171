use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{CallContext, Remote, RemoteRecord};
use crate::error::{Error, Result};

/// Longest server error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// REST remote: `GET/POST {base}/{type}` and `GET/PUT/DELETE
/// {base}/{type}/{id}`, JSON bodies, optional bearer auth.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
    let base = Url::parse(base_url)
      .map_err(|e| Error::Config(format!("Invalid remote url {}: {}", base_url, e)))?;
    if base.cannot_be_a_base() {
      return Err(Error::Config(format!(
        "Remote url cannot be a base: {}",
        base_url
      )));
    }

    let client = Client::builder()
      .gzip(true)
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn url(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  fn request(&self, method: Method, url: Url, ctx: &CallContext) -> RequestBuilder {
    let mut req = self.client.request(method, url);
    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }
    if let Some(key) = &ctx.idempotency_key {
      req = req.header("Idempotency-Key", key);
    }
    req
  }

  /// Send a request, giving up as soon as the caller cancels.
  async fn send(&self, req: RequestBuilder, ctx: &CallContext) -> Result<Response> {
    let response = tokio::select! {
      biased;
      _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
      response = req.send() => response.map_err(|e| Error::Network(e.to_string()))?,
    };

    let status = response.status();
    debug!(url = %response.url(), status = status.as_u16(), "Remote call");
    if status.is_success() {
      return Ok(response);
    }

    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
      let mut end = MAX_ERROR_BODY;
      while !message.is_char_boundary(end) {
        end -= 1;
      }
      message.truncate(end);
    }
    if message.is_empty() {
      message = status.canonical_reason().unwrap_or("request failed").to_string();
    }
    Err(Error::Status {
      status: status.as_u16(),
      message,
    })
  }

  async fn json(&self, response: Response, ctx: &CallContext) -> Result<Value> {
    tokio::select! {
      biased;
      _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
      body = response.json::<Value>() => {
        body.map_err(|e| Error::InvalidResponse(e.to_string()))
      }
    }
  }
}

#[async_trait]
impl Remote for HttpRemote {
  async fn list(&self, entity_type: &str, ctx: &CallContext) -> Result<Vec<Value>> {
    let req = self.request(Method::GET, self.url(&[entity_type]), ctx);
    let response = self.send(req, ctx).await?;
    match self.json(response, ctx).await? {
      Value::Array(items) => Ok(items),
      other => Err(Error::InvalidResponse(format!(
        "expected a list of {}, got {}",
        entity_type,
        type_name(&other)
      ))),
    }
  }

  async fn get(&self, entity_type: &str, id: &str, ctx: &CallContext) -> Result<Value> {
    let req = self.request(Method::GET, self.url(&[entity_type, id]), ctx);
    let response = self.send(req, ctx).await?;
    self.json(response, ctx).await
  }

  async fn create(
    &self,
    entity_type: &str,
    payload: &Value,
    ctx: &CallContext,
  ) -> Result<RemoteRecord> {
    let req = self
      .request(Method::POST, self.url(&[entity_type]), ctx)
      .json(payload);
    let response = self.send(req, ctx).await?;
    RemoteRecord::from_value(self.json(response, ctx).await?)
  }

  async fn update(
    &self,
    entity_type: &str,
    id: &str,
    payload: &Value,
    ctx: &CallContext,
  ) -> Result<Value> {
    let req = self
      .request(Method::PUT, self.url(&[entity_type, id]), ctx)
      .json(payload);
    let response = self.send(req, ctx).await?;
    self.json(response, ctx).await
  }

  async fn delete(&self, entity_type: &str, id: &str, ctx: &CallContext) -> Result<()> {
    let req = self.request(Method::DELETE, self.url(&[entity_type, id]), ctx);
    self.send(req, ctx).await?;
    Ok(())
  }
}

fn type_name(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}
