//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

/// Prefix that marks an id as client-generated and not yet known to the
/// server.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Generate a fresh temporary id.
pub fn new_temp_id() -> String {
  format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4().simple())
}

/// Whether `id` was generated by [`new_temp_id`].
pub fn is_temp_id(id: &str) -> bool {
  id.starts_with(TEMP_ID_PREFIX)
}

/// A domain record mirrored between the server and the local store.
///
/// Implementors serialize to a JSON object. The id must serialize as a
/// string so temporary ids can be found and rewritten inside queued payloads.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier (server id, or a temporary id before first sync)
  fn id(&self) -> &str;

  /// Replace the identifier.
  fn set_id(&mut self, id: String);

  /// Entity type name for storage organization (e.g., "product")
  fn entity_type() -> &'static str;
}

/// Result from an accessor read, including data and metadata about the
/// source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Data fetched from the network or served by the in-memory cache.
  pub fn from_network(data: T, stale: bool) -> Self {
    Self {
      data,
      source: if stale {
        CacheSource::CacheStale
      } else {
        CacheSource::Network
      },
    }
  }

  /// Data read from the durable local store because the remote is
  /// unreachable.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network, or a cache entry still within its fresh window
  Network,
  /// Cache entry past its stale threshold, a background refresh was started
  CacheStale,
  /// Offline mode - network unavailable, serving the local mirror
  Offline,
}
