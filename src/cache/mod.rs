//! Read path: the durable local store and the resilient fetch orchestrator.
//!
//! - `storage`: SQLite mirror of remote entities plus the persisted sync queue
//! - `layer`: in-memory TTL cache with request dedup, stale-while-revalidate,
//!   per-attempt timeouts and retry
//! - `traits`: the `Entity` contract and read result metadata

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, CachePolicy, LoadOptions};
pub use storage::{EntityStore, LocalStore, QueueStore, SqliteStorage};
pub use traits::{is_temp_id, new_temp_id, CacheResult, CacheSource, Entity, TEMP_ID_PREFIX};
