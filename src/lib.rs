//! Client-side data resilience: a resilient read path (TTL cache, request
//! dedup, stale-while-revalidate, timeouts and retry) and an offline write
//! path (durable local mirror plus a replayed mutation queue with temporary
//! id reconciliation).

pub mod accessor;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod operation;
pub mod remote;
pub mod retry;
pub mod sync;

pub use accessor::EntityAccessor;
pub use cache::{CacheLayer, CacheResult, CacheSource, Entity, SqliteStorage};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use error::{ClassifiedError, Error, ErrorKind, Result, Severity};
pub use operation::{Operation, OperationContext, OperationState, Outcome};
pub use sync::{ReplayEngine, SyncQueue};
