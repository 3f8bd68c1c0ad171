//! Offline write path: the persisted mutation queue and the engine that
//! replays it once connectivity returns.

mod queue;
mod replay;

pub use queue::{OperationKind, OperationStatus, SyncOperation, SyncQueue};
pub use replay::{DrainResult, ReplayConfig, ReplayEngine};
