//! Stream pipeline: confirmation, per-stream workers, worker management

pub mod aggregator;
pub mod manager;
pub mod worker;

pub use aggregator::{ConfirmedPlay, TwoHitAggregator};
pub use manager::WorkerManager;
pub use worker::{StreamWorker, WorkerHandle, WorkerState};
