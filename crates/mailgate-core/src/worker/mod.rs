//! Delivery workers

mod pool;

pub use pool::{JobOutcome, WorkerPool};
