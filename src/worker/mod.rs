//! Worker pool: pulls jobs from named queues and dispatches them.
//!
//! Core components:
//! - `pool`: per-queue pull loops with a concurrency cap and retry bookkeeping
//! - `rate_limit`: sliding-window limiter on job starts

pub mod pool;
pub mod rate_limit;

use async_trait::async_trait;

use crate::error::Error;
use crate::queue::Job;

pub use pool::{WorkerOptions, WorkerPool};
pub use rate_limit::{RateLimit, RateLimiter};

/// Executes one claimed job. `Ok` completes it; `Err` fails it and lets the
/// queue's retry policy decide what happens next.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<(), Error>;
}
