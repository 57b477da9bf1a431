//! Report jobs: durable job queue, worker pool and GitHub workflow monitor.

pub mod api;
pub mod clock;
pub mod collab;
pub mod config;
pub mod error;
pub mod github;
pub mod monitor;
pub mod notification;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;
