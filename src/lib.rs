// ABOUTME: Library root for branch-replicator
// ABOUTME: Snapshot-diff replication of MatrixOne tables and databases

pub mod apply;
pub mod archeology;
pub mod bootstrap;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod lease;
pub mod report;
pub mod sql;
pub mod store;
pub mod task;
pub mod utils;
pub mod verify;
pub mod watermark;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
