//! Harvest storage crate - SQLite persistence for the pipeline.
//!
//! Provides a WAL-mode SQLite database with migrations, repositories for
//! ingested messages, detections and run history, and read-only report
//! queries. Every statement is parameterized.

pub mod db;
pub mod migrations;
pub mod queries;
pub mod repository;

pub use db::Database;
pub use queries::{ChannelActivityRow, ObjectClassRow, QueryService, StoreStats};
pub use repository::{
    duration_millis, DetectionRepository, MessageRepository, RunRepository, WriteOutcome,
};
