//! Harvest ingest crate - raw partition store and idempotent loading.
//!
//! The raw store holds scraped output as one JSON file per (date, channel).
//! The loader reads partitions and upserts every record with a usable
//! identifier into the message table, skipping identifiers already present.

pub mod loader;
pub mod partition;

pub use loader::{IngestionLoader, LoadSummary, RecordError, RecordOutcome, SkipReason};
pub use partition::{PartitionListing, PartitionRef, RawStore};
