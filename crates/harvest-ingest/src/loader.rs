//! Idempotent ingestion of raw partitions into the message table.
//!
//! Every record is handled on its own: a missing identifier or an
//! identifier that is already stored is skipped, a rejected write is
//! counted as failed, and none of these stop the remaining records.

use std::fmt;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use harvest_core::cancel::CancelSignal;
use harvest_core::error::Result;
use harvest_core::types::{RawPartition, RawRecord, RecordId, StageReport};
use harvest_storage::{MessageRepository, WriteOutcome};

use crate::partition::{PartitionRef, RawStore};

/// Why a record was not inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingIdentifier,
    AlreadyPresent,
}

/// Result of loading one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Skipped(SkipReason),
    Failed(String),
}

/// A contained failure, either of one record or of a whole partition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError {
    pub partition: String,
    /// Position in the partition; `None` when the partition itself failed.
    pub index: Option<usize>,
    pub record_id: Option<RecordId>,
    pub message: String,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.index, &self.record_id) {
            (Some(index), Some(id)) => {
                write!(f, "{}[{}] id {}: {}", self.partition, index, id, self.message)
            }
            (Some(index), None) => write!(f, "{}[{}]: {}", self.partition, index, self.message),
            (None, _) => write!(f, "{}: {}", self.partition, self.message),
        }
    }
}

/// Counts for one load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub partitions_loaded: u64,
    pub partitions_failed: u64,
    pub errors: Vec<RecordError>,
    /// Cancellation stopped the load before every record was visited.
    pub interrupted: bool,
}

impl LoadSummary {
    /// Fold another summary into this one.
    pub fn merge(&mut self, other: LoadSummary) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.partitions_loaded += other.partitions_loaded;
        self.partitions_failed += other.partitions_failed;
        self.errors.extend(other.errors);
        self.interrupted |= other.interrupted;
    }

    fn partition_failed(partition: String, message: String) -> Self {
        Self {
            partitions_failed: 1,
            errors: vec![RecordError {
                partition,
                index: None,
                record_id: None,
                message,
            }],
            ..Self::default()
        }
    }
}

impl From<LoadSummary> for StageReport {
    fn from(summary: LoadSummary) -> Self {
        StageReport {
            succeeded: summary.inserted,
            skipped: summary.skipped,
            failed: summary.failed + summary.partitions_failed,
            errors: summary.errors.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Loads raw partitions into the message table.
#[derive(Clone, Debug)]
pub struct IngestionLoader {
    messages: MessageRepository,
    workers: usize,
    cancel: CancelSignal,
}

impl IngestionLoader {
    /// `workers` bounds how many partitions are loaded at once.
    pub fn new(messages: MessageRepository, workers: usize) -> Self {
        Self {
            messages,
            workers: workers.max(1),
            cancel: CancelSignal::new(),
        }
    }

    /// Stop between records once `cancel` is raised. Rows already written
    /// stay stored.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Insert one record unless it lacks an identifier or is already stored.
    pub fn load_record(&self, record: &RawRecord, partition_date: Option<NaiveDate>) -> RecordOutcome {
        let Some(id) = &record.id else {
            return RecordOutcome::Skipped(SkipReason::MissingIdentifier);
        };
        match self.messages.insert_if_absent(id, record, partition_date) {
            Ok(WriteOutcome::Inserted) => RecordOutcome::Inserted,
            Ok(WriteOutcome::AlreadyPresent) => RecordOutcome::Skipped(SkipReason::AlreadyPresent),
            Err(e) => RecordOutcome::Failed(e.to_string()),
        }
    }

    /// Load every record of one partition. Rows are committed one at a time,
    /// so earlier rows stay stored when a later record fails.
    pub fn load_partition(&self, partition: &RawPartition) -> LoadSummary {
        let key = partition.key();
        let mut summary = LoadSummary::default();

        for (index, record) in partition.records.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(partition = %key, loaded = index, "Partition load interrupted");
                summary.interrupted = true;
                return summary;
            }
            match self.load_record(record, Some(partition.date)) {
                RecordOutcome::Inserted => summary.inserted += 1,
                RecordOutcome::Skipped(SkipReason::AlreadyPresent) => {
                    debug!(partition = %key, index, id = ?record.id, "Message already stored");
                    summary.skipped += 1;
                }
                RecordOutcome::Skipped(SkipReason::MissingIdentifier) => {
                    warn!(partition = %key, index, "Skipping message without identifier");
                    summary.skipped += 1;
                }
                RecordOutcome::Failed(message) => {
                    warn!(partition = %key, index, id = ?record.id, error = %message, "Failed to store message");
                    summary.failed += 1;
                    summary.errors.push(RecordError {
                        partition: key.clone(),
                        index: Some(index),
                        record_id: record.id.clone(),
                        message,
                    });
                }
            }
        }

        summary.partitions_loaded = 1;
        info!(
            partition = %key,
            inserted = summary.inserted,
            skipped = summary.skipped,
            failed = summary.failed,
            "Loaded partition"
        );
        summary
    }

    /// Load already-parsed partitions concurrently.
    pub async fn load(&self, partitions: Vec<RawPartition>) -> LoadSummary {
        let tasks = partitions.into_iter().map(|partition| {
            let loader = self.clone();
            async move {
                let key = partition.key();
                match tokio::task::spawn_blocking(move || loader.load_partition(&partition)).await {
                    Ok(summary) => summary,
                    Err(e) => LoadSummary::partition_failed(key, format!("load task failed: {}", e)),
                }
            }
        });

        self.collect(tasks).await
    }

    /// Discover and load every partition in the store.
    ///
    /// Only failing to list the store root is an error. A date directory
    /// that cannot be listed, or a partition that cannot be read or parsed,
    /// is counted in `partitions_failed` and the rest are still loaded.
    pub async fn load_from_store(&self, store: &RawStore) -> Result<LoadSummary> {
        let listing = store.discover()?;
        info!(
            root = %store.root().display(),
            partitions = listing.partitions.len(),
            unreadable_dirs = listing.unreadable.len(),
            "Discovered raw partitions"
        );

        let tasks = listing.partitions.into_iter().map(|partition_ref| {
            let loader = self.clone();
            let store = store.clone();
            async move {
                let key = partition_ref.key();
                let result = tokio::task::spawn_blocking(move || {
                    loader.read_and_load(&store, &partition_ref)
                })
                .await;
                match result {
                    Ok(summary) => summary,
                    Err(e) => LoadSummary::partition_failed(key, format!("load task failed: {}", e)),
                }
            }
        });

        let mut summary = self.collect(tasks).await;
        for dir in listing.unreadable {
            summary.merge(LoadSummary::partition_failed(
                dir.path.display().to_string(),
                dir.reason,
            ));
        }
        Ok(summary)
    }

    fn read_and_load(&self, store: &RawStore, partition_ref: &PartitionRef) -> LoadSummary {
        if self.cancel.is_cancelled() {
            return LoadSummary {
                interrupted: true,
                ..LoadSummary::default()
            };
        }
        match store.read(partition_ref) {
            Ok(partition) => self.load_partition(&partition),
            Err(e) => {
                warn!(partition = %partition_ref.key(), error = %e, "Skipping unreadable partition");
                LoadSummary::partition_failed(partition_ref.key(), e.to_string())
            }
        }
    }

    /// Drain every task. After cancellation the remaining tasks return at
    /// once, so this only waits for records already being written.
    async fn collect<I, F>(&self, tasks: I) -> LoadSummary
    where
        I: Iterator<Item = F>,
        F: std::future::Future<Output = LoadSummary>,
    {
        let summary = stream::iter(tasks)
            .buffer_unordered(self.workers)
            .fold(LoadSummary::default(), |mut total, summary| async move {
                total.merge(summary);
                total
            })
            .await;
        if summary.interrupted {
            warn!(
                inserted = summary.inserted,
                partitions_loaded = summary.partitions_loaded,
                "Load interrupted by cancellation"
            );
        }
        summary
    }
}
