//! Enrichment coordinator.
//!
//! For each image: read the file, run the vision model once, and append
//! every detection in one transaction. Any failure along the way fails
//! that image only.

use std::fmt;
use std::path::PathBuf;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use harvest_core::cancel::CancelSignal;
use harvest_core::error::Result;
use harvest_core::types::{MediaItem, RecordId, StageReport, UnreadableDir};
use harvest_storage::DetectionRepository;
use harvest_vision::{ImageData, VisionModel};

use crate::media::MediaStore;

/// Result of enriching one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Number of detections appended.
    Recorded(usize),
    Failed(String),
}

/// A contained failure of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub message_id: RecordId,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.message_id, self.path.display(), self.message)
    }
}

/// Counts for one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichSummary {
    pub images_processed: u64,
    pub detections_recorded: u64,
    pub images_failed: u64,
    pub errors: Vec<ItemError>,
    /// Channel directories that could not be listed.
    pub unreadable_dirs: Vec<UnreadableDir>,
    /// Cancellation stopped the pass before every image was visited.
    pub interrupted: bool,
}

impl EnrichSummary {
    fn record(&mut self, item: &MediaItem, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Recorded(count) => {
                self.images_processed += 1;
                self.detections_recorded += count as u64;
            }
            ItemOutcome::Failed(message) => {
                self.images_failed += 1;
                self.errors.push(ItemError {
                    message_id: item.message_id.clone(),
                    path: item.path.clone(),
                    message,
                });
            }
        }
    }
}

impl From<EnrichSummary> for StageReport {
    fn from(summary: EnrichSummary) -> Self {
        let dir_errors = summary
            .unreadable_dirs
            .iter()
            .map(|d| format!("{}: {}", d.path.display(), d.reason));
        StageReport {
            succeeded: summary.images_processed,
            skipped: 0,
            failed: summary.images_failed + summary.unreadable_dirs.len() as u64,
            errors: summary
                .errors
                .iter()
                .map(|e| e.to_string())
                .chain(dir_errors)
                .collect(),
        }
    }
}

/// Runs a vision model over media items and records the detections.
pub struct EnrichmentCoordinator<V: VisionModel> {
    model: V,
    detections: DetectionRepository,
    workers: usize,
}

impl<V: VisionModel> EnrichmentCoordinator<V> {
    /// `workers` bounds how many images are in flight at once.
    pub fn new(model: V, detections: DetectionRepository, workers: usize) -> Self {
        Self {
            model,
            detections,
            workers: workers.max(1),
        }
    }

    /// Enrich every item. Never fails as a whole.
    ///
    /// Once `cancel` is raised no further image is started; images already
    /// in flight finish and are counted.
    pub async fn enrich(&self, items: Vec<MediaItem>, cancel: &CancelSignal) -> EnrichSummary {
        let total = items.len();
        let mut summary = EnrichSummary::default();

        let tasks: Vec<_> = items
            .into_iter()
            .map(|item| async move {
                if cancel.is_cancelled() {
                    return (item, None);
                }
                let outcome = self.process_item(&item).await;
                (item, Some(outcome))
            })
            .collect();
        let mut outcomes = stream::iter(tasks).buffer_unordered(self.workers);

        while let Some((item, outcome)) = outcomes.next().await {
            let Some(outcome) = outcome else {
                summary.interrupted = true;
                continue;
            };
            if let ItemOutcome::Failed(reason) = &outcome {
                warn!(
                    message_id = %item.message_id,
                    path = %item.path.display(),
                    error = %reason,
                    "Image enrichment failed"
                );
            }
            summary.record(&item, outcome);
        }

        if summary.interrupted {
            warn!(
                images = total,
                processed = summary.images_processed,
                "Enrichment interrupted by cancellation"
            );
        } else {
            info!(
                images = total,
                processed = summary.images_processed,
                detections = summary.detections_recorded,
                failed = summary.images_failed,
                "Enrichment finished"
            );
        }
        summary
    }

    /// Discover media under the store and enrich all of it. Channel
    /// directories that cannot be listed are counted as failures.
    pub async fn enrich_from_store(
        &self,
        store: &MediaStore,
        cancel: &CancelSignal,
    ) -> Result<EnrichSummary> {
        let listing = store.discover()?;
        info!(
            root = %store.root().display(),
            images = listing.items.len(),
            unreadable_dirs = listing.unreadable.len(),
            "Discovered media"
        );
        let mut summary = self.enrich(listing.items, cancel).await;
        summary.unreadable_dirs = listing.unreadable;
        Ok(summary)
    }

    /// Enrich one image.
    pub async fn process_item(&self, item: &MediaItem) -> ItemOutcome {
        let bytes = match tokio::fs::read(&item.path).await {
            Ok(bytes) => bytes,
            Err(e) => return ItemOutcome::Failed(format!("unreadable image: {}", e)),
        };
        if bytes.is_empty() {
            return ItemOutcome::Failed("empty image file".to_string());
        }

        let image = ImageData::new(item.path.clone(), bytes);
        let detections = match self.model.detect(&image).await {
            Ok(detections) => detections,
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        };
        debug!(message_id = %item.message_id, detections = detections.len(), "Image analysed");

        let repo = self.detections.clone();
        let message_id = item.message_id.clone();
        let channel = item.channel.clone();
        let written = tokio::task::spawn_blocking(move || {
            repo.append_all(&message_id, &channel, &detections)
        })
        .await;

        match written {
            Ok(Ok(count)) => ItemOutcome::Recorded(count),
            Ok(Err(e)) => ItemOutcome::Failed(e.to_string()),
            Err(e) => ItemOutcome::Failed(format!("write task failed: {}", e)),
        }
    }
}
