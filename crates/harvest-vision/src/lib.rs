//! Harvest vision crate - object detection trait and implementations.
//!
//! Provides the VisionModel trait for labelling objects in images, a
//! MockVisionModel for testing, and a CommandVisionModel that delegates to
//! an external detector program.

pub mod command;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use harvest_core::error::HarvestError;
use harvest_core::types::Detection;

pub use command::CommandVisionModel;

/// One image handed to a vision model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl ImageData {
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes,
        }
    }

    /// File name without extension; for downloaded media this is the
    /// message identifier.
    pub fn stem(&self) -> Option<&str> {
        self.path.file_stem().and_then(|s| s.to_str())
    }
}

/// Service for detecting labelled objects in images.
///
/// Implementations wrap a concrete detector (a local model, an external
/// program) behind a uniform async interface.
pub trait VisionModel: Send + Sync {
    /// Detect objects in one image.
    ///
    /// # Returns
    /// Every detected object with its confidence. May be empty if nothing
    /// was recognised.
    fn detect(
        &self,
        image: &ImageData,
    ) -> impl std::future::Future<Output = Result<Vec<Detection>, HarvestError>> + Send;
}

/// Mock vision model for testing.
///
/// Returns the same detections for every image without running a detector.
#[derive(Debug, Clone)]
pub struct MockVisionModel {
    detections: Vec<Detection>,
    fail_stems: HashSet<String>,
    calls: Arc<AtomicUsize>,
}

impl MockVisionModel {
    /// Create a mock that reports a bottle and a person.
    pub fn new() -> Self {
        Self::with_detections(vec![
            Detection::new("bottle", 0.91),
            Detection::new("person", 0.76),
        ])
    }

    /// Create a mock that returns the given detections.
    pub fn with_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            fail_stems: HashSet::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make detection fail for images whose file stem matches.
    pub fn failing_on(mut self, stem: &str) -> Self {
        self.fail_stems.insert(stem.to_string());
        self
    }

    /// Number of `detect` calls made so far, across clones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockVisionModel {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionModel for MockVisionModel {
    async fn detect(&self, image: &ImageData) -> Result<Vec<Detection>, HarvestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.bytes.is_empty() {
            return Err(HarvestError::Vision("Empty image data".to_string()));
        }
        if image.stem().is_some_and(|s| self.fail_stems.contains(s)) {
            return Err(HarvestError::Vision(format!(
                "mock failure for {}",
                image.path.display()
            )));
        }
        Ok(self.detections.clone())
    }
}
