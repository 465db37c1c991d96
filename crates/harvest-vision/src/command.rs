//! Vision model backed by an external detector program.
//!
//! The program receives the image path as its last argument and prints a
//! JSON array of `{"class": "<label>", "confidence": <0..1>}` objects on
//! stdout. A non-zero exit or unparsable output is a detection failure for
//! that image only.

use tracing::debug;

use harvest_core::command::CommandRunner;
use harvest_core::config::CommandConfig;
use harvest_core::error::HarvestError;
use harvest_core::types::Detection;

use crate::{ImageData, VisionModel};

/// Vision model that shells out once per image.
#[derive(Debug, Clone)]
pub struct CommandVisionModel {
    runner: CommandRunner,
}

impl CommandVisionModel {
    /// Create a command-backed model from the configured program.
    pub fn new(config: CommandConfig) -> Self {
        Self {
            runner: CommandRunner::new(config),
        }
    }

    /// Get a reference to the command configuration.
    pub fn config(&self) -> &CommandConfig {
        self.runner.config()
    }
}

impl VisionModel for CommandVisionModel {
    async fn detect(&self, image: &ImageData) -> Result<Vec<Detection>, HarvestError> {
        if image.bytes.is_empty() {
            return Err(HarvestError::Vision("Empty image data".into()));
        }

        let path = image.path.to_string_lossy().to_string();
        let output = self
            .runner
            .run_checked(&[("image", path.as_str())], &[path.clone()])
            .await
            .map_err(|e| HarvestError::Vision(e.to_string()))?;

        let detections = parse_detections(&output.stdout)?;
        debug!(image = %path, detections = detections.len(), "Detector finished");
        Ok(detections)
    }
}

/// Parse the detector's stdout.
fn parse_detections(stdout: &str) -> Result<Vec<Detection>, HarvestError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(HarvestError::Vision("detector printed no output".into()));
    }
    serde_json::from_str(trimmed)
        .map_err(|e| HarvestError::Vision(format!("invalid detector output: {}", e)))
}
