use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HarvestError, Result};
use crate::types::StageName;

/// Top-level configuration for the Harvest pipeline.
///
/// Loaded from `harvest.toml` by default. Each section corresponds to one
/// component or external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub raw_store: RawStoreConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub vision: VisionConfig,
}

impl HarvestConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HarvestConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Apply `HARVEST_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HARVEST_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("HARVEST_RAW_ROOT") {
            self.raw_store.root = v;
        }
        if let Some(v) = lookup("HARVEST_MEDIA_ROOT") {
            self.media.root = v;
        }
        if let Some(v) = lookup("HARVEST_LOG_LEVEL") {
            self.general.log_level = v;
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.load == 0 || self.workers.enrich == 0 {
            return Err(HarvestError::Config(
                "worker counts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.stage_timeout_secs == Some(0) {
            return Err(HarvestError::Config(
                "pipeline.stage_timeout_secs must be positive".to_string(),
            ));
        }
        if self.media.extensions.is_empty() {
            return Err(HarvestError::Config(
                "media.extensions must not be empty".to_string(),
            ));
        }
        if self.stages.scrape && self.scrape.command.program.trim().is_empty() {
            return Err(HarvestError::Config(
                "scrape.command.program is required when the scrape stage is enabled".to_string(),
            ));
        }
        if self.stages.transform && self.transform.command.program.trim().is_empty() {
            return Err(HarvestError::Config(
                "transform.command.program is required when the transform stage is enabled"
                    .to_string(),
            ));
        }
        if self.stages.enrich && self.vision.command.program.trim().is_empty() {
            return Err(HarvestError::Config(
                "vision.command.program is required when the enrich stage is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Base directory for pipeline data.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: String,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/harvest.db".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Partitioned raw store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStoreConfig {
    /// Root holding `<date>/<channel>.json` partitions.
    pub root: String,
}

impl Default for RawStoreConfig {
    fn default() -> Self {
        Self {
            root: "data/raw/telegram_messages".to_string(),
        }
    }
}

/// Downloaded media settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Root holding `<channel>/<message-id>.<ext>` images.
    pub root: String,
    /// Image extensions considered for enrichment (case-insensitive).
    pub extensions: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: "data/raw/images".to_string(),
            extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
        }
    }
}

/// Per-stage enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub scrape: bool,
    pub load: bool,
    pub transform: bool,
    pub enrich: bool,
}

impl StagesConfig {
    pub fn is_enabled(&self, stage: StageName) -> bool {
        match stage {
            StageName::Scrape => self.scrape,
            StageName::Load => self.load,
            StageName::Transform => self.transform,
            StageName::Enrich => self.enrich,
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            scrape: true,
            load: true,
            transform: true,
            enrich: true,
        }
    }
}

/// Bounded intra-stage parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Partitions loaded concurrently.
    pub load: usize,
    /// Media items analysed concurrently.
    pub enrich: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { load: 4, enrich: 2 }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline applied to each stage invocation. No deadline when unset.
    pub stage_timeout_secs: Option<u64>,
}

/// An external program invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Extra environment, e.g. API credentials for the scraper.
    pub env: BTreeMap<String, String>,
}

impl CommandConfig {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// Channel scraper collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Invoked once per channel; `{channel}` and `{date}` are substituted in args.
    pub command: CommandConfig,
    pub channels: Vec<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            command: CommandConfig::new("python", &["scripts/scrape_channel.py", "{channel}"]),
            channels: vec![
                "chemed123".to_string(),
                "lobelia4cosmetics".to_string(),
                "tikvahpharma".to_string(),
            ],
        }
    }
}

/// Dimensional transformation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub command: CommandConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        let mut command = CommandConfig::new("dbt", &["run"]);
        command.working_dir = Some("dbt_project".to_string());
        Self { command }
    }
}

/// Object-detection collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Receives the image path as its last argument and prints detections as JSON.
    pub command: CommandConfig,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            command: CommandConfig::new("python", &["scripts/detect_objects.py"]),
        }
    }
}
