use thiserror::Error;

/// Top-level error type for the Harvest pipeline.
///
/// Subsystem crates either use this type directly or wrap it in their own
/// error enums with `#[from]`, so `?` works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Partition error in {path}: {reason}")]
    Partition { path: String, reason: String },

    #[error("Vision model error: {0}")]
    Vision(String),

    #[error("External command failed: {0}")]
    Command(String),

    #[error("Stage failed: {0}")]
    Stage(String),

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Cancelled by operator")]
    Cancelled,
}

impl From<toml::de::Error> for HarvestError {
    fn from(err: toml::de::Error) -> Self {
        HarvestError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for HarvestError {
    fn from(err: toml::ser::Error) -> Self {
        HarvestError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;
