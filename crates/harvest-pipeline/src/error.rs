//! Error types for the orchestrator.

use harvest_core::error::HarvestError;
use harvest_core::types::{PipelineStatus, StageName, StageStatus};

/// Errors that stop the orchestrator itself, as opposed to a stage failing.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid stage transition: {0} -> {1}")]
    InvalidTransition(StageStatus, StageStatus),
    #[error("Invalid pipeline transition: {0} -> {1}")]
    InvalidPipelineTransition(PipelineStatus, PipelineStatus),
    #[error("Stage registered twice: {0}")]
    DuplicateStage(StageName),
    #[error("Stage not registered: {0}")]
    UnknownStage(StageName),
    #[error("Dependency cycle between stages: {}", format_stages(.0))]
    DependencyCycle(Vec<StageName>),
    #[error("Storage error: {0}")]
    Storage(#[from] HarvestError),
}

fn format_stages(stages: &[StageName]) -> String {
    stages
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
