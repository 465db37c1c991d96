//! Stage trait definition.
//!
//! A stage does its work and reports unit counts. It never touches its own
//! StageRun record; the orchestrator owns status and timing.

use async_trait::async_trait;
use uuid::Uuid;

use harvest_core::cancel::CancelSignal;
use harvest_core::error::HarvestError;
use harvest_core::types::{StageName, StageReport};

/// Per-run context handed to every stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub pipeline_run_id: Uuid,
    /// Raised when the operator cancels or the stage deadline passes. Stages
    /// with long loops check it between units and return early.
    pub cancel: CancelSignal,
}

/// One phase of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The stage this implementation runs.
    fn name(&self) -> StageName;

    /// Stages that must succeed first. Defaults to the fixed stage graph.
    fn depends_on(&self) -> Vec<StageName> {
        self.name().depends_on().to_vec()
    }

    /// Do the stage's work. Contained per-unit failures belong in the
    /// report; an `Err` fails the stage and aborts the pipeline.
    async fn run(&self, ctx: &StageContext) -> Result<StageReport, HarvestError>;
}
