//! Harvest pipeline crate - stage graph, state machine and orchestration.
//!
//! Stages (scrape, load, transform, enrich) implement the `Stage` trait and
//! are registered with the `Orchestrator`, which plans them in dependency
//! order, runs them one at a time, and aborts the run on the first failed
//! stage. Every stage and pipeline run is recorded in the database.

pub mod error;
pub mod orchestrator;
pub mod stage;
pub mod stages;
pub mod state_machine;

pub use harvest_core::cancel::CancelSignal;
pub use error::PipelineError;
pub use orchestrator::{Orchestrator, PipelineReport};
pub use stage::{Stage, StageContext};
pub use stages::{
    build_orchestrator, register_configured_stages, EnrichStage, LoadStage, ScrapeStage,
    TransformStage,
};
