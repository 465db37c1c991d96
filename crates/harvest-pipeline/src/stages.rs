//! Stage adapters for scrape, load, transform and enrich.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use harvest_core::command::CommandRunner;
use harvest_core::config::HarvestConfig;
use harvest_core::error::HarvestError;
use harvest_core::types::{StageName, StageReport};
use harvest_enrich::{EnrichmentCoordinator, MediaStore};
use harvest_ingest::{IngestionLoader, RawStore};
use harvest_storage::{Database, DetectionRepository, MessageRepository, RunRepository};
use harvest_vision::VisionModel;

use crate::orchestrator::Orchestrator;
use crate::stage::{Stage, StageContext};

// =============================================================================
// Scrape
// =============================================================================

/// Runs the scraper once per configured channel.
///
/// A failing channel is a contained failure. The stage fails only when
/// every invocation fails.
pub struct ScrapeStage {
    runner: CommandRunner,
    channels: Vec<String>,
}

impl ScrapeStage {
    pub fn new(runner: CommandRunner, channels: Vec<String>) -> Self {
        Self { runner, channels }
    }
}

#[async_trait]
impl Stage for ScrapeStage {
    fn name(&self) -> StageName {
        StageName::Scrape
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, HarvestError> {
        let date = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let targets: Vec<Option<&str>> = if self.channels.is_empty() {
            vec![None]
        } else {
            self.channels.iter().map(|c| Some(c.as_str())).collect()
        };

        let mut report = StageReport::default();
        for channel in targets {
            let mut vars = vec![("date", date.as_str())];
            if let Some(channel) = channel {
                vars.push(("channel", channel));
            }
            let label = channel.unwrap_or("<all>");

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(HarvestError::Cancelled),
                outcome = self.runner.run_checked(&vars, &[]) => outcome,
            };
            match outcome {
                Ok(_) => {
                    info!(channel = label, "Scraped channel");
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(channel = label, error = %e, "Scrape failed for channel");
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", label, e));
                }
            }
        }

        if report.succeeded == 0 {
            return Err(HarvestError::Stage(format!(
                "every scrape invocation failed: {}",
                report.errors.join("; ")
            )));
        }
        Ok(report)
    }
}

// =============================================================================
// Load
// =============================================================================

/// Loads every raw partition into the message table.
pub struct LoadStage {
    loader: IngestionLoader,
    store: RawStore,
}

impl LoadStage {
    pub fn new(loader: IngestionLoader, store: RawStore) -> Self {
        Self { loader, store }
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn name(&self) -> StageName {
        StageName::Load
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, HarvestError> {
        let loader = self.loader.clone().with_cancel(ctx.cancel.clone());
        let summary = loader.load_from_store(&self.store).await?;
        if summary.interrupted {
            return Err(HarvestError::Cancelled);
        }
        Ok(summary.into())
    }
}

// =============================================================================
// Transform
// =============================================================================

/// Runs the external transformation engine once.
pub struct TransformStage {
    runner: CommandRunner,
}

impl TransformStage {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Stage for TransformStage {
    fn name(&self) -> StageName {
        StageName::Transform
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, HarvestError> {
        // Dropping the command future kills the child process.
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(HarvestError::Cancelled),
            outcome = self.runner.run_checked(&[], &[]) => outcome?,
        };
        Ok(StageReport {
            succeeded: 1,
            ..StageReport::default()
        })
    }
}

// =============================================================================
// Enrich
// =============================================================================

/// Runs object detection over every downloaded image.
pub struct EnrichStage<V: VisionModel> {
    coordinator: EnrichmentCoordinator<V>,
    media: MediaStore,
}

impl<V: VisionModel> EnrichStage<V> {
    pub fn new(coordinator: EnrichmentCoordinator<V>, media: MediaStore) -> Self {
        Self { coordinator, media }
    }
}

#[async_trait]
impl<V: VisionModel + 'static> Stage for EnrichStage<V> {
    fn name(&self) -> StageName {
        StageName::Enrich
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, HarvestError> {
        let summary = self
            .coordinator
            .enrich_from_store(&self.media, &ctx.cancel)
            .await?;
        if summary.interrupted {
            return Err(HarvestError::Cancelled);
        }
        Ok(summary.into())
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Register every stage enabled in the configuration.
pub fn register_configured_stages<V: VisionModel + 'static>(
    orchestrator: &mut Orchestrator,
    config: &HarvestConfig,
    db: Arc<Database>,
    model: V,
) {
    if config.stages.scrape {
        orchestrator.register(Box::new(ScrapeStage::new(
            CommandRunner::new(config.scrape.command.clone()),
            config.scrape.channels.clone(),
        )));
    }
    if config.stages.load {
        let loader = IngestionLoader::new(MessageRepository::new(db.clone()), config.workers.load);
        orchestrator.register(Box::new(LoadStage::new(
            loader,
            RawStore::from_config(&config.raw_store),
        )));
    }
    if config.stages.transform {
        orchestrator.register(Box::new(TransformStage::new(CommandRunner::new(
            config.transform.command.clone(),
        ))));
    }
    if config.stages.enrich {
        let coordinator = EnrichmentCoordinator::new(
            model,
            DetectionRepository::new(db),
            config.workers.enrich,
        );
        orchestrator.register(Box::new(EnrichStage::new(
            coordinator,
            MediaStore::from_config(&config.media),
        )));
    }
}

/// Build an orchestrator with run history, stage timeout and every enabled
/// stage from the configuration.
pub fn build_orchestrator<V: VisionModel + 'static>(
    config: &HarvestConfig,
    db: Arc<Database>,
    model: V,
) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(RunRepository::new(db.clone()))
        .with_stage_timeout(config.pipeline.stage_timeout_secs.map(Duration::from_secs));
    register_configured_stages(&mut orchestrator, config, db, model);
    orchestrator
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::config::CommandConfig;
    use harvest_vision::MockVisionModel;
    use uuid::Uuid;

    use harvest_core::cancel::CancelSignal;

    fn ctx() -> StageContext {
        StageContext {
            pipeline_run_id: Uuid::new_v4(),
            cancel: CancelSignal::new(),
        }
    }

    #[test]
    fn test_configured_stages_respect_flags() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mut config = HarvestConfig::default();
        config.stages.transform = false;

        let orch = build_orchestrator(&config, db, MockVisionModel::new());
        assert_eq!(
            orch.registered(),
            vec![StageName::Scrape, StageName::Load, StageName::Enrich]
        );
        assert_eq!(
            orch.plan().unwrap(),
            vec![StageName::Scrape, StageName::Load, StageName::Enrich]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scrape_partial_failure_is_contained() {
        let runner = CommandRunner::new(CommandConfig::new(
            "sh",
            &["-c", "test \"$0\" != broken", "{channel}"],
        ));
        let stage = ScrapeStage::new(
            runner,
            vec!["chemedA".to_string(), "broken".to_string(), "tikvahpharma".to_string()],
        );

        let report = stage.run(&ctx()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].starts_with("broken:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scrape_all_failed_fails_stage() {
        let runner = CommandRunner::new(CommandConfig::new("sh", &["-c", "exit 1"]));
        let stage = ScrapeStage::new(runner, vec!["a".to_string(), "b".to_string()]);
        let err = stage.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Stage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scrape_without_channels_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let runner = CommandRunner::new(CommandConfig::new(
            "sh",
            &["-c", "echo x >> \"$0\"", marker.to_str().unwrap()],
        ));
        let report = ScrapeStage::new(runner, vec![]).run(&ctx()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().lines().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transform_nonzero_exit_fails_stage() {
        let runner = CommandRunner::new(CommandConfig::new(
            "sh",
            &["-c", "echo 'Compilation Error in model fct_messages' >&2; exit 1"],
        ));
        let err = TransformStage::new(runner).run(&ctx()).await.unwrap_err();
        assert!(err.to_string().contains("fct_messages"));
    }

    #[tokio::test]
    async fn test_load_stage_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawStore::new(dir.path());
        let day = dir.path().join("2025-07-10");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("chemedA.json"), r#"[{"id": 1}, {"id": 1}, {"text": "?"}]"#)
            .unwrap();

        let db = Arc::new(Database::in_memory().unwrap());
        let stage = LoadStage::new(IngestionLoader::new(MessageRepository::new(db), 2), store);
        let report = stage.run(&ctx()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 0);
    }
}
