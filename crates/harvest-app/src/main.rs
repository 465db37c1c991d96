//! Harvest application binary - composition root.
//!
//! Ties the Harvest crates together into one executable:
//! 1. Resolve configuration (CLI > env > TOML file > defaults)
//! 2. Initialize tracing
//! 3. Open the SQLite database for the duration of one command
//! 4. Run the pipeline, a single stage, or a read-only report

mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use harvest_core::config::HarvestConfig;
use harvest_core::error::HarvestError;
use harvest_core::types::StageName;
use harvest_pipeline::{build_orchestrator, CancelSignal, PipelineReport};
use harvest_storage::{duration_millis, Database, QueryService, RunRepository};
use harvest_vision::CommandVisionModel;

use cli::{CliArgs, Command, ReportCommand};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Config is read before tracing starts so the configured level applies.
    let config_path = args.resolve_config_path();
    let file_config = if config_path.exists() {
        HarvestConfig::load(&config_path).map(Some)
    } else {
        Ok(None)
    };

    let mut config = match &file_config {
        Ok(Some(config)) => config.clone(),
        _ => HarvestConfig::default(),
    };
    config.apply_env_overrides();
    args.apply_overrides(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::info!("Starting Harvest v{}", env!("CARGO_PKG_VERSION"));
    match file_config {
        Ok(Some(_)) => tracing::info!(path = %config_path.display(), "Configuration loaded"),
        Ok(None) => tracing::info!(path = %config_path.display(), "No configuration file, using defaults"),
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "Invalid configuration file");
            return ExitCode::FAILURE;
        }
    }

    match execute(&args, &config_path, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn execute(
    args: &CliArgs,
    config_path: &std::path::Path,
    config: HarvestConfig,
) -> AppResult<ExitCode> {
    match &args.command {
        Command::InitConfig { force } => {
            if config_path.exists() && !force {
                return Err(HarvestError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                ))
                .into());
            }
            HarvestConfig::default().save(config_path)?;
            println!("Wrote {}", config_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Run => run_pipeline(&config, None, args.json).await,
        Command::Stage { name } => run_pipeline(&config, Some(*name), args.json).await,
        Command::History { limit } => {
            let db = Arc::new(Database::open(&config.database)?);
            show_history(&RunRepository::new(db), *limit, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Report { report } => {
            let db = Arc::new(Database::open(&config.database)?);
            show_report(&QueryService::new(db), report, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run the whole pipeline or one stage. The database handle lives for the
/// duration of this call.
async fn run_pipeline(
    config: &HarvestConfig,
    single: Option<StageName>,
    json: bool,
) -> AppResult<ExitCode> {
    config.validate()?;

    let db = Arc::new(Database::open(&config.database)?);
    let model = CommandVisionModel::new(config.vision.command.clone());
    let orchestrator = build_orchestrator(config, Arc::clone(&db), model);

    let cancel = CancelSignal::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling the running stage");
                cancel.cancel();
            }
        })
    };

    let result = match single {
        Some(name) => orchestrator.run_single(name, &cancel).await,
        None => orchestrator.run(&cancel).await,
    };
    ctrl_c.abort();
    let report = result?;

    print_pipeline_report(&report, json)?;
    Ok(if report.is_aborted() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_pipeline_report(report: &PipelineReport, json: bool) -> AppResult<()> {
    if json {
        let value = serde_json::json!({
            "run": report.run,
            "stages": report.stages,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Run {} {}", report.run.id, report.run.status);
    for stage in &report.stages {
        let elapsed = duration_millis(stage.started_at, stage.ended_at)
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<10} {:<10} {:>8}  ok={} skipped={} failed={}",
            stage.stage.to_string(),
            stage.status.to_string(),
            elapsed,
            stage.report.succeeded,
            stage.report.skipped,
            stage.report.failed
        );
        if let Some(detail) = &stage.error_detail {
            println!("    error: {}", detail);
        }
        for err in stage.report.errors.iter().take(5) {
            println!("    - {}", err);
        }
        if stage.report.errors.len() > 5 {
            println!("    ... {} more", stage.report.errors.len() - 5);
        }
    }
    Ok(())
}

fn show_history(runs: &RunRepository, limit: u64, json: bool) -> AppResult<()> {
    let history = runs.recent_pipeline_runs(limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("No pipeline runs recorded");
        return Ok(());
    }

    for run in history {
        let failed = run
            .failed_stage
            .map(|s| format!(" (failed at {})", s))
            .unwrap_or_default();
        println!(
            "{}  {}  {}{}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.id,
            run.status,
            failed
        );
        for stage in runs.stage_runs_for(run.id)? {
            println!(
                "    {:<10} {:<10} ok={} skipped={} failed={}",
                stage.stage.to_string(),
                stage.status.to_string(),
                stage.report.succeeded,
                stage.report.skipped,
                stage.report.failed
            );
        }
    }
    Ok(())
}

fn show_report(queries: &QueryService, report: &ReportCommand, json: bool) -> AppResult<()> {
    match report {
        ReportCommand::TopObjects { limit } => {
            let rows = queries.top_object_classes(*limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!(
                        "{:<24} {:>8}  avg confidence {:.2}",
                        row.object_class, row.detections, row.avg_confidence
                    );
                }
            }
        }
        ReportCommand::ChannelActivity { channel } => {
            let rows = queries.channel_activity(channel)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!("{}  {:>8}", row.month, row.messages);
                }
            }
        }
    }
    Ok(())
}
