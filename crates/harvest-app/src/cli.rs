//! CLI argument definitions for the Harvest binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use harvest_core::config::HarvestConfig;
use harvest_core::types::StageName;

/// Harvest - scrape, load, transform and enrich channel messages.
#[derive(Parser, Debug)]
#[command(name = "harvest", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path.
    #[arg(short = 'd', long = "database", global = true)]
    pub database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Print results as JSON.
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run every enabled stage in dependency order.
    Run,
    /// Run one stage on its own, regardless of earlier stages.
    Stage {
        /// scrape, load, transform or enrich.
        name: StageName,
    },
    /// Show recent pipeline runs.
    History {
        #[arg(long, default_value_t = 10)]
        limit: u64,
    },
    /// Query ingested and enriched data.
    Report {
        #[command(subcommand)]
        report: ReportCommand,
    },
    /// Write a configuration file with default settings.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum ReportCommand {
    /// Most frequently detected object classes.
    TopObjects {
        #[arg(long, default_value_t = 10)]
        limit: u64,
    },
    /// Monthly message volume for one channel.
    ChannelActivity { channel: String },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > HARVEST_CONFIG env var > ./harvest.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        self.resolve_config_path_from(|key| std::env::var(key).ok())
    }

    fn resolve_config_path_from<F>(&self, lookup: F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Some(p) = lookup("HARVEST_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("harvest.toml")
    }

    /// Apply CLI flags on top of a config that already has env overrides.
    pub fn apply_overrides(&self, config: &mut HarvestConfig) {
        if let Some(ref path) = self.database {
            config.database.path = path.to_string_lossy().to_string();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let args = CliArgs::parse_from(["harvest", "stage", "load"]);
        assert_eq!(args.command, Command::Stage { name: StageName::Load });

        let args = CliArgs::parse_from(["harvest", "report", "channel-activity", "chemedA"]);
        assert_eq!(
            args.command,
            Command::Report {
                report: ReportCommand::ChannelActivity {
                    channel: "chemedA".to_string()
                }
            }
        );

        let args = CliArgs::parse_from(["harvest", "history", "--limit", "3", "--json"]);
        assert_eq!(args.command, Command::History { limit: 3 });
        assert!(args.json);
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!(CliArgs::try_parse_from(["harvest", "stage", "deploy"]).is_err());
    }

    #[test]
    fn test_config_path_priority() {
        let args = CliArgs::parse_from(["harvest", "-c", "/etc/harvest.toml", "run"]);
        assert_eq!(
            args.resolve_config_path_from(|_| Some("/env.toml".to_string())),
            PathBuf::from("/etc/harvest.toml")
        );

        let args = CliArgs::parse_from(["harvest", "run"]);
        assert_eq!(
            args.resolve_config_path_from(|_| Some("/env.toml".to_string())),
            PathBuf::from("/env.toml")
        );
        assert_eq!(args.resolve_config_path_from(|_| None), PathBuf::from("harvest.toml"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = HarvestConfig::default();
        config.apply_overrides_from(|key| match key {
            "HARVEST_DATABASE_PATH" => Some("/env/harvest.db".to_string()),
            "HARVEST_LOG_LEVEL" => Some("warn".to_string()),
            _ => None,
        });

        let args = CliArgs::parse_from(["harvest", "--database", "/cli/harvest.db", "run"]);
        args.apply_overrides(&mut config);
        assert_eq!(config.database.path, "/cli/harvest.db");
        assert_eq!(config.general.log_level, "warn");
    }
}
