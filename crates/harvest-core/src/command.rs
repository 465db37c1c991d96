//! External program invocation.
//!
//! The scraper, the transformation engine and the command-backed vision
//! model are all reached by spawning a configured program. Children are
//! killed when the awaiting future is dropped, so cancelling a stage does
//! not leave orphaned processes behind.

use std::process::Stdio;

use tracing::debug;

use crate::config::CommandConfig;
use crate::error::{HarvestError, Result};

/// Lines of stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Captured result of one program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    /// The last few lines of stderr, for error detail.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Runs one configured external program.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: CommandConfig,
}

impl CommandRunner {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// Substitute `{key}` placeholders in the configured arguments.
    pub fn render_args(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), value)
                })
            })
            .collect()
    }

    /// Run the program and capture its output regardless of exit status.
    pub async fn run(&self, vars: &[(&str, &str)], extra_args: &[String]) -> Result<CommandOutput> {
        if self.config.program.trim().is_empty() {
            return Err(HarvestError::Command("no program configured".to_string()));
        }

        let mut args = self.render_args(vars);
        args.extend(extra_args.iter().cloned());

        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.config.program, args = ?args, "Spawning external command");

        let output = cmd.output().await.map_err(|e| {
            HarvestError::Command(format!("failed to spawn '{}': {}", self.config.program, e))
        })?;

        Ok(CommandOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run the program and treat a non-zero exit as an error.
    pub async fn run_checked(
        &self,
        vars: &[(&str, &str)],
        extra_args: &[String],
    ) -> Result<CommandOutput> {
        let output = self.run(vars, extra_args).await?;
        if output.success() {
            return Ok(output);
        }
        let status = output
            .status_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(HarvestError::Command(format!(
            "'{}' exited with status {}: {}",
            self.config.program,
            status,
            output.stderr_tail()
        )))
    }
}
