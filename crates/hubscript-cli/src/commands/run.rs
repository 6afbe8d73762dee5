//! Run command - execute a Lua script and wait for its background work.

use anyhow::Result;
use clap::Args;
use hubscript_runtime::{ExecutionResult, Runtime, RuntimeConfig, RuntimeError};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Args)]
pub struct RunCommand {
    /// Script to execute
    pub entry: Option<PathBuf>,

    /// Lua fragment to run before the script (repeatable)
    #[arg(long = "eval", short = 'e', value_name = "CODE")]
    pub eval: Vec<String>,

    /// Keep running until Ctrl-C, even when no work is outstanding
    #[arg(long)]
    pub daemon: bool,

    /// Timeout in milliseconds for the script and each fragment. Without it
    /// fragments use the configured default and the script has no deadline.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// How long to wait for outstanding work before forcing shutdown
    #[arg(long, value_name = "MS")]
    pub shutdown_timeout: Option<u64>,
}

impl RunCommand {
    pub async fn run(&self, config: &Config) -> Result<()> {
        if self.entry.is_none() && self.eval.is_empty() {
            anyhow::bail!("Nothing to run: pass a script path or --eval");
        }

        let daemon = self.daemon || config.daemon;
        let runtime = Runtime::builder()
            .config(self.runtime_config(config))
            .daemon(daemon)
            .build()?;

        let mut failed = false;

        if !self.eval.is_empty() {
            let results = runtime
                .run_fragments(&self.eval, self.entry.is_some())
                .await?;
            for result in &results {
                failed |= report(result);
            }
        }

        if let Some(entry) = &self.entry {
            let source = std::fs::read_to_string(entry)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", entry.display(), e))?;
            let result = runtime
                .run_main(source, &entry.display().to_string())
                .await?;
            failed |= report(&result);
        }

        if daemon {
            info!("Running as daemon, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
            runtime.force_shutdown();
        } else {
            match runtime.wait_for_termination().await {
                Ok(()) => {}
                Err(RuntimeError::ShutdownTimeout(timeout)) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Outstanding work did not finish, forcing shutdown"
                    );
                    runtime.force_shutdown();
                }
                Err(e) => return Err(e.into()),
            }
        }

        runtime.shutdown().await;

        if failed {
            anyhow::bail!("Script raised an error");
        }
        Ok(())
    }

    fn runtime_config(&self, config: &Config) -> RuntimeConfig {
        let mut runtime = config.runtime.clone();
        if let Some(timeout) = self.timeout {
            runtime.execution_timeout_ms = timeout;
            runtime.main_timeout_ms = Some(timeout);
        }
        if let Some(timeout) = self.shutdown_timeout {
            runtime.tracker.shutdown_timeout_ms = timeout;
        }
        runtime
    }
}

/// Print a guest error to stderr. Returns true if the execution failed.
fn report(result: &ExecutionResult) -> bool {
    match &result.error {
        Some(error) if !result.success => {
            eprintln!("error: {error}");
            true
        }
        _ => false,
    }
}
