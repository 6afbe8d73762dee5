//! hubscript CLI - run Lua scripts with timers and non-blocking networking.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod commands;
mod config;

#[derive(Parser)]
#[command(
    name = "hubscript",
    version,
    about = "Lua runtime with timers and non-blocking networking",
    long_about = "hubscript runs Lua scripts on a single interpreter thread while timers,\n\
                  sockets and HTTP requests run in the background.\n\n\
                  Run a script:  hubscript run script.lua\n\
                  Eval code:     hubscript run -e 'print(1 + 1)'\n\
                  Interactive:   hubscript"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lua script, waiting for its timers and sockets to finish
    Run(commands::run::RunCommand),

    /// Start interactive REPL
    Repl(commands::repl::ReplCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so script output on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::Run(cmd)) => cmd.run(&config).await,
        Some(Commands::Repl(cmd)) => cmd.run(&config).await,
        None => commands::repl::ReplCommand::default().run(&config).await,
    }
}
