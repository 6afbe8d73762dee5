//! REPL command - interactive Lua shell.

use anyhow::Result;
use clap::Args;
use hubscript_runtime::{ExecutionBridge, ExecutionResult, ExecutionTracker, Runtime};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::config::Config;

#[derive(Args, Default)]
pub struct ReplCommand {
    /// Evaluate code and exit
    #[arg(long, short = 'e')]
    pub eval: Option<String>,
}

impl ReplCommand {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let runtime = Runtime::builder()
            .config(config.runtime.clone())
            .build()?;

        // If --eval is provided, just run that and exit
        if let Some(code) = &self.eval {
            let result = runtime
                .submit_execution(code.as_str(), runtime.config().execution_timeout())
                .await?;
            runtime.shutdown().await;
            if !print_result(&result) {
                std::process::exit(1);
            }
            return Ok(());
        }

        runtime.start_interactive();
        let bridge = runtime.bridge();
        let tracker = runtime.tracker().clone();

        // stdin and the bridge both block; keep them off the async workers
        tokio::task::spawn_blocking(move || repl_loop(&bridge, &tracker)).await??;

        runtime.shutdown().await;
        Ok(())
    }
}

fn repl_loop(bridge: &ExecutionBridge, tracker: &Arc<ExecutionTracker>) -> Result<()> {
    println!("hubscript {} - Lua runtime", env!("CARGO_PKG_VERSION"));
    println!("Type .help for help, .exit to exit\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    let mut multiline_buffer = String::new();
    let mut in_multiline = false;

    loop {
        let prompt = if in_multiline { "...> " } else { "hub> " };
        print!("{}", prompt);
        stdout.flush()?;

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }

        let line = line.trim_end();

        if line.is_empty() && !in_multiline {
            continue;
        }

        if line.starts_with('.') {
            match line {
                ".exit" | ".quit" | ".q" => break,
                ".help" | ".h" => {
                    print_help();
                    continue;
                }
                ".tally" | ".t" if !in_multiline => {
                    match serde_json::to_string_pretty(&tracker.tally()) {
                        Ok(json) => println!("{}", json),
                        Err(e) => eprintln!("error: {}", e),
                    }
                    continue;
                }
                ".multiline" | ".m" if !in_multiline => {
                    in_multiline = true;
                    println!("Entering multiline mode. Type .end to execute, .cancel to abort.");
                    continue;
                }
                ".end" if in_multiline => {
                    let code = std::mem::take(&mut multiline_buffer);
                    in_multiline = false;
                    eval_line(bridge, &code);
                    continue;
                }
                ".cancel" if in_multiline => {
                    multiline_buffer.clear();
                    in_multiline = false;
                    println!("Multiline input cancelled.");
                    continue;
                }
                _ if !in_multiline => {
                    println!(
                        "Unknown command: {}. Type .help for available commands.",
                        line
                    );
                    continue;
                }
                _ => {}
            }
        }

        if in_multiline {
            multiline_buffer.push_str(line);
            multiline_buffer.push('\n');
            continue;
        }

        eval_line(bridge, line);
    }

    println!("\nGoodbye!");
    Ok(())
}

fn eval_line(bridge: &ExecutionBridge, code: &str) {
    match bridge.submit(code, None) {
        Ok(result) => {
            print_result(&result);
        }
        Err(e) => eprintln!("error: {}", e),
    }
}

/// Print a result the way the prompt shows it. Returns false on guest error.
fn print_result(result: &ExecutionResult) -> bool {
    if !result.success {
        eprintln!("error: {}", result.error.as_deref().unwrap_or("unknown error"));
        return false;
    }
    match &result.result {
        Some(serde_json::Value::Null) | None => {}
        Some(value) => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{:?}", value),
        },
    }
    true
}

fn print_help() {
    println!("REPL Commands:");
    println!("  .help, .h      Show this help message");
    println!("  .exit, .q      Exit the REPL");
    println!("  .tally, .t     Show outstanding timers, sockets and callbacks");
    println!("  .multiline, .m Enter multiline mode");
    println!("  .end           Execute multiline input");
    println!("  .cancel        Cancel multiline input");
    println!();
    println!("Timers and network callbacks keep running between lines.");
}
