//! HETL - Main entry point

use anyhow::Context;
use clap::Parser;
use hetl_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use hetl_ingest::{Cli, Commands};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    // Values from .env never override the real environment
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    let Some(command) = cli.command.as_ref() else {
        eprintln!("Error: A subcommand is required");
        eprintln!();
        eprintln!("For more information, try '--help'.");
        process::exit(2);
    };

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        })
        .output(LogOutput::Console)
        .log_file_prefix("hetl".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let _guard = init_logging(&log_config).ok();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight chunks");
                eprintln!("Interrupted, finishing in-flight chunks...");
                cancel.cancel();
            }
        });
    }

    if let Err(e) = execute_command(command, cancel).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute_command(command: &Commands, cancel: CancellationToken) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => hetl_ingest::commands::run::run(args, cancel)
            .await
            .context("Job failed"),
        Commands::Audit { command } => hetl_ingest::commands::audit::run(command)
            .await
            .context("Audit command failed"),
        Commands::Layout(args) => hetl_ingest::commands::layout::run(args)
            .await
            .context("Could not resolve layout"),
    }
}
