// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # svcagent
//!
//! The `svcagent` binary hosts the service runtime agent.
//!
//! ## Commands
//!
//! - `svcagent serve` - Expose the lifecycle operations over HTTP for an orchestrator
//! - `svcagent run <root>` - Load, init and start one service locally until Ctrl-C
//! - `svcagent reset <root>` - Drop a service's caches and containers
//! - `svcagent config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use svcagent_core::domain::agent_config::AgentConfigManifest;

use svcagent::commands::{self, ConfigCommand, ResetArgs, RunArgs, ServeArgs};

/// svcagent - Run, hot-reload and test a service in a native or container environment
#[derive(Parser)]
#[command(name = "svcagent")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SVCAGENT_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the config file value
    #[arg(long, global = true, env = "SVCAGENT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json). Defaults to the config file value
    #[arg(long, global = true, env = "SVCAGENT_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the lifecycle HTTP API
    #[command(name = "serve")]
    Serve(ServeArgs),

    /// Run a service locally until interrupted
    #[command(name = "run")]
    Run(RunArgs),

    /// Reset or destroy a service's cached state
    #[command(name = "reset")]
    Reset(ResetArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from flags first, then the config file
    let logging = AgentConfigManifest::load_or_default(cli.config.clone())
        .map(|c| c.spec.observability.logging)
        .unwrap_or_default();
    let level = cli.log_level.unwrap_or(logging.level);
    let format = cli.log_format.unwrap_or(logging.format);
    init_logging(&level, &format)?;

    match cli.command {
        Some(Commands::Serve(args)) => commands::serve::execute(args, cli.config).await,
        Some(Commands::Run(args)) => commands::run::execute(args, cli.config).await,
        Some(Commands::Reset(args)) => commands::reset::execute(args, cli.config).await,
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "text" => builder.compact().init(),
        other => {
            builder.compact().init();
            tracing::warn!("Unknown log format '{}', using text", other);
        }
    }

    Ok(())
}
