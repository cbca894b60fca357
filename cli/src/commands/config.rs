// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use svcagent_core::domain::agent_config::AgentConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./svcagent.yaml)
        #[arg(short, long, default_value = "./svcagent.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = AgentConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. SVCAGENT_CONFIG_PATH: {}",
            std::env::var("SVCAGENT_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./svcagent.yaml");
        println!("  4. ~/.svcagent/config.yaml");
        println!("  5. /etc/svcagent/config.yaml");
        println!();
    }

    if as_yaml {
        let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
        println!("{}", yaml);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Agent:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  API: {}:{}", spec.network.bind_address, spec.network.port);
    println!();

    println!("{}", "Runtime:".bold());
    match spec.runtime.default_scope {
        Some(scope) => println!("  Default scope: {}", scope),
        None => println!("  Default scope: {}", "(probe toolchain)".dimmed()),
    }
    println!("  Toolchain: {}", spec.runtime.toolchain.join(", "));
    println!("  Source dir: {}", spec.runtime.source_dir);
    println!("  Cache dir: {}", spec.runtime.cache_dir);
    println!();

    println!("{}", "Commands:".bold());
    println!("  Install: {} {}", spec.installer.binary, spec.installer.install_args.join(" "));
    println!("  Update: {} {}", spec.installer.binary, spec.installer.update_args.join(" "));
    if spec.schema.enabled {
        println!("  Schema: {} {}", spec.schema.binary, spec.schema.args.join(" "));
    } else {
        println!("  Schema: {}", "(disabled)".dimmed());
    }
    println!("  Server: {} {}", spec.server.binary, spec.server.args.join(" "));
    println!("  Tests: {} {}", spec.tests.binary, spec.tests.args.join(" "));
    println!();

    println!("{}", "Hot reload:".bold());
    if spec.hot_reload.enabled {
        println!("  Debounce: {} ms", spec.hot_reload.debounce_ms);
        println!("  Delegated: {}", spec.hot_reload.delegated_extensions.join(", "));
    } else {
        println!("  {}", "(disabled)".dimmed());
    }
    println!();

    println!("{}", "Container:".bold());
    println!("  Image: {}", spec.container.image);
    println!(
        "  Docker socket: {}",
        spec.container.docker_socket_path.as_deref().unwrap_or("(default)")
    );
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = AgentConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
