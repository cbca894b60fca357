// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `svcagent reset <root>`: purge dependency caches and the service container

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use svcagent_core::domain::requests::LoadRequest;

use crate::host;

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Service root (contains service.yaml)
    #[arg(value_name = "DIR", default_value = ".")]
    pub root: PathBuf,

    /// Workspace the service belongs to
    #[arg(long, default_value = "")]
    pub workspace: String,

    /// Also forget the service (destroy instead of reset)
    #[arg(long)]
    pub destroy: bool,
}

pub async fn execute(args: ResetArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = host::load_config(config_path)?;
    let identity = host::identity_from_root(&args.root, &config.spec.runtime.service_manifest, &args.workspace)?;
    let runtime = host::build_runtime(&config);

    runtime
        .load(LoadRequest { identity: identity.clone(), environment: "local".to_string(), make_public: false })
        .await
        .context("Load failed")?;

    if args.destroy {
        runtime.destroy().await.context("Destroy failed")?;
        println!("{}", format!("✓ {} destroyed", identity.unique()).green());
    } else {
        runtime.reset().await.context("Reset failed")?;
        println!("{}", format!("✓ {} caches cleared", identity.unique()).green());
    }
    Ok(())
}
