/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use fedigate_core::config::InboxConfig;
use fedigate_core::runtime;
use std::path::PathBuf;
use tracing::{info, warn};

fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join("fedigate").join("config.json")
}

fn parse_config_path() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("FEDIGATE_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(Some(PathBuf::from(path)));
        }
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();

    // an explicit path must exist; the default one is optional
    let mut cfg = match parse_config_path()? {
        Some(path) => {
            info!("config: {}", path.display());
            InboxConfig::load(&path)?
        }
        None => {
            let path = default_config_path();
            if path.exists() {
                info!("config: {}", path.display());
                InboxConfig::load(&path)?
            } else {
                warn!("no config at {}, using defaults", path.display());
                InboxConfig::default()
            }
        }
    };
    cfg.apply_overrides_from(|key| std::env::var(key).ok())
        .context("environment overrides")?;
    cfg.validate().context("invalid config")?;

    info!("fedigate service starting");
    runtime::run(cfg).await
}
