// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

mod cli;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use quorum::{AppError, Result};
use quorum_net::{ClientConfig, LogLevel};

use crate::cli::{Cli, Commands};

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    Ok(match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::load()?,
    })
}

fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    init_logging(config.log_level);

    if let Err(e) = run(cli, config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli, mut config: ClientConfig) -> Result<()> {
    match cli.command {
        Commands::Handshake { urls } => {
            if !urls.is_empty() {
                config.bootstrap_urls = urls;
            }
            debug!(nodes = config.bootstrap_urls.len(), "starting handshake");
            let runtime = tokio::runtime::Runtime::new().map_err(AppError::Runtime)?;
            let report = runtime.block_on(quorum::handshake(config))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Session { rotate } => {
            println!("{}", quorum::session_uri(&config, rotate)?);
        }
    }
    Ok(())
}
