// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use quorum_core::{FileStorage, QuorumError, SessionManager};
use quorum_net::{ClientConfig, HttpTransport, NetError, NetworkClient, ResolvedConfig};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Core(#[from] QuorumError),

    #[error("Failed to start runtime: {0}")]
    Runtime(std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReport {
    pub config: ResolvedConfig,
    pub nodes: Vec<String>,
    pub threshold: usize,
    pub effective_epoch: Option<u64>,
}

pub fn storage_dir(config: &ClientConfig) -> Result<PathBuf> {
    match &config.storage_path {
        Some(path) => Ok(path.clone()),
        None => Ok(FileStorage::default_dir()?),
    }
}

pub fn open_storage(config: &ClientConfig) -> Result<Arc<FileStorage>> {
    let dir = storage_dir(config)?;
    debug!(path = %dir.display(), "Opening session storage");
    Ok(Arc::new(FileStorage::new(&dir)?))
}

pub fn build_client(config: ClientConfig) -> Result<NetworkClient> {
    let storage = open_storage(&config)?;
    let transport = Arc::new(HttpTransport::new()?);
    Ok(NetworkClient::new(config, transport, storage)?)
}

pub async fn handshake(config: ClientConfig) -> Result<HandshakeReport> {
    let client = build_client(config)?;
    let state = client.connect().await?;
    Ok(HandshakeReport {
        config: state.config.clone(),
        nodes: state.nodes.clone(),
        threshold: state.threshold,
        effective_epoch: state.effective_epoch(Utc::now()),
    })
}

/// Loads (or creates) the session key and returns its URI.
pub fn session_uri(config: &ClientConfig, rotate: bool) -> Result<String> {
    let sessions = SessionManager::new(open_storage(config)?, config.session_config()?);
    let key = if rotate {
        sessions.rotate_session_key()?
    } else {
        sessions.get_session_key()?
    };
    Ok(key.uri())
}
