#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid capability: {0}")]
    Capability(String),

    #[error("Invalid auth signature: {0}")]
    AuthSig(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuorumError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decryption(_) => "decryption",
            Self::InvalidKey(_) => "invalid_key",
            Self::Serialization(_) => "serialization",
            Self::Storage(_) => "storage",
            Self::Capability(_) => "capability",
            Self::AuthSig(_) => "auth_sig",
            Self::Session(_) => "session",
            Self::Wallet(_) => "wallet",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;
