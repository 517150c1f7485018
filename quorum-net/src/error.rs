#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connection,
    MalformedResponse,
}

impl NetworkErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure talking to one node. Never fatal to a fan-out on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} from {url}: {detail}")]
pub struct NetworkError {
    pub url: String,
    pub kind: NetworkErrorKind,
    pub detail: String,
}

impl NetworkError {
    pub fn timeout(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(url, NetworkErrorKind::Timeout, detail)
    }

    pub fn connection(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(url, NetworkErrorKind::Connection, detail)
    }

    pub fn malformed(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(url, NetworkErrorKind::MalformedResponse, detail)
    }

    fn new(url: impl Into<String>, kind: NetworkErrorKind, detail: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == NetworkErrorKind::Timeout
    }
}

/// Why one node did not contribute to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Network(NetworkError),
    Rejected { status: u16, message: String },
    Decryption(String),
    InvalidResponse(String),
    Request(String),
}

impl FailureReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(e) => e.kind.as_str(),
            Self::Rejected { .. } => "rejected",
            Self::Decryption(_) => "decryption",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Request(_) => "request",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "{}: {}", e.kind, e.detail),
            Self::Rejected { status, message } => write!(f, "rejected ({status}): {message}"),
            Self::Decryption(e) => write!(f, "decryption failed: {e}"),
            Self::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            Self::Request(e) => write!(f, "request not built: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub url: String,
    pub reason: FailureReason,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

fn list_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Config resolution failed: {0}")]
    ConfigResolution(String),

    #[error(
        "Quorum not met for request {request_id}: need {required}, got {succeeded} [{}]",
        list_failures(.failures)
    )]
    QuorumNotMet {
        request_id: String,
        required: usize,
        succeeded: usize,
        failures: Vec<NodeFailure>,
    },

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Share combination failed: {0}")]
    Combine(String),

    #[error("Attestation verification failed: {0}")]
    Attestation(String),

    #[error(transparent)]
    Core(#[from] quorum_core::QuorumError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(e) => e.kind.as_str(),
            Self::ConfigResolution(_) => "config_resolution",
            Self::QuorumNotMet { .. } => "quorum_not_met",
            Self::Decryption(_) => "decryption",
            Self::NotConnected(_) => "not_connected",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Combine(_) => "combine",
            Self::Attestation(_) => "attestation",
            Self::Core(e) => e.kind(),
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_error_lists_every_failure() {
        let err = NetError::QuorumNotMet {
            request_id: "abc".into(),
            required: 3,
            succeeded: 1,
            failures: vec![
                NodeFailure {
                    url: "https://a".into(),
                    reason: FailureReason::Network(NetworkError::timeout("https://a", "20000ms")),
                },
                NodeFailure {
                    url: "https://b".into(),
                    reason: FailureReason::Rejected {
                        status: 400,
                        message: "bad epoch".into(),
                    },
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("request abc"));
        assert!(text.contains("https://a: timeout: 20000ms"));
        assert!(text.contains("https://b: rejected (400): bad epoch"));
        assert_eq!(err.kind(), "quorum_not_met");
    }

    #[test]
    fn test_core_error_kind_passes_through() {
        let err = NetError::from(quorum_core::QuorumError::Decryption("tag".into()));
        assert_eq!(err.kind(), "decryption");
    }
}
