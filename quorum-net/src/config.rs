use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Deserializer};

use quorum_core::SessionConfig;

use crate::error::{NetError, Result};
use crate::transport::DEFAULT_REQUEST_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

fn deserialize_urls<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let urls: Vec<String> = Vec::deserialize(deserializer)?;
    for url in &urls {
        validate_url(url).map_err(serde::de::Error::custom)?;
    }
    Ok(urls)
}

fn deserialize_timeout<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<u64>::deserialize(deserializer)?;
    if opt == Some(0) {
        return Err(serde::de::Error::custom("timeout must be greater than 0"));
    }
    Ok(opt)
}

fn validate_url(url: &str) -> std::result::Result<(), String> {
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(format!(
            "Invalid node URL: '{url}'. Must start with https:// or http://"
        ));
    }
    Ok(())
}

/// Ten years.
pub const MAX_EXPIRATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn expiration(name: &str, secs: u64) -> Result<TimeDelta> {
    if secs > MAX_EXPIRATION_SECS {
        return Err(NetError::InvalidConfig(format!(
            "{name} must be at most {MAX_EXPIRATION_SECS}"
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| NetError::InvalidConfig(format!("{name} is out of range")))
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default, deserialize_with = "deserialize_urls")]
    pub bootstrap_urls: Vec<String>,
    /// Overrides the default threshold of `max(3, floor(2n/3))`.
    #[serde(default)]
    pub min_node_count: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub e2ee: bool,
    #[serde(default)]
    pub check_node_attestation: bool,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub session_expiration_secs: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub capability_expiration_secs: Option<u64>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub statement: Option<String>,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_urls: Vec::new(),
            min_node_count: None,
            request_timeout_ms: None,
            handshake_timeout_ms: None,
            e2ee: true,
            check_node_attestation: false,
            session_expiration_secs: None,
            capability_expiration_secs: None,
            domain: None,
            statement: None,
            chain_id: None,
            storage_path: None,
            log_level: LogLevel::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            bootstrap_urls: bootstrap_urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        const MAX_CONFIG_SIZE: u64 = 1024 * 1024; // 1 MB
        let metadata = std::fs::metadata(path).map_err(|e| {
            NetError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        if metadata.len() > MAX_CONFIG_SIZE {
            return Err(NetError::InvalidConfig("Config file too large".into()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            NetError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| NetError::InvalidConfig(format!("Invalid config: {e}")))
    }

    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("quorum").join("config.toml"))
            .ok_or_else(|| NetError::InvalidConfig("Could not determine config directory".into()))
    }

    /// Checks what serde cannot: URLs added after parsing and a usable node count.
    pub fn validate(&self) -> Result<()> {
        if self.bootstrap_urls.is_empty() {
            return Err(NetError::InvalidConfig("no bootstrap URLs configured".into()));
        }
        for url in &self.bootstrap_urls {
            validate_url(url).map_err(NetError::InvalidConfig)?;
        }
        if self.min_node_count == Some(0) {
            return Err(NetError::InvalidConfig("min_node_count must be greater than 0".into()));
        }
        for (name, value) in [("domain", &self.domain), ("statement", &self.statement)] {
            if value.as_deref().is_some_and(|v| v.contains(['\n', '\r'])) {
                return Err(NetError::InvalidConfig(format!("{name} must be a single line")));
            }
        }
        for (name, secs) in [
            ("session_expiration_secs", self.session_expiration_secs),
            ("capability_expiration_secs", self.capability_expiration_secs),
        ] {
            if secs.is_some_and(|secs| secs > MAX_EXPIRATION_SECS) {
                return Err(NetError::InvalidConfig(format!(
                    "{name} must be at most {MAX_EXPIRATION_SECS}"
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.request_timeout())
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut config = SessionConfig::default();
        if let Some(domain) = &self.domain {
            config = config.with_domain(domain.clone());
        }
        if let Some(statement) = &self.statement {
            config = config.with_statement(statement.clone());
        }
        if let Some(chain_id) = self.chain_id {
            config = config.with_chain_id(chain_id);
        }
        if let Some(secs) = self.session_expiration_secs {
            config = config.with_session_expiration(expiration("session_expiration_secs", secs)?);
        }
        if let Some(secs) = self.capability_expiration_secs {
            config = config.with_capability_expiration(expiration("capability_expiration_secs", secs)?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let content = r#"
bootstrap_urls = ["https://node1:7470", "http://127.0.0.1:7471"]
min_node_count = 2
request_timeout_ms = 5000
handshake_timeout_ms = 1000
e2ee = false
check_node_attestation = true
session_expiration_secs = 600
capability_expiration_secs = 3600
domain = "example.org"
statement = "sign in"
chain_id = 137
storage_path = "/var/lib/quorum"
log_level = "debug"
"#;
        let config = ClientConfig::parse(content).unwrap();
        assert_eq!(config.bootstrap_urls.len(), 2);
        assert_eq!(config.min_node_count, Some(2));
        assert_eq!(config.request_timeout(), Duration::from_millis(5000));
        assert_eq!(config.handshake_timeout(), Duration::from_millis(1000));
        assert!(!config.e2ee);
        assert!(config.check_node_attestation);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/quorum")));

        let session = config.session_config().unwrap();
        assert_eq!(session.domain, "example.org");
        assert_eq!(session.chain_id, 137);
        assert_eq!(session.session_expiration, chrono::Duration::seconds(600));
        assert_eq!(session.capability_expiration, chrono::Duration::seconds(3600));
    }

    #[test]
    fn test_parse_empty_config() {
        let config = ClientConfig::parse("").unwrap();
        assert!(config.e2ee);
        assert!(!config.check_node_attestation);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.handshake_timeout(), DEFAULT_REQUEST_TIMEOUT);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = ClientConfig::parse(r#"bootstrap_urls = ["ftp://node"]"#);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("https://"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(ClientConfig::parse("request_timeout_ms = 0").is_err());
        assert!(ClientConfig::parse("session_expiration_secs = 0").is_err());
    }

    #[test]
    fn test_oversized_expiration_rejected() {
        let config = ClientConfig::parse(
            "bootstrap_urls = [\"https://a\"]\nsession_expiration_secs = 10000000000000000",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(NetError::InvalidConfig(_))));
        assert!(matches!(config.session_config(), Err(NetError::InvalidConfig(_))));

        let mut config = ClientConfig::new(["https://a"]);
        config.capability_expiration_secs = Some(u64::MAX);
        assert!(config.validate().is_err());
        assert!(config.session_config().is_err());

        config.capability_expiration_secs = Some(MAX_EXPIRATION_SECS);
        assert!(config.validate().is_ok());
        let session = config.session_config().unwrap();
        assert_eq!(
            session.capability_expiration,
            TimeDelta::try_seconds(MAX_EXPIRATION_SECS as i64).unwrap()
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ClientConfig::parse("relays = []").is_err());
    }

    #[test]
    fn test_validate_programmatic_config() {
        assert!(ClientConfig::new(["https://a", "https://b"]).validate().is_ok());
        assert!(ClientConfig::new(["node-a"]).validate().is_err());

        let mut config = ClientConfig::new(["https://a"]);
        config.min_node_count = Some(0);
        assert!(config.validate().is_err());

        let mut config = ClientConfig::new(["https://a"]);
        config.statement = Some("first\nsecond".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_and_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bootstrap_urls = [\"https://a\"]\n").unwrap();
        assert_eq!(ClientConfig::from_file(&path).unwrap().bootstrap_urls, vec!["https://a"]);

        std::fs::write(&path, vec![b'#'; 1024 * 1024 + 1]).unwrap();
        assert!(ClientConfig::from_file(&path).is_err());

        assert!(ClientConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
