// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{QuorumError, Result};

const HEADER_SUFFIX: &str = " wants you to sign in with your Ethereum account:";
const NONCE_LEN: usize = 17;

/// The human-readable message a wallet signs to delegate to a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiweMessage {
    pub domain: String,
    pub address: String,
    pub statement: Option<String>,
    pub uri: String,
    pub version: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub resources: Vec<String>,
}

pub fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(format!("{field}: {e}")))
}

fn malformed(detail: impl std::fmt::Display) -> QuorumError {
    QuorumError::AuthSig(format!("malformed signed message: {detail}"))
}

impl SiweMessage {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.is_some_and(|exp| exp <= now)
    }

    /// Renders the signed text. Every field must fit on one line.
    pub fn to_message(&self) -> Result<String> {
        let single_line = [
            ("domain", Some(self.domain.as_str())),
            ("address", Some(self.address.as_str())),
            ("statement", self.statement.as_deref()),
            ("uri", Some(self.uri.as_str())),
            ("version", Some(self.version.as_str())),
            ("nonce", Some(self.nonce.as_str())),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .chain(self.resources.iter().map(|r| ("resource", r.as_str())));
        for (name, value) in single_line {
            if value.contains(['\n', '\r']) {
                return Err(QuorumError::AuthSig(format!("{name} must not contain a line break")));
            }
        }

        let mut out = format!("{}{HEADER_SUFFIX}\n{}\n\n", self.domain, self.address);
        if let Some(statement) = &self.statement {
            out.push_str(statement);
            out.push_str("\n\n");
        }
        out.push_str(&format!("URI: {}\n", self.uri));
        out.push_str(&format!("Version: {}\n", self.version));
        out.push_str(&format!("Chain ID: {}\n", self.chain_id));
        out.push_str(&format!("Nonce: {}\n", self.nonce));
        out.push_str(&format!("Issued At: {}", format_time(&self.issued_at)));
        if let Some(exp) = &self.expiration_time {
            out.push_str(&format!("\nExpiration Time: {}", format_time(exp)));
        }
        if !self.resources.is_empty() {
            out.push_str("\nResources:");
            for resource in &self.resources {
                out.push_str(&format!("\n- {resource}"));
            }
        }
        Ok(out)
    }

    pub fn parse(message: &str) -> Result<Self> {
        let mut lines = message.lines();

        let domain = lines
            .next()
            .and_then(|l| l.strip_suffix(HEADER_SUFFIX))
            .filter(|d| !d.is_empty())
            .ok_or_else(|| malformed("missing header"))?
            .to_string();
        let address = lines
            .next()
            .filter(|a| a.starts_with("0x"))
            .ok_or_else(|| malformed("missing address"))?
            .to_string();
        if lines.next() != Some("") {
            return Err(malformed("expected blank line after address"));
        }

        let mut statement = None;
        let mut uri = None;
        let mut version = None;
        let mut chain_id = None;
        let mut nonce = None;
        let mut issued_at = None;
        let mut expiration_time = None;
        let mut resources = Vec::new();
        let mut in_resources = false;

        for line in lines {
            if in_resources {
                match line.strip_prefix("- ") {
                    Some(resource) => resources.push(resource.to_string()),
                    None => return Err(malformed(format!("unexpected line {line:?}"))),
                }
                continue;
            }
            if let Some(v) = line.strip_prefix("URI: ") {
                uri = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Version: ") {
                version = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Chain ID: ") {
                chain_id = Some(v.parse::<u64>().map_err(|e| malformed(format!("chain id: {e}")))?);
            } else if let Some(v) = line.strip_prefix("Nonce: ") {
                nonce = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Issued At: ") {
                issued_at = Some(parse_time("issued at", v)?);
            } else if let Some(v) = line.strip_prefix("Expiration Time: ") {
                expiration_time = Some(parse_time("expiration time", v)?);
            } else if line == "Resources:" {
                in_resources = true;
            } else if uri.is_none() && statement.is_none() && !line.is_empty() {
                statement = Some(line.to_string());
            } else if !line.is_empty() && !line.contains(": ") {
                return Err(malformed(format!("unexpected line {line:?}")));
            }
        }

        Ok(Self {
            domain,
            address,
            statement,
            uri: uri.ok_or_else(|| malformed("missing URI"))?,
            version: version.ok_or_else(|| malformed("missing version"))?,
            chain_id: chain_id.ok_or_else(|| malformed("missing chain id"))?,
            nonce: nonce.ok_or_else(|| malformed("missing nonce"))?,
            issued_at: issued_at.ok_or_else(|| malformed("missing issued at"))?,
            expiration_time,
            resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> SiweMessage {
        SiweMessage {
            domain: "localhost".into(),
            address: "0x52908400098527886E0F7030069857D2E4169EE7".into(),
            statement: Some("Delegate signing to a session key.".into()),
            uri: "lit:session:abcd".into(),
            version: "1".into(),
            chain_id: 1,
            nonce: "n0nce".into(),
            issued_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            expiration_time: Some(Utc.with_ymd_and_hms(2026, 1, 3, 3, 4, 5).unwrap()),
            resources: vec!["urn:recap:eyJkZWYiOltdfQ".into()],
        }
    }

    #[test]
    fn test_render_layout() {
        let text = sample().to_message().unwrap();
        let expected = "localhost wants you to sign in with your Ethereum account:\n\
0x52908400098527886E0F7030069857D2E4169EE7\n\
\n\
Delegate signing to a session key.\n\
\n\
URI: lit:session:abcd\n\
Version: 1\n\
Chain ID: 1\n\
Nonce: n0nce\n\
Issued At: 2026-01-02T03:04:05.000Z\n\
Expiration Time: 2026-01-03T03:04:05.000Z\n\
Resources:\n\
- urn:recap:eyJkZWYiOltdfQ";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_parse_rendered() {
        let msg = sample();
        assert_eq!(SiweMessage::parse(&msg.to_message().unwrap()).unwrap(), msg);

        let mut bare = sample();
        bare.statement = None;
        bare.expiration_time = None;
        bare.resources.clear();
        assert_eq!(SiweMessage::parse(&bare.to_message().unwrap()).unwrap(), bare);
    }

    #[test]
    fn test_line_breaks_rejected() {
        let mut msg = sample();
        msg.statement = Some("line one\nURI: evil".into());
        assert!(msg.to_message().is_err());

        let mut msg = sample();
        msg.resources.push("urn:recap:x\n- extra".into());
        assert!(msg.to_message().is_err());

        let mut msg = sample();
        msg.domain = "localhost\r".into();
        assert!(msg.to_message().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SiweMessage::parse("hello").is_err());
        let text = sample().to_message().unwrap().replace("Nonce: n0nce\n", "");
        assert!(SiweMessage::parse(&text).is_err());
        let text = sample().to_message().unwrap().replace("Chain ID: 1", "Chain ID: one");
        assert!(SiweMessage::parse(&text).is_err());
    }

    #[test]
    fn test_expiry() {
        let msg = sample();
        assert!(!msg.is_expired_at(Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap()));
        assert!(msg.is_expired_at(Utc.with_ymd_and_hms(2026, 1, 4, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_nonce() {
        let a = generate_nonce();
        assert_eq!(a.len(), NONCE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_nonce());
    }
}
