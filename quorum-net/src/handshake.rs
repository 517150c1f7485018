// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use quorum_core::{ClientKeySet, EncryptionKeyPair, NodeKeys};

use crate::error::{FailureReason, NetError, NodeFailure, Result};
use crate::protocol::{
    rejection_message, HandshakeRequest, HandshakeResponse, NodeAttestation, Validate,
    HANDSHAKE_PATH,
};
use crate::transport::{generate_request_id, NodeReply, NodeRequest, Transport, DEFAULT_REQUEST_TIMEOUT};

/// Within this window after an observed epoch change, requests are stamped
/// with the previous epoch.
pub const EPOCH_GRACE_SECS: i64 = 45;
pub const MIN_THRESHOLD: usize = 3;

/// Opaque check of a node's hardware attestation.
pub trait AttestationVerifier: Send + Sync {
    fn verify(
        &self,
        attestation: &NodeAttestation,
        challenge: &str,
        url: &str,
    ) -> std::result::Result<(), String>;
}

pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `max(3, floor(2n/3))`
pub fn default_threshold(node_count: usize) -> usize {
    (node_count * 2 / 3).max(MIN_THRESHOLD)
}

/// Successful handshakes needed to connect to `bootstrap_count` nodes:
/// `max(minimum, floor(2 * bootstrap_count / 3))`, where `minimum` is the
/// configured node count or 3.
pub fn connect_minimum(bootstrap_count: usize, min_node_count: Option<usize>) -> usize {
    (bootstrap_count * 2 / 3).max(min_node_count.unwrap_or(MIN_THRESHOLD))
}

/// Mode of `values`. Ties go to the value seen first.
pub fn most_common<T: PartialEq>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut tally: Vec<(T, usize)> = Vec::new();
    for value in values {
        match tally.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }
    let mut best: Option<(T, usize)> = None;
    for (value, count) in tally {
        if best.as_ref().map_or(true, |(_, top)| count > *top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRecord {
    pub server_public_key: String,
    pub subnet_public_key: Option<String>,
    pub network_public_key: Option<String>,
    pub network_public_key_set: Option<String>,
    pub hd_root_pubkeys: Vec<String>,
    pub latest_blockhash: Option<String>,
    pub node_version: Option<String>,
    pub epoch: Option<u64>,
}

impl From<HandshakeResponse> for HandshakeRecord {
    fn from(r: HandshakeResponse) -> Self {
        Self {
            server_public_key: r.server_public_key,
            subnet_public_key: r.subnet_public_key,
            network_public_key: r.network_public_key,
            network_public_key_set: r.network_public_key_set,
            hd_root_pubkeys: r.hd_root_pubkeys,
            latest_blockhash: r.latest_blockhash,
            node_version: r.node_version,
            epoch: r.epoch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub subnet_pub_key: Option<String>,
    pub network_pub_key: Option<String>,
    pub network_pub_key_set: Option<String>,
    pub hd_root_pubkeys: Vec<String>,
    pub latest_blockhash: String,
    pub epoch: Option<u64>,
}

fn plurality<'a>(
    records: &[&'a HandshakeRecord],
    pick: impl Fn(&'a HandshakeRecord) -> Option<&'a String>,
) -> Option<String> {
    most_common(records.iter().filter_map(|r| pick(*r))).cloned()
}

/// Per-field plurality over the records, in the order given.
pub fn resolve<'a>(records: impl IntoIterator<Item = &'a HandshakeRecord>) -> Result<ResolvedConfig> {
    let records: Vec<&HandshakeRecord> = records.into_iter().collect();
    if records.is_empty() {
        return Err(NetError::ConfigResolution("no node completed the handshake".into()));
    }

    let latest_blockhash = plurality(&records, |r| r.latest_blockhash.as_ref())
        .ok_or_else(|| NetError::ConfigResolution("no node reported latestBlockhash".into()))?;
    let subnet_pub_key = plurality(&records, |r| r.subnet_public_key.as_ref());
    let network_pub_key = plurality(&records, |r| r.network_public_key.as_ref());
    let network_pub_key_set = plurality(&records, |r| r.network_public_key_set.as_ref());
    let hd_root_pubkeys = most_common(records.iter().map(|r| &r.hd_root_pubkeys))
        .cloned()
        .unwrap_or_default();
    let epoch = most_common(records.iter().filter_map(|r| r.epoch));

    Ok(ResolvedConfig {
        subnet_pub_key,
        network_pub_key,
        network_pub_key_set,
        hd_root_pubkeys,
        latest_blockhash,
        epoch,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochState {
    pub current_number: Option<u64>,
    /// Unix seconds at which the current epoch was first observed.
    pub start_time: Option<i64>,
}

impl EpochState {
    pub fn effective_epoch(&self, now: DateTime<Utc>) -> Option<u64> {
        let current = self.current_number?;
        let Some(start) = self.start_time else {
            return Some(current);
        };
        if now.timestamp() < start + EPOCH_GRACE_SECS && current >= 3 {
            return Some(current - 1);
        }
        Some(current)
    }

    /// Carries the start time forward unless the epoch number moved.
    pub fn advance(&self, epoch: Option<u64>, now: DateTime<Utc>) -> Self {
        match (self.current_number, epoch) {
            (Some(previous), Some(next)) if previous != next => Self {
                current_number: Some(next),
                start_time: Some(now.timestamp()),
            },
            (_, next) if next == self.current_number => *self,
            (_, next) => Self {
                current_number: next,
                start_time: None,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    pub request_id: String,
    pub records: BTreeMap<String, HandshakeRecord>,
    pub order: Vec<String>,
    pub keys: ClientKeySet,
    pub failures: Vec<NodeFailure>,
}

impl HandshakeOutcome {
    pub fn ordered_records(&self) -> impl Iterator<Item = &HandshakeRecord> {
        self.order.iter().filter_map(|url| self.records.get(url))
    }
}

pub struct HandshakeManager {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    verifier: Option<Arc<dyn AttestationVerifier>>,
    require_attestation: bool,
}

impl HandshakeManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            verifier: None,
            require_attestation: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Nodes without an attestation are excluded when set.
    pub fn require_attestation(mut self, required: bool) -> Self {
        self.require_attestation = required;
        self
    }

    pub fn has_verifier(&self) -> bool {
        self.verifier.is_some()
    }

    fn check_attestation(
        &self,
        url: &str,
        challenge: &str,
        attestation: Option<&NodeAttestation>,
    ) -> std::result::Result<(), FailureReason> {
        let Some(attestation) = attestation else {
            if self.require_attestation {
                return Err(FailureReason::InvalidResponse("missing attestation".into()));
            }
            return Ok(());
        };
        if attestation.nonce != challenge {
            return Err(FailureReason::InvalidResponse(
                "attestation does not echo the challenge".into(),
            ));
        }
        if let Some(verifier) = &self.verifier {
            verifier
                .verify(attestation, challenge, url)
                .map_err(|e| FailureReason::InvalidResponse(format!("attestation rejected: {e}")))?;
        }
        Ok(())
    }

    async fn handshake_one(
        &self,
        url: &str,
        challenge: String,
        request_id: &str,
    ) -> std::result::Result<(HandshakeRecord, NodeKeys), FailureReason> {
        let client_keys = EncryptionKeyPair::generate();
        let body = serde_json::to_value(HandshakeRequest {
            client_public_key: client_keys.public_key_hex(),
            challenge: challenge.clone(),
        })
        .map_err(|e| FailureReason::Request(e.to_string()))?;

        let request = NodeRequest::new(url, HANDSHAKE_PATH, body, request_id);
        let body = match self.transport.send(&request, self.timeout).await {
            Ok(NodeReply::Accepted(body)) => body,
            Ok(NodeReply::Rejected { status, body }) => {
                return Err(FailureReason::Rejected {
                    status,
                    message: rejection_message(status, body.as_ref()),
                })
            }
            Err(e) => return Err(FailureReason::Network(e)),
        };

        let response: HandshakeResponse = serde_json::from_value(body)
            .map_err(|e| FailureReason::InvalidResponse(e.to_string()))?;
        response.validate().map_err(FailureReason::InvalidResponse)?;
        self.check_attestation(url, &challenge, response.attestation.as_ref())?;

        let reported_error = [
            &response.subnet_public_key,
            &response.network_public_key,
            &response.network_public_key_set,
        ]
        .into_iter()
        .flatten()
        .any(|k| k.contains("ERR"));
        if reported_error {
            error!(url = %url, "Node reported an error in its public keys");
        }

        let node_public = hex::decode(response.server_public_key.trim_start_matches("0x"))
            .map_err(|e| FailureReason::InvalidResponse(e.to_string()))?;
        let keys = NodeKeys::new(client_keys, &node_public);
        Ok((HandshakeRecord::from(response), keys))
    }

    /// Handshakes every node concurrently with its own challenge. Nodes that
    /// fail are reported in `failures` and left out of `records`.
    pub async fn handshake<F>(&self, urls: &[String], challenge_fn: F) -> HandshakeOutcome
    where
        F: Fn(&str) -> String,
    {
        let request_id = generate_request_id();
        let calls = urls.iter().map(|url| {
            let challenge = challenge_fn(url);
            let request_id = request_id.as_str();
            async move { (url, self.handshake_one(url, challenge, request_id).await) }
        });

        let mut outcome = HandshakeOutcome {
            request_id: request_id.clone(),
            ..Default::default()
        };
        for (url, result) in join_all(calls).await {
            match result {
                Ok((record, keys)) => {
                    debug!(url = %url, epoch = ?record.epoch, "Handshake complete");
                    outcome.order.push(url.clone());
                    outcome.keys.insert(url.clone(), keys);
                    outcome.records.insert(url.clone(), record);
                }
                Err(reason) => {
                    warn!(url = %url, error = %reason, "Excluding node from handshake");
                    outcome.failures.push(NodeFailure {
                        url: url.clone(),
                        reason,
                    });
                }
            }
        }
        info!(
            request_id = %request_id,
            connected = outcome.records.len(),
            failed = outcome.failures.len(),
            "Handshake round finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_connect_minimum() {
        assert_eq!(connect_minimum(10, None), 6);
        assert_eq!(connect_minimum(3, None), 3);
        assert_eq!(connect_minimum(3, Some(2)), 2);
        assert_eq!(connect_minimum(10, Some(2)), 6);
        assert_eq!(connect_minimum(10, Some(8)), 8);
    }

    fn record(blockhash: Option<&str>, network: &str) -> HandshakeRecord {
        HandshakeRecord {
            server_public_key: "aa".into(),
            subnet_public_key: Some("subnet".into()),
            network_public_key: Some(network.into()),
            network_public_key_set: Some("set".into()),
            hd_root_pubkeys: vec!["h".into()],
            latest_blockhash: blockhash.map(str::to_string),
            node_version: Some("1.0".into()),
            epoch: Some(5),
        }
    }

    #[test]
    fn test_most_common_first_seen_tie_break() {
        assert_eq!(most_common(["b", "a", "a", "b"]), Some("b"));
        assert_eq!(most_common(["a", "b", "b"]), Some("b"));
        assert_eq!(most_common(Vec::<u8>::new()), None);
    }

    #[test]
    fn test_byzantine_minority() {
        let records = vec![
            record(Some("0xabc"), "K1"),
            record(Some("0xabc"), "K2"),
            record(Some("0xabc"), "K1"),
            record(Some("0xabc"), "K1"),
            record(Some("0xabc"), "K1"),
        ];
        let config = resolve(&records).unwrap();
        assert_eq!(config.network_pub_key.as_deref(), Some("K1"));
        assert_eq!(config.latest_blockhash, "0xabc");
        assert_eq!(config.epoch, Some(5));
    }

    #[test]
    fn test_missing_blockhash_fails() {
        let records = vec![record(None, "K1"), record(None, "K1")];
        let err = resolve(&records).unwrap_err();
        assert!(matches!(err, NetError::ConfigResolution(_)));
        assert!(err.to_string().contains("latestBlockhash"));

        assert!(resolve(Vec::<&HandshakeRecord>::new()).is_err());
    }

    #[test]
    fn test_partial_blockhash_still_resolves() {
        let records = vec![record(None, "K1"), record(Some("0xdef"), "K1")];
        assert_eq!(resolve(&records).unwrap().latest_blockhash, "0xdef");
    }

    #[test]
    fn test_default_threshold() {
        assert_eq!(default_threshold(1), 3);
        assert_eq!(default_threshold(3), 3);
        assert_eq!(default_threshold(6), 4);
        assert_eq!(default_threshold(10), 6);
    }

    #[test]
    fn test_effective_epoch() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let state = EpochState {
            current_number: Some(10),
            start_time: Some(start.timestamp()),
        };
        assert_eq!(state.effective_epoch(start + chrono::Duration::seconds(10)), Some(9));
        assert_eq!(state.effective_epoch(start + chrono::Duration::seconds(45)), Some(10));

        let early = EpochState {
            current_number: Some(2),
            start_time: Some(start.timestamp()),
        };
        assert_eq!(early.effective_epoch(start), Some(2));

        assert_eq!(EpochState::default().effective_epoch(start), None);
        let no_start = EpochState {
            current_number: Some(4),
            start_time: None,
        };
        assert_eq!(no_start.effective_epoch(start), Some(4));
    }

    #[test]
    fn test_epoch_advance() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let initial = EpochState::default().advance(Some(7), now);
        assert_eq!(initial.current_number, Some(7));
        assert_eq!(initial.start_time, None);

        let same = initial.advance(Some(7), now);
        assert_eq!(same, initial);

        let changed = initial.advance(Some(8), now);
        assert_eq!(changed.current_number, Some(8));
        assert_eq!(changed.start_time, Some(now.timestamp()));
    }

    #[test]
    fn test_challenge_format() {
        let c = generate_challenge();
        assert_eq!(c.len(), 64);
        assert!(c.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
