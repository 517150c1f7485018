// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quorum_core::{
    ClientKeySet, EncryptedEnvelope, NodeKeys, ResourceRequest, SessionManager, SessionSigs,
    Storage, WalletSigner,
};

use crate::combine::{CombinedSignature, ShareCombiner};
use crate::config::ClientConfig;
use crate::error::{FailureReason, NetError, NodeFailure, Result};
use crate::fanout::{Completion, FanOut, NodeCall, NodeCodec};
use crate::handshake::{
    connect_minimum, default_threshold, generate_challenge, most_common, resolve, AttestationVerifier,
    EpochState, HandshakeManager, HandshakeRecord, ResolvedConfig,
};
use crate::protocol::{
    rejection_message, DecryptRequest, DecryptionShare, ExecuteJsRequest, ExecuteJsResponse,
    PkpSignRequest, SignatureShare, SigningScheme, Validate, DECRYPTION_ABILITY, DECRYPT_PATH,
    EXECUTE_JS_PATH, EXECUTION_ABILITY, MAX_TO_SIGN_LEN, PKP_SIGNING_ABILITY, PKP_SIGN_PATH,
};
use crate::transport::Transport;

pub const DECRYPTION_IDENTITY_PREFIX: &str = "lit-accesscontrolcondition://";

/// One connected view of the network. Replaced whole, never mutated.
#[derive(Debug)]
pub struct NetworkState {
    pub config: ResolvedConfig,
    pub nodes: Vec<String>,
    pub keys: ClientKeySet,
    pub epoch: EpochState,
    pub records: BTreeMap<String, HandshakeRecord>,
    pub threshold: usize,
}

impl NetworkState {
    pub fn effective_epoch(&self, now: DateTime<Utc>) -> Option<u64> {
        self.epoch.effective_epoch(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochChanged {
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct PkpSignParams {
    pub to_sign: Vec<u8>,
    pub pubkey: String,
    pub signing_scheme: SigningScheme,
    /// Defaults to signing with any PKP.
    pub resources: Option<Vec<ResourceRequest>>,
}

#[derive(Debug, Clone)]
pub struct DecryptParams {
    pub ciphertext: String,
    pub data_to_encrypt_hash: String,
    pub access_control_conditions: Value,
    pub chain: String,
}

impl DecryptParams {
    /// `<sha256(conditions)>/<dataToEncryptHash>`
    pub fn resource_id(&self) -> Result<String> {
        let conditions = serde_json::to_vec(&self.access_control_conditions)?;
        Ok(format!(
            "{}/{}",
            hex::encode(Sha256::digest(conditions)),
            self.data_to_encrypt_hash
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteJsParams {
    pub code: Option<String>,
    pub ipfs_id: Option<String>,
    pub js_params: Value,
    pub resources: Option<Vec<ResourceRequest>>,
}

#[derive(Debug, Clone)]
pub struct SigningOutcome {
    pub request_id: String,
    pub failed: Vec<NodeFailure>,
    pub shares: Vec<SignatureShare>,
    /// Present when a combiner is configured.
    pub signature: Option<CombinedSignature>,
}

#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub request_id: String,
    pub failed: Vec<NodeFailure>,
    pub shares: Vec<DecryptionShare>,
    pub plaintext: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExecuteJsOutcome {
    pub request_id: String,
    pub failed: Vec<NodeFailure>,
    pub response: Value,
    pub logs: String,
    pub signed_data: BTreeMap<String, Vec<SignatureShare>>,
    pub signatures: BTreeMap<String, CombinedSignature>,
}

/// Drops a single-key `{"data": ...}` wrapper.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Per-node request encoding for one facade operation, with optional E2EE.
struct NodeOperation<'a, T, F> {
    path: &'static str,
    state: &'a NetworkState,
    e2ee: bool,
    body: F,
    _output: PhantomData<fn() -> T>,
}

impl<'a, T, F> NodeOperation<'a, T, F> {
    fn new(path: &'static str, state: &'a NetworkState, e2ee: bool, body: F) -> Self {
        Self {
            path,
            state,
            e2ee,
            body,
            _output: PhantomData,
        }
    }

    fn node_keys(&self, url: &str) -> Option<&NodeKeys> {
        self.state.keys.get(url)
    }

    fn open_reply(&self, url: &str, body: &Value) -> std::result::Result<Value, FailureReason> {
        let envelope = EncryptedEnvelope::from_value(body)
            .ok_or_else(|| FailureReason::InvalidResponse("expected an encrypted envelope".into()))?;
        let keys = self
            .node_keys(url)
            .ok_or_else(|| FailureReason::Decryption("no encryption keys for node".into()))?;
        let plaintext = keys
            .open(&envelope)
            .map_err(|e| FailureReason::Decryption(e.to_string()))?;
        serde_json::from_slice(&plaintext).map_err(|e| FailureReason::Decryption(e.to_string()))
    }
}

impl<T, F> NodeCodec for NodeOperation<'_, T, F>
where
    T: DeserializeOwned + Validate + Send,
    F: Fn(&str) -> std::result::Result<Value, String> + Sync,
{
    type Output = T;

    fn build(&self, url: &str) -> std::result::Result<NodeCall, String> {
        let body = (self.body)(url)?;
        if !self.e2ee {
            return Ok(NodeCall::new(self.path, body));
        }
        let keys = self
            .node_keys(url)
            .ok_or_else(|| "no encryption keys for node".to_string())?;
        let envelope = keys.seal_json(&body).map_err(|e| e.to_string())?;
        let body = serde_json::to_value(envelope).map_err(|e| e.to_string())?;
        Ok(NodeCall::new(self.path, body))
    }

    fn decode(&self, url: &str, body: Value) -> std::result::Result<T, FailureReason> {
        let body = if self.e2ee {
            self.open_reply(url, &body)?
        } else {
            body
        };
        let value: T = serde_json::from_value(unwrap_data(body))
            .map_err(|e| FailureReason::InvalidResponse(e.to_string()))?;
        value.validate().map_err(FailureReason::InvalidResponse)?;
        Ok(value)
    }

    fn rejected(&self, url: &str, status: u16, body: Option<Value>) -> FailureReason {
        let decrypted = body.as_ref().filter(|_| self.e2ee).and_then(|body| {
            let candidate = body.get("error").unwrap_or(body);
            EncryptedEnvelope::from_value(candidate)?;
            match self.open_reply(url, candidate) {
                Ok(value) => Some(unwrap_data(value)),
                Err(e) => {
                    debug!(url = %url, error = %e, "Could not open encrypted rejection");
                    None
                }
            }
        });
        let message = rejection_message(status, decrypted.as_ref().or(body.as_ref()));
        FailureReason::Rejected { status, message }
    }
}

fn to_body<S: Serialize>(request: &S) -> std::result::Result<Value, String> {
    serde_json::to_value(request).map_err(|e| e.to_string())
}

/// Talks to the whole node set: connects, keeps the session, runs operations.
pub struct NetworkClient {
    config: ClientConfig,
    handshake: HandshakeManager,
    fanout: FanOut,
    sessions: SessionManager,
    combiner: Option<Arc<dyn ShareCombiner>>,
    completion: Completion,
    state: ArcSwapOption<NetworkState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl NetworkClient {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let handshake = HandshakeManager::new(transport.clone())
            .with_timeout(config.handshake_timeout())
            .require_attestation(config.check_node_attestation);
        let fanout = FanOut::new(transport).with_timeout(config.request_timeout());
        let sessions = SessionManager::new(storage, config.session_config()?);
        Ok(Self {
            config,
            handshake,
            fanout,
            sessions,
            combiner: None,
            completion: Completion::default(),
            state: ArcSwapOption::empty(),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn ShareCombiner>) -> Self {
        self.combiner = Some(combiner);
        self
    }

    pub fn with_attestation_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.handshake = self.handshake.with_verifier(verifier);
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = completion;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn connect(&self) -> Result<Arc<NetworkState>> {
        if self.config.check_node_attestation && !self.handshake.has_verifier() {
            return Err(NetError::Attestation(
                "attestation checking is enabled but no verifier is configured".into(),
            ));
        }
        self.refresh().await
    }

    /// Re-handshakes every bootstrap node and swaps in the new state. On
    /// failure the previous state stays in place.
    pub async fn refresh(&self) -> Result<Arc<NetworkState>> {
        let _guard = self.refresh_lock.lock().await;
        let outcome = self
            .handshake
            .handshake(&self.config.bootstrap_urls, |_| generate_challenge())
            .await;
        let required =
            connect_minimum(self.config.bootstrap_urls.len(), self.config.min_node_count);
        if outcome.order.len() < required {
            warn!(
                request_id = %outcome.request_id,
                connected = outcome.order.len(),
                bootstrap = self.config.bootstrap_urls.len(),
                required,
                "Too few nodes completed the handshake"
            );
            return Err(NetError::QuorumNotMet {
                request_id: outcome.request_id,
                required,
                succeeded: outcome.order.len(),
                failures: outcome.failures,
            });
        }
        let config = resolve(outcome.ordered_records())?;

        let nodes = outcome.order.clone();
        let threshold = self
            .config
            .min_node_count
            .unwrap_or_else(|| default_threshold(nodes.len()));

        let previous = self.state.load_full();
        let epoch = previous
            .as_ref()
            .map(|state| state.epoch)
            .unwrap_or_default()
            .advance(config.epoch, Utc::now());
        if let Some(previous) = &previous {
            if previous.config.network_pub_key != config.network_pub_key {
                warn!("Network public key changed on refresh");
            }
        }

        info!(
            nodes = nodes.len(),
            threshold,
            epoch = ?config.epoch,
            latest_blockhash = %config.latest_blockhash,
            "Resolved network config"
        );
        let state = Arc::new(NetworkState {
            config,
            nodes,
            keys: outcome.keys,
            epoch,
            records: outcome.records,
            threshold,
        });
        self.state.store(Some(state.clone()));
        Ok(state)
    }

    pub fn snapshot(&self) -> Result<Arc<NetworkState>> {
        self.state
            .load_full()
            .ok_or_else(|| NetError::NotConnected("call connect() first".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.state.load().is_some()
    }

    async fn sigs_for(
        &self,
        state: &NetworkState,
        wallet: &dyn WalletSigner,
        resources: &[ResourceRequest],
    ) -> Result<SessionSigs> {
        let capability = self
            .sessions
            .get_or_create_wallet_capability(wallet, resources, None)
            .await?;
        Ok(self
            .sessions
            .session_sigs(state.nodes.iter().map(String::as_str), resources, &capability)?)
    }

    /// One session signature per connected node.
    pub async fn session_sigs(
        &self,
        wallet: &dyn WalletSigner,
        resources: &[ResourceRequest],
    ) -> Result<SessionSigs> {
        let state = self.snapshot()?;
        self.sigs_for(&state, wallet, resources).await
    }

    pub async fn pkp_sign(
        &self,
        wallet: &dyn WalletSigner,
        params: PkpSignParams,
    ) -> Result<SigningOutcome> {
        if params.to_sign.is_empty() || params.to_sign.len() > MAX_TO_SIGN_LEN {
            return Err(NetError::InvalidRequest(format!(
                "toSign must be 1..={MAX_TO_SIGN_LEN} bytes, got {}",
                params.to_sign.len()
            )));
        }
        let state = self.snapshot()?;
        let resources = params
            .resources
            .clone()
            .unwrap_or_else(|| vec![ResourceRequest::new(PKP_SIGNING_ABILITY, "*")]);
        let sigs = self.sigs_for(&state, wallet, &resources).await?;
        let epoch = state.effective_epoch(Utc::now());

        let codec = NodeOperation::<SignatureShare, _>::new(
            PKP_SIGN_PATH,
            &state,
            self.config.e2ee,
            |url: &str| -> std::result::Result<Value, String> {
                let auth_sig = sigs.get(url).cloned().ok_or("no session signature for node")?;
                to_body(&PkpSignRequest {
                    to_sign: params.to_sign.clone(),
                    signing_scheme: params.signing_scheme,
                    pubkey: params.pubkey.clone(),
                    auth_sig,
                    node_set: state.nodes.clone(),
                    epoch,
                })
            },
        );
        let outcome = self
            .fanout
            .fan_out(&state.nodes, state.threshold, self.completion, &codec)
            .await?;
        let request_id = outcome.request_id.clone();
        let failed = outcome.failed.clone();
        let shares = outcome.into_values();

        let signature = match &self.combiner {
            Some(combiner) => Some(combiner.combine_signature(&shares).map_err(NetError::Combine)?),
            None => None,
        };
        Ok(SigningOutcome {
            request_id,
            failed,
            shares,
            signature,
        })
    }

    pub async fn decrypt(
        &self,
        wallet: &dyn WalletSigner,
        params: DecryptParams,
    ) -> Result<DecryptOutcome> {
        let state = self.snapshot()?;
        let resource_id = params.resource_id()?;
        let resources = vec![ResourceRequest::new(DECRYPTION_ABILITY, resource_id.clone())];
        let sigs = self.sigs_for(&state, wallet, &resources).await?;
        let epoch = state.effective_epoch(Utc::now());

        let codec = NodeOperation::<DecryptionShare, _>::new(
            DECRYPT_PATH,
            &state,
            self.config.e2ee,
            |url: &str| -> std::result::Result<Value, String> {
                let auth_sig = sigs.get(url).cloned().ok_or("no session signature for node")?;
                to_body(&DecryptRequest {
                    ciphertext: params.ciphertext.clone(),
                    data_to_encrypt_hash: params.data_to_encrypt_hash.clone(),
                    access_control_conditions: params.access_control_conditions.clone(),
                    chain: params.chain.clone(),
                    auth_sig,
                    epoch,
                })
            },
        );
        let outcome = self
            .fanout
            .fan_out(&state.nodes, state.threshold, self.completion, &codec)
            .await?;
        let request_id = outcome.request_id.clone();
        let failed = outcome.failed.clone();
        let shares = outcome.into_values();

        let plaintext = match &self.combiner {
            Some(combiner) => {
                let network_pub_key = state.config.network_pub_key.as_deref().ok_or_else(|| {
                    NetError::ConfigResolution("no network public key to decrypt against".into())
                })?;
                let identity = format!("{DECRYPTION_IDENTITY_PREFIX}{resource_id}");
                Some(
                    combiner
                        .combine_decryption(
                            network_pub_key,
                            identity.as_bytes(),
                            &params.ciphertext,
                            &shares,
                        )
                        .map_err(NetError::Combine)?,
                )
            }
            None => None,
        };
        Ok(DecryptOutcome {
            request_id,
            failed,
            shares,
            plaintext,
        })
    }

    pub async fn execute_js(
        &self,
        wallet: &dyn WalletSigner,
        params: ExecuteJsParams,
    ) -> Result<ExecuteJsOutcome> {
        if params.code.is_some() == params.ipfs_id.is_some() {
            return Err(NetError::InvalidRequest(
                "exactly one of code or ipfs_id is required".into(),
            ));
        }
        let state = self.snapshot()?;
        let resources = params
            .resources
            .clone()
            .unwrap_or_else(|| vec![ResourceRequest::new(EXECUTION_ABILITY, "*")]);
        let sigs = self.sigs_for(&state, wallet, &resources).await?;
        let epoch = state.effective_epoch(Utc::now());

        let codec = NodeOperation::<ExecuteJsResponse, _>::new(
            EXECUTE_JS_PATH,
            &state,
            self.config.e2ee,
            |url: &str| -> std::result::Result<Value, String> {
                let auth_sig = sigs.get(url).cloned().ok_or("no session signature for node")?;
                to_body(&ExecuteJsRequest {
                    code: params.code.clone(),
                    ipfs_id: params.ipfs_id.clone(),
                    js_params: params.js_params.clone(),
                    auth_sig,
                    node_set: state.nodes.clone(),
                    epoch,
                })
            },
        );
        let outcome = self
            .fanout
            .fan_out(&state.nodes, state.threshold, self.completion, &codec)
            .await?;
        let request_id = outcome.request_id.clone();
        let failed = outcome.failed.clone();
        let replies = outcome.into_values();

        let response = most_common(replies.iter().map(|r| &r.response))
            .cloned()
            .unwrap_or(Value::Null);
        let logs = most_common(replies.iter().map(|r| &r.logs))
            .cloned()
            .unwrap_or_default();

        let mut signed_data: BTreeMap<String, Vec<SignatureShare>> = BTreeMap::new();
        for reply in replies {
            for (name, share) in reply.signed_data {
                signed_data.entry(name).or_default().push(share);
            }
        }

        let mut signatures = BTreeMap::new();
        if let Some(combiner) = &self.combiner {
            for (name, shares) in &signed_data {
                let combined = combiner
                    .combine_signature(shares)
                    .map_err(|e| NetError::Combine(format!("{name}: {e}")))?;
                signatures.insert(name.clone(), combined);
            }
        }

        Ok(ExecuteJsOutcome {
            request_id,
            failed,
            response,
            logs,
            signed_data,
            signatures,
        })
    }
}

/// Refreshes `client` on every epoch change until the event source closes.
pub fn spawn_epoch_listener(
    client: Arc<NetworkClient>,
    mut events: mpsc::Receiver<EpochChanged>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(epoch = event.epoch, "Epoch changed, refreshing node set");
            if let Err(e) = client.refresh().await {
                warn!(error = %e, "Refresh failed, keeping previous network state");
            }
        }
        debug!("Epoch event source closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_data() {
        assert_eq!(unwrap_data(json!({"data": {"a": 1}})), json!({"a": 1}));
        assert_eq!(
            unwrap_data(json!({"data": 1, "other": 2})),
            json!({"data": 1, "other": 2})
        );
        assert_eq!(unwrap_data(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_decrypt_resource_id_is_stable() {
        let params = DecryptParams {
            ciphertext: "c".into(),
            data_to_encrypt_hash: "abcd".into(),
            access_control_conditions: json!([{"chain": "ethereum", "method": ""}]),
            chain: "ethereum".into(),
        };
        let id = params.resource_id().unwrap();
        assert_eq!(id, params.resource_id().unwrap());
        let (hash, data) = id.split_once('/').unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(data, "abcd");
    }
}
