#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth_sig::{AuthSig, WalletSigner};
use crate::error::{QuorumError, Result};
use crate::recap::{CapabilityObject, ResourceRequest};
use crate::siwe::{generate_nonce, SiweMessage};
use crate::storage::Storage;

pub const SESSION_KEY_STORAGE_KEY: &str = "quorum-session-key";
pub const WALLET_SIG_STORAGE_KEY: &str = "quorum-wallet-sig";
pub const SESSION_KEY_URI_PREFIX: &str = "lit:session:";
pub const DERIVED_VIA_SESSION_SIG: &str = "litSessionSignViaNacl";
pub const SESSION_SIG_ALGO: &str = "ed25519";

pub const DEFAULT_SESSION_EXPIRATION_SECS: i64 = 5 * 60;
pub const DEFAULT_CAPABILITY_EXPIRATION_SECS: i64 = 24 * 60 * 60;

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QuorumError::Session(format!("invalid timestamp {value:?}: {e}")))
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSessionKey {
    public_key: String,
    secret_key: Zeroizing<String>,
}

/// Ed25519 key used to sign per-node session assertions.
#[derive(Clone)]
pub struct SessionKeyPair {
    signing_key: SigningKey,
}

impl SessionKeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn uri(&self) -> String {
        format!("{SESSION_KEY_URI_PREFIX}{}", self.public_key_hex())
    }

    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Serialises as `{publicKey, secretKey}` where the secret is `seed || public`.
    pub fn to_stored(&self) -> Result<Zeroizing<String>> {
        let keypair = Zeroizing::new(self.signing_key.to_keypair_bytes());
        let stored = StoredSessionKey {
            public_key: self.public_key_hex(),
            secret_key: Zeroizing::new(hex::encode(keypair.as_slice())),
        };
        Ok(Zeroizing::new(serde_json::to_string(&stored)?))
    }

    pub fn from_stored(value: &str) -> Result<Self> {
        let stored: StoredSessionKey = serde_json::from_str(value)
            .map_err(|e| QuorumError::Session(format!("malformed stored session key: {e}")))?;
        let secret = Zeroizing::new(
            hex::decode(stored.secret_key.as_str())
                .map_err(|e| QuorumError::Session(format!("invalid secret key hex: {e}")))?,
        );

        let signing_key = match secret.len() {
            32 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(&secret);
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let mut keypair = Zeroizing::new([0u8; 64]);
                keypair.copy_from_slice(&secret);
                SigningKey::from_keypair_bytes(&keypair)
                    .map_err(|e| QuorumError::Session(format!("inconsistent keypair: {e}")))?
            }
            n => {
                return Err(QuorumError::Session(format!(
                    "secret key must be 32 or 64 bytes, got {n}"
                )))
            }
        };

        let pair = Self { signing_key };
        if !pair.public_key_hex().eq_ignore_ascii_case(&stored.public_key) {
            return Err(QuorumError::Session(
                "stored public key does not match secret".into(),
            ));
        }
        Ok(pair)
    }
}

impl std::fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub domain: String,
    pub statement: Option<String>,
    pub chain_id: u64,
    pub session_expiration: Duration,
    pub capability_expiration: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".into(),
            statement: None,
            chain_id: 1,
            session_expiration: Duration::seconds(DEFAULT_SESSION_EXPIRATION_SECS),
            capability_expiration: Duration::seconds(DEFAULT_CAPABILITY_EXPIRATION_SECS),
        }
    }
}

impl SessionConfig {
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn with_session_expiration(mut self, expiration: Duration) -> Self {
        self.session_expiration = expiration;
        self
    }

    pub fn with_capability_expiration(mut self, expiration: Duration) -> Self {
        self.capability_expiration = expiration;
        self
    }
}

/// Every reason a stored capability can no longer be used. Empty means reuse it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResignReport {
    pub invalid_signature: Option<String>,
    pub uri_mismatch: Option<String>,
    pub expired: bool,
    pub uncovered: Vec<ResourceRequest>,
}

impl ResignReport {
    pub fn required(&self) -> bool {
        self.invalid_signature.is_some()
            || self.uri_mismatch.is_some()
            || self.expired
            || !self.uncovered.is_empty()
    }

    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if let Some(e) = &self.invalid_signature {
            reasons.push(format!("signature: {e}"));
        }
        if let Some(uri) = &self.uri_mismatch {
            reasons.push(format!("uri mismatch: {uri}"));
        }
        if self.expired {
            reasons.push("capability expired".to_string());
        }
        for resource in &self.uncovered {
            reasons.push(format!("not covered: {resource}"));
        }
        reasons
    }
}

pub fn check_resign(
    current: &AuthSig,
    resources: &[ResourceRequest],
    session_key_uri: &str,
    now: DateTime<Utc>,
) -> ResignReport {
    let mut report = ResignReport {
        invalid_signature: current.verify().err().map(|e| e.to_string()),
        ..Default::default()
    };

    match SiweMessage::parse(&current.signed_message) {
        Ok(message) => {
            if message.uri != session_key_uri {
                report.uri_mismatch = Some(message.uri.clone());
            }
            report.expired = message.is_expired_at(now);
            report.uncovered =
                match CapabilityObject::from_resources(message.resources.iter().map(String::as_str))
                {
                    Ok(capability) => capability.uncovered(resources),
                    Err(_) => resources.to_vec(),
                };
        }
        Err(e) => {
            report.uri_mismatch = Some(format!("unreadable message: {e}"));
            report.uncovered = resources.to_vec();
        }
    }
    report
}

pub fn needs_resign(current: &AuthSig, resources: &[ResourceRequest], session_key_uri: &str) -> bool {
    check_resign(current, resources, session_key_uri, Utc::now()).required()
}

/// The exact JSON a session key signs for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSigningTemplate {
    pub session_key: String,
    pub resources: Vec<String>,
    pub capabilities: Vec<AuthSig>,
    pub issued_at: String,
    pub expiration: String,
    pub node_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSignature {
    pub sig: String,
    pub derived_via: String,
    pub signed_message: String,
    pub address: String,
    pub algo: String,
}

impl SessionSignature {
    pub fn template(&self) -> Result<SessionSigningTemplate> {
        serde_json::from_str(&self.signed_message)
            .map_err(|e| QuorumError::Session(format!("malformed session signature: {e}")))
    }
}

pub type SessionSigs = BTreeMap<String, SessionSignature>;

pub fn validate_session_signature(
    signature: &SessionSignature,
    now: DateTime<Utc>,
) -> Result<SessionSigningTemplate> {
    let public: [u8; 32] = hex::decode(&signature.address)
        .map_err(|e| QuorumError::Session(format!("invalid session public key: {e}")))?
        .try_into()
        .map_err(|_| QuorumError::Session("session public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&public)
        .map_err(|e| QuorumError::Session(format!("invalid session public key: {e}")))?;
    let sig_bytes = hex::decode(&signature.sig)
        .map_err(|e| QuorumError::Session(format!("invalid signature hex: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| QuorumError::Session(format!("invalid signature: {e}")))?;
    key.verify(signature.signed_message.as_bytes(), &sig)
        .map_err(|_| QuorumError::Session("session signature does not verify".into()))?;

    let template = signature.template()?;
    if parse_time(&template.expiration)? <= now {
        return Err(QuorumError::Session("session signature expired".into()));
    }
    for capability in &template.capabilities {
        let message = SiweMessage::parse(&capability.signed_message)?;
        if message.is_expired_at(now) {
            return Err(QuorumError::Session("wallet capability expired".into()));
        }
    }
    Ok(template)
}

/// Owns the session key and wallet capability, and signs per-node assertions.
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    config: SessionConfig,
    session_key: Mutex<Option<SessionKeyPair>>,
    capability_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, config: SessionConfig) -> Self {
        Self {
            storage,
            config,
            session_key: Mutex::new(None),
            capability_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn get_session_key(&self) -> Result<SessionKeyPair> {
        let mut cached = self.session_key.lock();
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = match self.storage.get(SESSION_KEY_STORAGE_KEY)? {
            Some(stored) => match SessionKeyPair::from_stored(&stored) {
                Ok(key) => {
                    debug!(public_key = %key.public_key_hex(), "Loaded session key");
                    key
                }
                Err(e) => {
                    warn!(error = %e, "Discarding malformed session key");
                    self.persist_new_key()?
                }
            },
            None => self.persist_new_key()?,
        };
        *cached = Some(key.clone());
        Ok(key)
    }

    fn persist_new_key(&self) -> Result<SessionKeyPair> {
        let key = SessionKeyPair::generate();
        self.storage
            .set(SESSION_KEY_STORAGE_KEY, key.to_stored()?.as_str())?;
        info!(public_key = %key.public_key_hex(), "Generated session key");
        Ok(key)
    }

    /// Replaces the session key. The stored capability names the old key, so it goes too.
    pub fn rotate_session_key(&self) -> Result<SessionKeyPair> {
        let mut cached = self.session_key.lock();
        self.storage.remove(WALLET_SIG_STORAGE_KEY)?;
        let key = self.persist_new_key()?;
        *cached = Some(key.clone());
        Ok(key)
    }

    pub fn stored_capability(&self) -> Result<Option<AuthSig>> {
        let Some(stored) = self.storage.get(WALLET_SIG_STORAGE_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&stored) {
            Ok(auth) => Ok(Some(auth)),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed stored wallet signature");
                Ok(None)
            }
        }
    }

    pub fn check_stored_capability(&self, resources: &[ResourceRequest]) -> Result<Option<ResignReport>> {
        let key = self.get_session_key()?;
        Ok(self
            .stored_capability()?
            .map(|auth| check_resign(&auth, resources, &key.uri(), Utc::now())))
    }

    /// Reuses the stored capability when it still covers `resources`, otherwise
    /// prompts the wallet once and persists the new signature.
    pub async fn get_or_create_wallet_capability(
        &self,
        wallet: &dyn WalletSigner,
        resources: &[ResourceRequest],
        expiration: Option<DateTime<Utc>>,
    ) -> Result<AuthSig> {
        let _guard = self.capability_lock.lock().await;
        let key = self.get_session_key()?;
        let uri = key.uri();
        let now = Utc::now();

        if let Some(current) = self.stored_capability()? {
            let report = check_resign(&current, resources, &uri, now);
            if !report.required() {
                debug!("Reusing stored wallet capability");
                return Ok(current);
            }
            info!(reasons = ?report.reasons(), "Wallet capability must be re-signed");
        }

        let expiration = match expiration {
            Some(expiration) => expiration,
            None => now
                .checked_add_signed(self.config.capability_expiration)
                .ok_or_else(|| QuorumError::Capability("capability expiration out of range".into()))?,
        };
        if expiration <= now {
            return Err(QuorumError::Capability("expiration is in the past".into()));
        }
        let message = SiweMessage {
            domain: self.config.domain.clone(),
            address: wallet.address().await?,
            statement: self.config.statement.clone(),
            uri,
            version: "1".into(),
            chain_id: self.config.chain_id,
            nonce: generate_nonce(),
            issued_at: now,
            expiration_time: Some(expiration),
            resources: vec![CapabilityObject::for_resources(resources).to_uri()?],
        }
        .to_message()?;

        let signature = wallet.sign_message(&message).await?;
        let auth = AuthSig::personal_sign(message, signature);
        auth.verify()
            .map_err(|e| QuorumError::Wallet(format!("wallet returned an unusable signature: {e}")))?;

        self.storage
            .set(WALLET_SIG_STORAGE_KEY, &serde_json::to_string(&auth)?)?;
        info!(address = %auth.address, "Stored new wallet capability");
        Ok(auth)
    }

    pub fn sign_for_node(
        &self,
        node_url: &str,
        resources: &[ResourceRequest],
        capability: &AuthSig,
    ) -> Result<SessionSignature> {
        let key = self.get_session_key()?;
        let issued_at = Utc::now();
        let expiration = issued_at
            .checked_add_signed(self.config.session_expiration)
            .ok_or_else(|| QuorumError::Session("session expiration out of range".into()))?;
        let template = SessionSigningTemplate {
            session_key: key.public_key_hex(),
            resources: resources.iter().map(ToString::to_string).collect(),
            capabilities: vec![capability.clone()],
            issued_at: format_time(&issued_at),
            expiration: format_time(&expiration),
            node_address: node_url.to_string(),
        };
        let signed_message = serde_json::to_string(&template)?;
        Ok(SessionSignature {
            sig: key.sign(signed_message.as_bytes()),
            derived_via: DERIVED_VIA_SESSION_SIG.into(),
            signed_message,
            address: key.public_key_hex(),
            algo: SESSION_SIG_ALGO.into(),
        })
    }

    pub fn session_sigs<'a>(
        &self,
        node_urls: impl IntoIterator<Item = &'a str>,
        resources: &[ResourceRequest],
        capability: &AuthSig,
    ) -> Result<SessionSigs> {
        node_urls
            .into_iter()
            .map(|url| Ok((url.to_string(), self.sign_for_node(url, resources, capability)?)))
            .collect()
    }
}
