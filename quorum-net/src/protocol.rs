use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use quorum_core::SessionSignature;

pub const HANDSHAKE_PATH: &str = "/web/handshake";
pub const PKP_SIGN_PATH: &str = "/web/pkp/sign";
pub const DECRYPT_PATH: &str = "/web/encryption/sign";
pub const EXECUTE_JS_PATH: &str = "/web/execute";

pub const PKP_SIGNING_ABILITY: &str = "pkp-signing";
pub const DECRYPTION_ABILITY: &str = "access-control-condition-decryption";
pub const EXECUTION_ABILITY: &str = "lit-action-execution";

pub const MAX_TO_SIGN_LEN: usize = 1024 * 1024;

/// Boundary check applied to every decoded node response.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub client_public_key: String,
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttestation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "noonce", alias = "nonce")]
    pub nonce: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: Vec<String>,
    pub report: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub server_public_key: String,
    #[serde(default)]
    pub subnet_public_key: Option<String>,
    #[serde(default)]
    pub network_public_key: Option<String>,
    #[serde(default)]
    pub network_public_key_set: Option<String>,
    #[serde(default)]
    pub hd_root_pubkeys: Vec<String>,
    #[serde(default)]
    pub latest_blockhash: Option<String>,
    #[serde(default)]
    pub node_version: Option<String>,
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub attestation: Option<NodeAttestation>,
}

impl Validate for HandshakeResponse {
    fn validate(&self) -> Result<(), String> {
        let key = hex::decode(self.server_public_key.trim_start_matches("0x"))
            .map_err(|e| format!("serverPublicKey is not hex: {e}"))?;
        if key.is_empty() || key.len() > 33 {
            return Err(format!("serverPublicKey has {} bytes", key.len()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningScheme {
    EcdsaK256Sha256,
    SchnorrK256Sha256,
    EcdsaCaitSithP256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkpSignRequest {
    pub to_sign: Vec<u8>,
    pub signing_scheme: SigningScheme,
    pub pubkey: String,
    pub auth_sig: SessionSignature,
    pub node_set: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

/// One node's share of a threshold signature. The share itself is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureShare {
    #[serde(default = "default_true")]
    pub success: bool,
    pub signature_share: Value,
    #[serde(default)]
    pub share_id: Option<String>,
    #[serde(default)]
    pub big_r: Option<String>,
    pub public_key: String,
    pub sig_type: String,
    #[serde(default)]
    pub data_signed: Option<String>,
    #[serde(default)]
    pub sig_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Validate for SignatureShare {
    fn validate(&self) -> Result<(), String> {
        if !self.success {
            return Err("node reported signing failure".into());
        }
        if self.signature_share.is_null() {
            return Err("missing signatureShare".into());
        }
        if self.public_key.is_empty() || self.sig_type.is_empty() {
            return Err("missing publicKey or sigType".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    pub ciphertext: String,
    pub data_to_encrypt_hash: String,
    pub access_control_conditions: Value,
    pub chain: String,
    pub auth_sig: SessionSignature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionShare {
    #[serde(default = "default_true")]
    pub success: bool,
    pub share_index: u32,
    pub signature_share: Value,
}

impl Validate for DecryptionShare {
    fn validate(&self) -> Result<(), String> {
        if !self.success {
            return Err("node reported decryption failure".into());
        }
        if self.signature_share.is_null() {
            return Err("missing signatureShare".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs_id: Option<String>,
    pub js_params: Value,
    pub auth_sig: SessionSignature,
    pub node_set: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJsResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub signed_data: BTreeMap<String, SignatureShare>,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub logs: String,
}

impl Validate for ExecuteJsResponse {
    fn validate(&self) -> Result<(), String> {
        if !self.success {
            return Err("node reported execution failure".into());
        }
        for (name, share) in &self.signed_data {
            share.validate().map_err(|e| format!("signedData.{name}: {e}"))?;
        }
        Ok(())
    }
}

/// Decrypted node replies carry their result under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData<T> {
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeErrorBody {
    #[serde(default)]
    error_kind: Option<String>,
    #[serde(default)]
    details: Vec<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

/// Best-effort human message from a rejection body.
pub fn rejection_message(status: u16, body: Option<&Value>) -> String {
    let Some(body) = body else {
        return format!("HTTP {status}");
    };
    let error = body.get("error").unwrap_or(body);
    if let Some(text) = error.as_str() {
        return text.to_string();
    }
    if let Ok(parsed) = serde_json::from_value::<NodeErrorBody>(error.clone()) {
        if let Some(message) = parsed.message {
            return match parsed.error_code {
                Some(code) => format!("{code}: {message}"),
                None => message,
            };
        }
        if let Some(kind) = parsed.error_kind {
            return if parsed.details.is_empty() {
                kind
            } else {
                format!("{kind}: {}", parsed.details.join(", "))
            };
        }
    }
    error.to_string()
}
