// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

use crate::error::{QuorumError, Result};

pub const DERIVED_VIA_PERSONAL_SIGN: &str = "web3.eth.personal.sign";

/// A wallet signature over a capability message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSig {
    pub sig: String,
    pub derived_via: String,
    pub signed_message: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo: Option<String>,
}

impl AuthSig {
    pub fn personal_sign(signed_message: String, signature: WalletSignature) -> Self {
        Self {
            sig: signature.sig,
            derived_via: DERIVED_VIA_PERSONAL_SIGN.to_string(),
            signed_message,
            address: signature.address,
            algo: None,
        }
    }

    pub fn verify(&self) -> Result<()> {
        if self.derived_via != DERIVED_VIA_PERSONAL_SIGN {
            return Err(QuorumError::AuthSig(format!(
                "unsupported derivation: {}",
                self.derived_via
            )));
        }
        let recovered = recover_address(&self.signed_message, &self.sig)?;
        if !recovered.eq_ignore_ascii_case(&self.address) {
            return Err(QuorumError::AuthSig(format!(
                "signature recovers to {recovered}, expected {}",
                self.address
            )));
        }
        Ok(())
    }
}

fn eip191_digest(message: &str) -> Keccak256 {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    hasher
}

/// EIP-55 mixed-case hex of an address.
pub fn to_checksum_address(address: &[u8; 20]) -> String {
    let lower = hex::encode(address);
    let hash = Keccak256::digest(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    to_checksum_address(&address)
}

/// Recovers the signer of an EIP-191 personal-sign signature (`r || s || v`, hex).
pub fn recover_address(message: &str, signature_hex: &str) -> Result<String> {
    let bytes = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|e| QuorumError::AuthSig(format!("invalid signature hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(QuorumError::AuthSig(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }

    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|e| QuorumError::AuthSig(format!("invalid signature: {e}")))?;
    let v = if bytes[64] >= 27 { bytes[64] - 27 } else { bytes[64] };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| QuorumError::AuthSig(format!("invalid recovery id: {}", bytes[64])))?;

    let (signature, recovery_id) = match signature.normalize_s() {
        Some(normalized) => (
            normalized,
            RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced()),
        ),
        None => (signature, recovery_id),
    };

    let key = VerifyingKey::recover_from_digest(eip191_digest(message), &signature, recovery_id)
        .map_err(|e| QuorumError::AuthSig(format!("recovery failed: {e}")))?;
    Ok(address_of(&key))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSignature {
    pub sig: String,
    pub address: String,
}

/// The user's long-term key. Only prompted when a capability must be re-signed.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    async fn address(&self) -> Result<String>;
    async fn sign_message(&self, message: &str) -> Result<WalletSignature>;
}

/// In-process secp256k1 personal-sign wallet.
pub struct LocalWallet {
    key: SigningKey,
    address: String,
}

impl LocalWallet {
    pub fn random() -> Self {
        Self::from_key(SigningKey::random(&mut rand::thread_rng()))
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self> {
        let secret = Zeroizing::new(*secret);
        let key = SigningKey::from_slice(secret.as_slice())
            .map_err(|e| QuorumError::Wallet(format!("invalid secret key: {e}")))?;
        Ok(Self::from_key(key))
    }

    fn from_key(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn checksum_address(&self) -> &str {
        &self.address
    }

    pub fn sign(&self, message: &str) -> Result<WalletSignature> {
        let (signature, recovery_id) = self
            .key
            .sign_digest_recoverable(eip191_digest(message))
            .map_err(|e| QuorumError::Wallet(format!("signing failed: {e}")))?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        Ok(WalletSignature {
            sig: format!("0x{}", hex::encode(bytes)),
            address: self.address.clone(),
        })
    }
}

#[async_trait]
impl WalletSigner for LocalWallet {
    async fn address(&self) -> Result<String> {
        Ok(self.address.clone())
    }

    async fn sign_message(&self, message: &str) -> Result<WalletSignature> {
        self.sign(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_address() {
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let wallet = LocalWallet::from_bytes(&secret).unwrap();
        assert_eq!(
            wallet.checksum_address(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_checksum_vector() {
        let raw: [u8; 20] = hex::decode("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed")
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(
            to_checksum_address(&raw),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn test_sign_and_recover() {
        let wallet = LocalWallet::random();
        let signature = wallet.sign("hello quorum").unwrap();
        let recovered = recover_address("hello quorum", &signature.sig).unwrap();
        assert_eq!(recovered, wallet.checksum_address());
        assert_ne!(
            recover_address("hello quorum!", &signature.sig).unwrap(),
            wallet.checksum_address()
        );
    }

    #[test]
    fn test_auth_sig_verify() {
        let wallet = LocalWallet::random();
        let message = "delegate".to_string();
        let signature = wallet.sign(&message).unwrap();
        let mut auth = AuthSig::personal_sign(message, signature);
        auth.verify().unwrap();

        auth.address = auth.address.to_lowercase();
        auth.verify().unwrap();

        auth.signed_message.push('x');
        assert!(auth.verify().is_err());
    }

    #[test]
    fn test_auth_sig_rejects_wrong_derivation() {
        let wallet = LocalWallet::random();
        let signature = wallet.sign("m").unwrap();
        let mut auth = AuthSig::personal_sign("m".into(), signature);
        auth.derived_via = "something.else".into();
        assert!(auth.verify().is_err());
    }

    #[test]
    fn test_malformed_signatures() {
        assert!(recover_address("m", "0x1234").is_err());
        assert!(recover_address("m", "not hex").is_err());
        assert!(recover_address("m", &format!("0x{}", "00".repeat(65))).is_err());
    }

    #[test]
    fn test_auth_sig_wire_names() {
        let auth = AuthSig {
            sig: "0x00".into(),
            derived_via: DERIVED_VIA_PERSONAL_SIGN.into(),
            signed_message: "m".into(),
            address: "0xabc".into(),
            algo: None,
        };
        let value = serde_json::to_value(&auth).unwrap();
        assert_eq!(value["derivedVia"], DERIVED_VIA_PERSONAL_SIGN);
        assert_eq!(value["signedMessage"], "m");
        assert!(value.get("algo").is_none());
    }
}
