// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::{QuorumError, Result};

pub const ENVELOPE_VERSION: u8 = 1;
pub const KEY_LEN: usize = 32;
pub const RANDOM_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const AAD_LEN: usize = 1 + RANDOM_LEN + 8 + KEY_LEN * 2;

const PADDING_LEN: usize = 16;
const PADDED_MIN_LEN: usize = 83;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub verification_key: String,
    pub ciphertext_and_tag: String,
    pub random: String,
    pub created_at: String,
}

/// Wire form: `{"version": "1", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version", content = "payload")]
pub enum EncryptedEnvelope {
    #[serde(rename = "1")]
    V1(EnvelopePayload),
}

impl EncryptedEnvelope {
    pub fn payload(&self) -> &EnvelopePayload {
        match self {
            Self::V1(payload) => payload,
        }
    }

    pub fn verification_key(&self) -> &str {
        &self.payload().verification_key
    }

    /// Returns `None` when `value` is not shaped like an envelope.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Coerces a public key of any length into the 32-byte form the box expects.
/// Short keys are zero-padded at the front, long keys keep their first 32 bytes.
pub fn normalize_public_key(key: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    if key.len() >= KEY_LEN {
        out.copy_from_slice(&key[..KEY_LEN]);
    } else {
        out[KEY_LEN - key.len()..].copy_from_slice(key);
    }
    out
}

#[derive(Clone)]
pub struct EncryptionKeyPair {
    secret: SecretKey,
    public: [u8; KEY_LEN],
}

impl EncryptionKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self::from_secret(SecretKey::from(bytes))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let public = *secret.public_key().as_bytes();
        Self { secret, public }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public)
    }
}

impl std::fmt::Debug for EncryptionKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

fn build_aad(
    random: &[u8; RANDOM_LEN],
    created_at_secs: u64,
    their_public: &[u8; KEY_LEN],
    my_public: &[u8; KEY_LEN],
) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[0] = ENVELOPE_VERSION;
    aad[1..17].copy_from_slice(random);
    aad[17..25].copy_from_slice(&created_at_secs.to_be_bytes());
    aad[25..57].copy_from_slice(their_public);
    aad[57..89].copy_from_slice(my_public);
    aad
}

fn derive_nonce(aad: &[u8; AAD_LEN]) -> [u8; NONCE_LEN] {
    let digest = Sha512::digest(aad);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

fn strip_padding(bytes: &[u8]) -> Result<&[u8]> {
    let zero_prefix = bytes.len() >= PADDING_LEN && bytes[..PADDING_LEN].iter().all(|b| *b == 0);
    if bytes.len() >= PADDED_MIN_LEN {
        if !zero_prefix {
            return Err(QuorumError::Decryption("malformed ciphertext padding".into()));
        }
        return Ok(&bytes[PADDING_LEN..]);
    }
    // Short payloads are accepted in both forms.
    if zero_prefix && bytes.len() >= PADDING_LEN + TAG_LEN {
        return Ok(&bytes[PADDING_LEN..]);
    }
    Ok(bytes)
}

fn seconds_of(created_at: &DateTime<Utc>) -> Result<u64> {
    u64::try_from(created_at.timestamp())
        .map_err(|_| QuorumError::Decryption("created_at predates the epoch".into()))
}

pub fn seal(
    my_secret: &SecretKey,
    their_public: &[u8],
    plaintext: &[u8],
) -> Result<EncryptedEnvelope> {
    let mut random = [0u8; RANDOM_LEN];
    rand::thread_rng().fill_bytes(&mut random);
    seal_with(my_secret, their_public, plaintext, random, Utc::now())
}

pub fn seal_with(
    my_secret: &SecretKey,
    their_public: &[u8],
    plaintext: &[u8],
    random: [u8; RANDOM_LEN],
    created_at: DateTime<Utc>,
) -> Result<EncryptedEnvelope> {
    let their_public = normalize_public_key(their_public);
    let my_public = *my_secret.public_key().as_bytes();
    let created_at_secs = seconds_of(&created_at)?;

    let aad = build_aad(&random, created_at_secs, &their_public, &my_public);
    let nonce = derive_nonce(&aad);

    let salsa_box = SalsaBox::new(&PublicKey::from(their_public), my_secret);
    let sealed = salsa_box
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| QuorumError::InvalidKey("box encryption failed".into()))?;

    let mut padded = Vec::with_capacity(PADDING_LEN + sealed.len());
    padded.extend_from_slice(&[0u8; PADDING_LEN]);
    padded.extend_from_slice(&sealed);

    Ok(EncryptedEnvelope::V1(EnvelopePayload {
        verification_key: hex::encode(my_public),
        ciphertext_and_tag: hex::encode(padded),
        random: hex::encode(random),
        created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Opens an envelope addressed to `my_secret`. The sender's AAD is rebuilt with
/// our own key in the "their" slot and the sender's key in the "my" slot.
pub fn open(my_secret: &SecretKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
    let payload = envelope.payload();

    let sender_bytes = hex::decode(&payload.verification_key)
        .map_err(|e| QuorumError::Decryption(format!("invalid verification key: {e}")))?;
    let sender_public = normalize_public_key(&sender_bytes);

    let random: [u8; RANDOM_LEN] = hex::decode(&payload.random)
        .map_err(|e| QuorumError::Decryption(format!("invalid random: {e}")))?
        .try_into()
        .map_err(|_| QuorumError::Decryption("random must be 16 bytes".into()))?;

    let created_at = DateTime::parse_from_rfc3339(&payload.created_at)
        .map_err(|e| QuorumError::Decryption(format!("invalid created_at: {e}")))?
        .with_timezone(&Utc);
    let created_at_secs = seconds_of(&created_at)?;

    let ciphertext = hex::decode(&payload.ciphertext_and_tag)
        .map_err(|e| QuorumError::Decryption(format!("invalid ciphertext: {e}")))?;
    let ciphertext = strip_padding(&ciphertext)?;

    let my_public = *my_secret.public_key().as_bytes();
    let aad = build_aad(&random, created_at_secs, &my_public, &sender_public);
    let nonce = derive_nonce(&aad);

    let salsa_box = SalsaBox::new(&PublicKey::from(sender_public), my_secret);
    salsa_box
        .decrypt(GenericArray::from_slice(&nonce), ciphertext)
        .map_err(|_| QuorumError::Decryption("authentication failed".into()))
}

pub fn seal_json<T: Serialize>(
    my_secret: &SecretKey,
    their_public: &[u8],
    value: &T,
) -> Result<EncryptedEnvelope> {
    let plaintext = serde_json::to_vec(value)?;
    seal(my_secret, their_public, &plaintext)
}

pub fn open_json<T: DeserializeOwned>(
    my_secret: &SecretKey,
    envelope: &EncryptedEnvelope,
) -> Result<T> {
    let plaintext = open(my_secret, envelope)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| QuorumError::Decryption(format!("decrypted payload is not valid JSON: {e}")))
}

#[derive(Debug, Clone)]
pub struct NodeKeys {
    pub client: EncryptionKeyPair,
    pub node_public: [u8; KEY_LEN],
}

impl NodeKeys {
    pub fn new(client: EncryptionKeyPair, node_public: &[u8]) -> Self {
        Self {
            client,
            node_public: normalize_public_key(node_public),
        }
    }

    pub fn node_public_hex(&self) -> String {
        hex::encode(self.node_public)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        seal(self.client.secret(), &self.node_public, plaintext)
    }

    pub fn seal_json<T: Serialize>(&self, value: &T) -> Result<EncryptedEnvelope> {
        seal_json(self.client.secret(), &self.node_public, value)
    }

    /// Opens a reply, refusing envelopes not produced by this node's key.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let sender = hex::decode(envelope.verification_key())
            .map(|bytes| normalize_public_key(&bytes))
            .map_err(|e| QuorumError::Decryption(format!("invalid verification key: {e}")))?;
        if sender != self.node_public {
            return Err(QuorumError::Decryption(
                "envelope was not sealed by the expected node".into(),
            ));
        }
        open(self.client.secret(), envelope)
    }
}

/// Per-node key material: our secret for talking to a node plus that node's public key.
#[derive(Debug, Clone, Default)]
pub struct ClientKeySet {
    keys: BTreeMap<String, NodeKeys>,
}

impl ClientKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>, keys: NodeKeys) {
        self.keys.insert(url.into(), keys);
    }

    pub fn get(&self, url: &str) -> Option<&NodeKeys> {
        self.keys.get(url)
    }

    pub fn find_by_verification_key(&self, verification_key: &str) -> Option<(&str, &NodeKeys)> {
        let wanted = hex::decode(verification_key.trim_start_matches("0x"))
            .ok()
            .map(|bytes| normalize_public_key(&bytes))?;
        self.keys
            .iter()
            .find(|(_, keys)| keys.node_public == wanted)
            .map(|(url, keys)| (url.as_str(), keys))
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_seal_open_cross_party() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();

        let envelope = seal(client.secret(), node.public_key(), b"sign this").unwrap();
        assert_eq!(envelope.verification_key(), client.public_key_hex());

        let opened = open(node.secret(), &envelope).unwrap();
        assert_eq!(opened, b"sign this");

        let reply = seal(node.secret(), client.public_key(), b"share").unwrap();
        assert_eq!(open(client.secret(), &reply).unwrap(), b"share");
    }

    #[test]
    fn test_sender_cannot_open_own_envelope() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let envelope = seal(client.secret(), node.public_key(), b"payload").unwrap();
        assert!(open(client.secret(), &envelope).is_err());
    }

    #[test]
    fn test_aad_layout() {
        let random = [7u8; RANDOM_LEN];
        let their = [1u8; KEY_LEN];
        let mine = [2u8; KEY_LEN];
        let aad = build_aad(&random, 0x0102, &their, &mine);
        assert_eq!(aad.len(), 89);
        assert_eq!(aad[0], 1);
        assert_eq!(&aad[1..17], &random);
        assert_eq!(&aad[17..25], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&aad[25..57], &their);
        assert_eq!(&aad[57..89], &mine);
    }

    #[test]
    fn test_ciphertext_carries_zero_prefix() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let envelope = seal(client.secret(), node.public_key(), &[0xAB; 64]).unwrap();
        let bytes = hex::decode(&envelope.payload().ciphertext_and_tag).unwrap();
        assert_eq!(bytes.len(), PADDING_LEN + TAG_LEN + 64);
        assert!(bytes[..PADDING_LEN].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_nonzero_padding_rejected() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let envelope = seal(client.secret(), node.public_key(), &[1u8; 90]).unwrap();
        let EncryptedEnvelope::V1(mut payload) = envelope;
        let mut bytes = hex::decode(&payload.ciphertext_and_tag).unwrap();
        bytes[3] = 0xFF;
        payload.ciphertext_and_tag = hex::encode(bytes);
        assert!(open(node.secret(), &EncryptedEnvelope::V1(payload)).is_err());
    }

    #[test]
    fn test_short_plaintexts_round_trip() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        for len in [0usize, 1, 16, 34, 35, 50] {
            let msg = vec![0x5A; len];
            let envelope = seal(client.secret(), node.public_key(), &msg).unwrap();
            assert_eq!(open(node.secret(), &envelope).unwrap(), msg, "len {len}");
        }
    }

    #[test]
    fn test_unpadded_ciphertext_accepted() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let msg = vec![0x11; 20];
        let envelope = seal(client.secret(), node.public_key(), &msg).unwrap();
        let EncryptedEnvelope::V1(mut payload) = envelope;
        let bytes = hex::decode(&payload.ciphertext_and_tag).unwrap();
        payload.ciphertext_and_tag = hex::encode(&bytes[PADDING_LEN..]);
        assert_eq!(
            open(node.secret(), &EncryptedEnvelope::V1(payload)).unwrap(),
            msg
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let envelope = seal(client.secret(), node.public_key(), &[9u8; 100]).unwrap();
        let EncryptedEnvelope::V1(mut payload) = envelope;
        let mut bytes = hex::decode(&payload.ciphertext_and_tag).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        payload.ciphertext_and_tag = hex::encode(bytes);
        let err = open(node.secret(), &EncryptedEnvelope::V1(payload)).unwrap_err();
        assert!(matches!(err, QuorumError::Decryption(_)));
    }

    #[test]
    fn test_tampered_aad_fields_fail() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let envelope = seal_with(
            client.secret(),
            node.public_key(),
            b"bound to aad",
            [3u8; RANDOM_LEN],
            fixed_time(),
        )
        .unwrap();

        let EncryptedEnvelope::V1(original) = envelope;

        let mut random_flip = original.clone();
        let mut random = hex::decode(&random_flip.random).unwrap();
        random[0] ^= 0x80;
        random_flip.random = hex::encode(random);
        assert!(open(node.secret(), &EncryptedEnvelope::V1(random_flip)).is_err());

        let mut time_shift = original.clone();
        time_shift.created_at = (fixed_time() + chrono::Duration::seconds(1))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        assert!(open(node.secret(), &EncryptedEnvelope::V1(time_shift)).is_err());

        let mut key_swap = original.clone();
        key_swap.verification_key = EncryptionKeyPair::generate().public_key_hex();
        assert!(open(node.secret(), &EncryptedEnvelope::V1(key_swap)).is_err());

        assert_eq!(
            open(node.secret(), &EncryptedEnvelope::V1(original)).unwrap(),
            b"bound to aad"
        );
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let other = EncryptionKeyPair::generate();
        let envelope = seal(client.secret(), node.public_key(), b"secret").unwrap();
        assert!(open(other.secret(), &envelope).is_err());
    }

    #[test]
    fn test_malformed_fields_fail() {
        let node = EncryptionKeyPair::generate();
        let envelope = EncryptedEnvelope::V1(EnvelopePayload {
            verification_key: "zz".into(),
            ciphertext_and_tag: "00".into(),
            random: "00".into(),
            created_at: "yesterday".into(),
        });
        assert!(open(node.secret(), &envelope).is_err());
    }

    #[test]
    fn test_normalize_public_key() {
        let full = [0x42u8; 32];
        assert_eq!(normalize_public_key(&full), full);

        let short = [0x42u8; 31];
        let normalized = normalize_public_key(&short);
        assert_eq!(normalized[0], 0);
        assert_eq!(&normalized[1..], &short);

        let long = [0x42u8; 40];
        assert_eq!(normalize_public_key(&long), [0x42u8; 32]);
    }

    #[test]
    fn test_truncated_key_round_trip() {
        let client = EncryptionKeyPair::generate();
        let node = loop {
            let candidate = EncryptionKeyPair::generate();
            if candidate.public_key()[0] == 0 {
                break candidate;
            }
        };
        let truncated = &node.public_key()[1..];
        let envelope = seal(client.secret(), truncated, b"leading zero").unwrap();
        assert_eq!(open(node.secret(), &envelope).unwrap(), b"leading zero");
    }

    #[test]
    fn test_wire_format() {
        let client = EncryptionKeyPair::from_secret_bytes([1u8; 32]);
        let node = EncryptionKeyPair::from_secret_bytes([2u8; 32]);
        let envelope = seal_with(
            client.secret(),
            node.public_key(),
            b"{}",
            [0u8; RANDOM_LEN],
            fixed_time(),
        )
        .unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["version"], "1");
        assert_eq!(value["payload"]["created_at"], "2026-03-01T12:00:00.000Z");
        assert_eq!(value["payload"]["random"], "0".repeat(32));
        assert_eq!(EncryptedEnvelope::from_value(&value), Some(envelope));
        assert!(EncryptedEnvelope::from_value(&serde_json::json!({"ok": true})).is_none());
    }

    #[test]
    fn test_node_keys_reject_foreign_sender() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let impostor = EncryptionKeyPair::generate();
        let keys = NodeKeys::new(client.clone(), node.public_key());

        let reply = seal(impostor.secret(), client.public_key(), b"forged").unwrap();
        assert!(keys.open(&reply).is_err());

        let reply = seal(node.secret(), client.public_key(), b"genuine").unwrap();
        assert_eq!(keys.open(&reply).unwrap(), b"genuine");
    }

    #[test]
    fn test_keyset_lookup_by_verification_key() {
        let node_a = EncryptionKeyPair::generate();
        let node_b = EncryptionKeyPair::generate();
        let mut set = ClientKeySet::new();
        set.insert(
            "https://a:443",
            NodeKeys::new(EncryptionKeyPair::generate(), node_a.public_key()),
        );
        set.insert(
            "https://b:443",
            NodeKeys::new(EncryptionKeyPair::generate(), node_b.public_key()),
        );

        let (url, _) = set
            .find_by_verification_key(&node_b.public_key_hex())
            .unwrap();
        assert_eq!(url, "https://b:443");
        assert!(set.find_by_verification_key("abcd").is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_json_round_trip() {
        let client = EncryptionKeyPair::generate();
        let node = EncryptionKeyPair::generate();
        let envelope = seal_json(
            client.secret(),
            node.public_key(),
            &serde_json::json!({"toSign": [1, 2, 3]}),
        )
        .unwrap();
        let value: serde_json::Value = open_json(node.secret(), &envelope).unwrap();
        assert_eq!(value["toSign"][2], 3);
    }
}
