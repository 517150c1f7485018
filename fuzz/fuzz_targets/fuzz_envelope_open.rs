#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_core::{open, EncryptedEnvelope, EncryptionKeyPair};

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = serde_json::from_slice::<EncryptedEnvelope>(data) else {
        return;
    };
    // TEST ONLY: fixed key so crashes reproduce
    let keys = EncryptionKeyPair::from_secret_bytes([7u8; 32]);
    let _ = open(keys.secret(), &envelope);
});
