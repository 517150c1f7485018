#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_net::protocol::{rejection_message, HandshakeResponse, SignatureShare, Validate};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let _ = rejection_message(400, Some(&value));
    if let Ok(response) = serde_json::from_value::<HandshakeResponse>(value.clone()) {
        let _ = response.validate();
    }
    if let Ok(share) = serde_json::from_value::<SignatureShare>(value) {
        let _ = share.validate();
    }
});
