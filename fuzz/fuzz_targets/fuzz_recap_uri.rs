#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_core::CapabilityObject;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(capability) = CapabilityObject::from_uri(s) {
            let uri = capability.to_uri().unwrap();
            assert_eq!(CapabilityObject::from_uri(&uri).unwrap(), capability);
        }
    }
});
