use serde::{Deserialize, Serialize};

use crate::protocol::{DecryptionShare, SignatureShare};

/// Output of combining signature shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedSignature {
    pub signature: String,
    pub public_key: String,
    pub data_signed: String,
    #[serde(default)]
    pub recovery_id: Option<u8>,
}

/// Threshold share combination. Shares are handed over exactly as the nodes
/// returned them, in node order.
pub trait ShareCombiner: Send + Sync {
    fn combine_signature(
        &self,
        shares: &[SignatureShare],
    ) -> std::result::Result<CombinedSignature, String>;

    fn combine_decryption(
        &self,
        network_pub_key: &str,
        identity: &[u8],
        ciphertext: &str,
        shares: &[DecryptionShare],
    ) -> std::result::Result<Vec<u8>, String>;
}
