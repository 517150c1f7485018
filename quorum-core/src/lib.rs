#![forbid(unsafe_code)]

pub mod auth_sig;
pub mod envelope;
pub mod error;
pub mod recap;
pub mod session;
pub mod siwe;
pub mod storage;

pub use auth_sig::{AuthSig, LocalWallet, WalletSignature, WalletSigner};
pub use envelope::{
    normalize_public_key, open, open_json, seal, seal_json, ClientKeySet, EncryptedEnvelope,
    EncryptionKeyPair, EnvelopePayload, NodeKeys,
};
pub use error::{QuorumError, Result};
pub use recap::{CapabilityObject, ResourceRequest};
pub use session::{
    check_resign, needs_resign, validate_session_signature, ResignReport, SessionConfig,
    SessionKeyPair, SessionManager, SessionSignature, SessionSigs, SessionSigningTemplate,
};
pub use siwe::SiweMessage;
pub use storage::{FileStorage, MemoryStorage, Storage};
