#![forbid(unsafe_code)]

mod client;
mod combine;
mod config;
mod error;
mod fanout;
mod handshake;
pub mod protocol;
mod transport;

pub use client::{
    spawn_epoch_listener, DecryptOutcome, DecryptParams, EpochChanged, ExecuteJsOutcome,
    ExecuteJsParams, NetworkClient, NetworkState, PkpSignParams, SigningOutcome,
    DECRYPTION_IDENTITY_PREFIX,
};
pub use combine::{CombinedSignature, ShareCombiner};
pub use config::{ClientConfig, LogLevel, MAX_EXPIRATION_SECS};
pub use error::{
    FailureReason, NetError, NetworkError, NetworkErrorKind, NodeFailure, Result,
};
pub use fanout::{Completion, FanOut, FanOutOutcome, FnCodec, NodeCall, NodeCodec};
pub use handshake::{
    connect_minimum, default_threshold, generate_challenge, most_common, resolve, AttestationVerifier,
    EpochState, HandshakeManager, HandshakeOutcome, HandshakeRecord, ResolvedConfig,
    EPOCH_GRACE_SECS, MIN_THRESHOLD,
};
pub use transport::{
    generate_request_id, HttpTransport, NodeReply, NodeRequest, Transport,
    CLIENT_TYPE_HEADER, CLIENT_VERSION_HEADER, DEFAULT_REQUEST_TIMEOUT, REQUEST_ID_HEADER,
    REQUEST_ID_PREFIX,
};
