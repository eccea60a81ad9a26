//! Protocol error types.

use murmur_crypto::CryptoError;

/// Result type alias using [`OtrError`].
pub type Result<T> = std::result::Result<T, OtrError>;

/// Errors surfaced by the protocol engine.
///
/// None of these tear a conversation down: the state machine has always
/// returned to a well-defined state by the time one is reported.
#[derive(Debug, thiserror::Error)]
pub enum OtrError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Illegal group element in {0}")]
    IllegalGroupElement(&'static str),

    #[error("Commitment does not match the revealed D-H value")]
    CommitmentMismatch,

    #[error("MAC verification failed")]
    BadMac,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Peer echoed our own D-H public value")]
    SelfReflection,

    #[error("No session keys for key ids (sender {sender}, recipient {recipient})")]
    UnknownKeyIds { sender: u32, recipient: u32 },

    #[error("Replayed counter {counter} (last seen {last_seen})")]
    Replay { counter: u64, last_seen: u64 },

    #[error("Send counter exhausted; keys must rotate")]
    CounterExhausted,

    #[error("Received an encrypted message outside an encrypted session")]
    UnreadableMessage,

    #[error("No encrypted session")]
    NotEncrypted,

    #[error("Session was ended by the peer; end it locally before sending")]
    SessionFinished,

    #[error("{0} contains a NUL byte")]
    EmbeddedNul(&'static str),

    #[error("No secret is expected right now")]
    SmpNotAwaitingSecret,

    #[error("Outbound pacer has stopped")]
    PacerClosed,

    #[error("Peer reported: {0}")]
    Peer(String),
}
