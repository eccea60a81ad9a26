//! Crypto error types.

/// Errors from cryptographic operations and their encodings.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed encoding: {0}")]
    Malformed(String),

    #[error("Unsupported public key type: {0:#06x}")]
    UnsupportedKeyType(u16),

    #[error("Invalid DSA parameters: {0}")]
    InvalidParameters(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
}
