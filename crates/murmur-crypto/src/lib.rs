//! `murmur` cryptographic capability layer
//!
//! Everything the protocol engine needs from the outside world of
//! arithmetic and primitives, behind a small typed API:
//!
//! ## Crypto primitives
//!
//! - **Group**: 1536-bit MODP group (RFC 3526 group 5), generator 2
//! - **Identity**: DSA (1024-bit p, 160-bit q) long-term keys, caller-supplied parameters
//! - **Hashes**: SHA-1, SHA-256, HMAC-SHA1, HMAC-SHA256 (full and 160-bit truncated)
//! - **Encryption**: AES-128 in counter mode, 8-byte message counter in the top half

pub mod cipher;
pub mod dh;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod identity;

pub use dh::{DhKeyPair, check_group_element};
pub use encoding::{Reader, Writer};
pub use error::CryptoError;
pub use identity::{DsaParameters, Fingerprint, IdentityKeyPair, PublicIdentity, SIGNATURE_LEN};
#[cfg(any(test, feature = "test-utils"))]
pub use identity::test_parameters;

/// Arbitrary-precision unsigned integer used for every group element and exponent.
pub use num_bigint_dig::BigUint;
