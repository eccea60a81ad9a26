//! Long-term DSA identities.
//!
//! Each party signs the AKE transcript with a long-lived DSA key. Parameter
//! generation is slow (prime search), so parameters are an explicit value the
//! caller supplies or generates once per identity, optionally in the
//! background via [`DsaParameters::generate_async`]. There is no global cache.

use dsa::{Components, KeySize, SigningKey, VerifyingKey};
use num_bigint_dig::BigUint;
use rand::rngs::OsRng;
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use tracing::debug;

use crate::encoding::{Reader, Writer, to_fixed_be};
use crate::error::CryptoError;
use crate::hash::sha1;

/// Wire type tag of a DSA public key.
pub const DSA_PUBKEY_TYPE: u16 = 0x0000;

/// Byte length of each signature half (`r`, `s`) for a 160-bit `q`.
pub const SIGNATURE_HALF_LEN: usize = 20;

/// Byte length of an encoded signature (`r || s`).
pub const SIGNATURE_LEN: usize = 2 * SIGNATURE_HALF_LEN;

/// DSA domain parameters `(p, q, g)`.
#[derive(Clone)]
pub struct DsaParameters {
    components: Components,
}

impl std::fmt::Debug for DsaParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsaParameters")
            .field("p_bits", &self.components.p().bits())
            .field("q_bits", &self.components.q().bits())
            .finish()
    }
}

impl DsaParameters {
    /// Build parameters from known values.
    pub fn from_components(p: BigUint, q: BigUint, g: BigUint) -> Result<Self, CryptoError> {
        if q.bits() > SIGNATURE_HALF_LEN * 8 {
            return Err(CryptoError::InvalidParameters(format!(
                "q has {} bits, at most {} supported",
                q.bits(),
                SIGNATURE_HALF_LEN * 8
            )));
        }
        let components = Components::from_components(p, q, g)
            .map_err(|e| CryptoError::InvalidParameters(e.to_string()))?;
        Ok(Self { components })
    }

    /// Generate fresh 1024/160-bit parameters. CPU heavy: seconds, not micros.
    #[allow(deprecated)] // 1024/160 is the only size whose signatures fit the wire format
    pub fn generate() -> Self {
        let components = Components::generate(&mut OsRng, KeySize::DSA_1024_160);
        Self { components }
    }

    /// [`generate`](Self::generate) on a blocking worker thread.
    pub async fn generate_async() -> Result<Self, CryptoError> {
        tokio::task::spawn_blocking(Self::generate)
            .await
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))
    }

    pub fn p(&self) -> &BigUint {
        self.components.p()
    }

    pub fn q(&self) -> &BigUint {
        self.components.q()
    }

    pub fn g(&self) -> &BigUint {
        self.components.g()
    }
}

/// A peer's long-term public key. Immutable once built.
#[derive(Clone)]
pub struct PublicIdentity {
    key: VerifyingKey,
    encoded: Vec<u8>,
    fingerprint: Fingerprint,
}

impl PartialEq for PublicIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for PublicIdentity {}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("fingerprint", &self.fingerprint.to_string())
            .finish()
    }
}

impl PublicIdentity {
    fn from_verifying_key(key: VerifyingKey) -> Self {
        let mut w = Writer::new();
        w.short(DSA_PUBKEY_TYPE)
            .mpi(key.components().p())
            .mpi(key.components().q())
            .mpi(key.components().g())
            .mpi(key.y());
        let encoded = w.into_bytes();
        let fingerprint = Fingerprint(sha1(&encoded[2..]));
        Self {
            key,
            encoded,
            fingerprint,
        }
    }

    /// Read a public key (type tag + four MPIs) from `r`.
    pub fn read(r: &mut Reader<'_>) -> Result<Self, CryptoError> {
        let key_type = r.short()?;
        if key_type != DSA_PUBKEY_TYPE {
            return Err(CryptoError::UnsupportedKeyType(key_type));
        }
        let p = r.mpi()?;
        let q = r.mpi()?;
        let g = r.mpi()?;
        let y = r.mpi()?;
        let params = DsaParameters::from_components(p, q, g)?;
        let key = VerifyingKey::from_components(params.components, y)
            .map_err(|e| CryptoError::Malformed(format!("DSA public key: {e}")))?;
        Ok(Self::from_verifying_key(key))
    }

    /// Parse a complete public key encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut r = Reader::new(bytes);
        let identity = Self::read(&mut r)?;
        r.finish()?;
        Ok(identity)
    }

    /// Wire encoding: type tag + MPIs `p, q, g, y`.
    pub fn encode(&self) -> &[u8] {
        &self.encoded
    }

    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Check an `r || s` signature over the pre-hashed `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        if signature.len() != SIGNATURE_LEN {
            return false;
        }
        let r = BigUint::from_bytes_be(&signature[..SIGNATURE_HALF_LEN]);
        let s = BigUint::from_bytes_be(&signature[SIGNATURE_HALF_LEN..]);
        let Ok(signature) = dsa::Signature::from_components(r, s) else {
            return false;
        };
        self.key.verify_prehash(message, &signature).is_ok()
    }
}

/// SHA-1 of the public key encoding without its type tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 20]);

impl Fingerprint {
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    /// Five space-separated groups of eight upper-case hex digits.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = hex::encode_upper(self.0);
        let groups: Vec<&str> = (0..hex.len())
            .step_by(8)
            .map(|i| &hex[i..i + 8])
            .collect();
        f.write_str(&groups.join(" "))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// A long-term DSA keypair. Shared read-only between conversations.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    public: PublicIdentity,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a keypair inside the given parameter set.
    pub fn generate(params: &DsaParameters) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng, params.components.clone());
        let public = PublicIdentity::from_verifying_key(signing_key.verifying_key().clone());
        debug!(fingerprint = %public.fingerprint(), "Generated identity key");
        Self {
            signing_key,
            public,
        }
    }

    /// Generate parameters (unless given) and a keypair on a blocking worker thread.
    pub async fn generate_async(params: Option<DsaParameters>) -> Result<Self, CryptoError> {
        tokio::task::spawn_blocking(move || {
            let params = params.unwrap_or_else(DsaParameters::generate);
            Self::generate(&params)
        })
        .await
        .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))
    }

    /// Reconstruct from parameters and the private exponent `x`.
    pub fn from_secret(params: &DsaParameters, x: BigUint) -> Result<Self, CryptoError> {
        let y = params.g().modpow(&x, params.p());
        let verifying_key = VerifyingKey::from_components(params.components.clone(), y)
            .map_err(|e| CryptoError::InvalidParameters(e.to_string()))?;
        let signing_key = SigningKey::from_components(verifying_key, x)
            .map_err(|e| CryptoError::InvalidParameters(e.to_string()))?;
        let public = PublicIdentity::from_verifying_key(signing_key.verifying_key().clone());
        Ok(Self {
            signing_key,
            public,
        })
    }

    pub const fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub const fn fingerprint(&self) -> &Fingerprint {
        self.public.fingerprint()
    }

    /// Sign the pre-hashed `message`, returning `r || s` (20 bytes each).
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
        let signature: dsa::Signature = self
            .signing_key
            .sign_prehash(message)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        let r = to_fixed_be(signature.r(), SIGNATURE_HALF_LEN)
            .ok_or_else(|| CryptoError::SigningFailed("r exceeds 160 bits".into()))?;
        let s = to_fixed_be(signature.s(), SIGNATURE_HALF_LEN)
            .ok_or_else(|| CryptoError::SigningFailed("s exceeds 160 bits".into()))?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..SIGNATURE_HALF_LEN].copy_from_slice(&r);
        out[SIGNATURE_HALF_LEN..].copy_from_slice(&s);
        Ok(out)
    }
}

/// Fixed 1024/160 parameters so tests never run the prime search.
#[cfg(any(test, feature = "test-utils"))]
pub fn test_parameters() -> Result<DsaParameters, CryptoError> {
    const TEST_P: &[u8] = b"c651cffcb670c9863677e38526664faf6547d5114cc8d735b9624f34d36f6b91377f77042e47be1153800d8907d642b4433b6e1bbb4446ad4a3b78b8a9c9c16a46fb426f7d80d1c48c8a1c27aebe163332a74e3332201c6b7220290d3e4c342a55839f6be39521ef246fc20fab4c67925c1641c76f1bf57a98280dc4889fd025";
    const TEST_Q: &[u8] = b"b3601c5d2d0ad47cb2153f6f0edc77cb31903439";
    const TEST_G: &[u8] = b"108c0a7c6a577fa2c6789bc2a3e5af1f531a79cbb1b0e400590ff9678c2198e52369cf4ed3990d38ca3e27cf12f32d4c4af459d88803bf9e53b4acd99ca48c099f7a993362737a28c61ccffcef1645d7b8b26779607c2fa0fbaedb89a8cb5b847ed1439a18c1ac20bba0bf545be752c0f58890d06bf9886a7facd7038ca3f9db";

    let parse = |hex: &[u8]| {
        BigUint::parse_bytes(hex, 16)
            .ok_or_else(|| CryptoError::InvalidParameters("bad test constant".into()))
    };
    DsaParameters::from_components(parse(TEST_P)?, parse(TEST_Q)?, parse(TEST_G)?)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keypair() -> IdentityKeyPair {
        IdentityKeyPair::generate(&test_parameters().unwrap())
    }

    #[test]
    fn sign_then_verify() {
        let kp = keypair();
        let message = crate::hash::sha256(b"transcript");
        let sig = kp.sign(&message).unwrap();
        assert_eq!(sig.len(), SIGNATURE_LEN);
        assert!(kp.public().verify(&message, &sig));
    }

    #[test]
    fn verify_rejects_other_message() {
        let kp = keypair();
        let sig = kp.sign(&crate::hash::sha256(b"one")).unwrap();
        assert!(!kp.public().verify(&crate::hash::sha256(b"two"), &sig));
    }

    #[test]
    fn verify_rejects_flipped_bit() {
        let kp = keypair();
        let message = crate::hash::sha256(b"transcript");
        let mut sig = kp.sign(&message).unwrap();
        sig[5] ^= 0x10;
        assert!(!kp.public().verify(&message, &sig));
    }

    #[test]
    fn verify_rejects_wrong_length() {
        let kp = keypair();
        assert!(!kp.public().verify(b"m", &[1u8; 39]));
    }

    #[test]
    fn verify_rejects_other_key() {
        let params = test_parameters().unwrap();
        let a = IdentityKeyPair::generate(&params);
        let b = IdentityKeyPair::generate(&params);
        let message = crate::hash::sha256(b"transcript");
        let sig = a.sign(&message).unwrap();
        assert!(!b.public().verify(&message, &sig));
    }

    #[test]
    fn public_key_encoding_round_trips() {
        let kp = keypair();
        let decoded = PublicIdentity::decode(kp.public().encode()).unwrap();
        assert_eq!(&decoded, kp.public());
        assert_eq!(decoded.fingerprint(), kp.fingerprint());
    }

    #[test]
    fn decode_rejects_unknown_key_type() {
        let kp = keypair();
        let mut bytes = kp.public().encode().to_vec();
        bytes[1] = 0x01;
        assert!(matches!(
            PublicIdentity::decode(&bytes),
            Err(CryptoError::UnsupportedKeyType(1))
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let kp = keypair();
        let bytes = kp.public().encode();
        assert!(PublicIdentity::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn fingerprint_skips_type_tag() {
        let kp = keypair();
        let expected = sha1(&kp.public().encode()[2..]);
        assert_eq!(kp.fingerprint().as_bytes(), &expected);
    }

    #[test]
    fn fingerprint_display_is_grouped_hex() {
        let fp = Fingerprint([0xab; 20]);
        let shown = fp.to_string();
        assert_eq!(shown.split(' ').count(), 5);
        assert!(shown.split(' ').all(|g| g == "ABABABAB"));
    }

    #[test]
    fn from_secret_reproduces_public_key() {
        let params = test_parameters().unwrap();
        let x = BigUint::from(0x1234_5678_9abc_u64);
        let a = IdentityKeyPair::from_secret(&params, x.clone()).unwrap();
        let b = IdentityKeyPair::from_secret(&params, x).unwrap();
        assert_eq!(a.public(), b.public());
    }

    #[test]
    fn parameters_reject_oversized_q() {
        let params = test_parameters().unwrap();
        let result = DsaParameters::from_components(
            params.p().clone(),
            params.p().clone(),
            params.g().clone(),
        );
        assert!(matches!(result, Err(CryptoError::InvalidParameters(_))));
    }

    #[test]
    fn debug_impl_redacts_secret() {
        let kp = keypair();
        let out = format!("{kp:?}");
        assert!(out.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn async_generation_with_supplied_parameters() {
        let params = test_parameters().unwrap();
        let kp = IdentityKeyPair::generate_async(Some(params)).await.unwrap();
        let message = crate::hash::sha256(b"m");
        assert!(kp.public().verify(&message, &kp.sign(&message).unwrap()));
    }
}
