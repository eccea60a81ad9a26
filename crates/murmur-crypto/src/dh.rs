//! Diffie-Hellman arithmetic over the 1536-bit MODP group.
//!
//! The same group carries the AKE, the per-message key ratchet and the
//! zero-knowledge proofs of the secret-verification protocol, so the
//! modular helpers used by the latter live here too.

use std::sync::LazyLock;

use num_bigint_dig::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;

/// Bit length of ephemeral Diffie-Hellman private exponents.
pub const DH_PRIVATE_BITS: usize = 320;

/// RFC 3526 group 5 prime, big-endian.
const MODULUS: [u8; 192] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe4, 0x5b, 0x3d,
    0xc2, 0x00, 0x7c, 0xb8, 0xa1, 0x63, 0xbf, 0x05, 0x98, 0xda, 0x48, 0x36,
    0x1c, 0x55, 0xd3, 0x9a, 0x69, 0x16, 0x3f, 0xa8, 0xfd, 0x24, 0xcf, 0x5f,
    0x83, 0x65, 0x5d, 0x23, 0xdc, 0xa3, 0xad, 0x96, 0x1c, 0x62, 0xf3, 0x56,
    0x20, 0x85, 0x52, 0xbb, 0x9e, 0xd5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6d,
    0x67, 0x0c, 0x35, 0x4e, 0x4a, 0xbc, 0x98, 0x04, 0xf1, 0x74, 0x6c, 0x08,
    0xca, 0x23, 0x73, 0x27, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

struct Group {
    p: BigUint,
    p_minus_2: BigUint,
    q: BigUint,
    g: BigUint,
    two: BigUint,
}

static GROUP: LazyLock<Group> = LazyLock::new(|| {
    let p = BigUint::from_bytes_be(&MODULUS);
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);
    let p_minus_2 = &p - &two;
    let q = (&p - &one) / &two;
    Group {
        p,
        p_minus_2,
        q,
        g: two.clone(),
        two,
    }
});

/// The group prime `p`.
pub fn modulus() -> &'static BigUint {
    &GROUP.p
}

/// The prime order `q = (p-1)/2` of the subgroup generated by `g`.
pub fn order() -> &'static BigUint {
    &GROUP.q
}

/// The generator `g = 2`.
pub fn generator() -> &'static BigUint {
    &GROUP.g
}

/// Whether `x` is a usable group element, i.e. `2 <= x <= p-2`.
pub fn check_group_element(x: &BigUint) -> bool {
    *x >= GROUP.two && *x <= GROUP.p_minus_2
}

/// Whether `x` is a usable proof exponent, i.e. `1 <= x < q`.
pub fn check_exponent(x: &BigUint) -> bool {
    *x >= BigUint::from(1u32) && *x < GROUP.q
}

/// Uniformly random integer with at most `bits` bits.
pub fn random_exponent(bits: usize) -> BigUint {
    let mut bytes = vec![0u8; bits.div_ceil(8)];
    OsRng.fill_bytes(&mut bytes);
    let excess = bytes.len() * 8 - bits;
    if excess > 0
        && let Some(first) = bytes.first_mut()
    {
        *first &= 0xff >> excess;
    }
    BigUint::from_bytes_be(&bytes)
}

/// `base^exp mod p`.
pub fn mod_pow(base: &BigUint, exp: &BigUint) -> BigUint {
    base.modpow(exp, &GROUP.p)
}

/// `g^exp mod p`.
pub fn g_pow(exp: &BigUint) -> BigUint {
    GROUP.g.modpow(exp, &GROUP.p)
}

/// `a * b mod p`.
pub fn mul_mod_p(a: &BigUint, b: &BigUint) -> BigUint {
    (a * b) % &GROUP.p
}

/// `a / b mod p`, via the inverse `b^(p-2)`.
pub fn divide_mod_p(a: &BigUint, b: &BigUint) -> BigUint {
    let inverse = b.modpow(&GROUP.p_minus_2, &GROUP.p);
    mul_mod_p(a, &inverse)
}

/// `a * b mod q`.
pub fn mul_mod_q(a: &BigUint, b: &BigUint) -> BigUint {
    (a * b) % &GROUP.q
}

/// `a - b mod q`, never negative.
pub fn sub_mod_q(a: &BigUint, b: &BigUint) -> BigUint {
    let q = &GROUP.q;
    ((a % q) + q - (b % q)) % q
}

/// An ephemeral Diffie-Hellman keypair.
#[derive(Clone)]
pub struct DhKeyPair {
    private: BigUint,
    public: BigUint,
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public.to_bytes_be()))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

impl DhKeyPair {
    /// Generate a fresh keypair with a 320-bit private exponent.
    pub fn generate() -> Self {
        Self::from_private(random_exponent(DH_PRIVATE_BITS))
    }

    /// Rebuild a keypair from its private exponent.
    pub fn from_private(private: BigUint) -> Self {
        let public = g_pow(&private);
        Self { private, public }
    }

    /// Our public value `g^x mod p`.
    pub const fn public(&self) -> &BigUint {
        &self.public
    }

    /// `their^x mod p`. The caller validates `their` first.
    pub fn shared_secret(&self, their: &BigUint) -> BigUint {
        mod_pow(their, &self.private)
    }
}
