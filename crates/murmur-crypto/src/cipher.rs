//! AES-128 in counter mode.
//!
//! The 16-byte counter block is the 8-byte message counter followed by eight
//! zero bytes that count up per block. The AKE uses an all-zero counter.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::CryptoError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES key length in bytes.
pub const AES_KEY_LEN: usize = 16;

/// Encrypt or decrypt `data` in place.
pub fn aes128_ctr_in_place(
    key: &[u8],
    top_half: [u8; 8],
    data: &mut [u8],
) -> Result<(), CryptoError> {
    if key.len() != AES_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LEN,
            actual: key.len(),
        });
    }
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&top_half);
    let mut cipher = Aes128Ctr::new_from_slices(key, &iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: AES_KEY_LEN,
            actual: key.len(),
        }
    })?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Encrypt or decrypt `data`, returning a new buffer.
pub fn aes128_ctr(key: &[u8], top_half: [u8; 8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = data.to_vec();
    aes128_ctr_in_place(key, top_half, &mut out)?;
    Ok(out)
}
