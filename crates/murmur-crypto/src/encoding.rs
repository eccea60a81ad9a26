//! Byte-level encodings shared by keys and protocol messages.
//!
//! All integers are big-endian. `DATA` is a 4-byte length followed by raw
//! bytes; `MPI` is a 4-byte length followed by the minimal magnitude of an
//! unsigned integer (zero has length 0).

use num_bigint_dig::BigUint;

use crate::error::CryptoError;

/// Minimal big-endian magnitude of `n` (empty for zero).
pub fn mpi_magnitude(n: &BigUint) -> Vec<u8> {
    let mut bytes = n.to_bytes_be();
    let leading = bytes.iter().take_while(|b| **b == 0).count();
    bytes.drain(..leading);
    bytes
}

/// `n` as a length-prefixed MPI.
pub fn encode_mpi(n: &BigUint) -> Vec<u8> {
    let mut w = Writer::new();
    w.mpi(n);
    w.into_bytes()
}

/// Left-pad `n` with zeros to exactly `len` bytes. Returns `None` if it does not fit.
pub fn to_fixed_be(n: &BigUint, len: usize) -> Option<Vec<u8>> {
    let magnitude = mpi_magnitude(n);
    if magnitude.len() > len {
        return None;
    }
    let mut out = vec![0u8; len - magnitude.len()];
    out.extend_from_slice(&magnitude);
    Some(out)
}

/// Append-only encoder.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn byte(&mut self, b: u8) -> &mut Self {
        self.buf.push(b);
        self
    }

    pub fn short(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn int(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed opaque bytes.
    pub fn data(&mut self, bytes: &[u8]) -> &mut Self {
        self.int(len_u32(bytes.len()));
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed big integer.
    pub fn mpi(&mut self, n: &BigUint) -> &mut Self {
        let magnitude = mpi_magnitude(n);
        self.data(&magnitude)
    }

    /// Raw bytes with no length prefix (fixed-size fields).
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub const fn len(&self) -> usize {
        self.buf.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[allow(clippy::cast_possible_truncation)] // protocol lengths are 32-bit by definition
const fn len_u32(len: usize) -> u32 {
    len as u32
}

/// Cursor over an encoded buffer. Every read is bounds-checked.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub const fn position(&self) -> usize {
        self.pos
    }

    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take exactly `n` raw bytes.
    pub fn raw(&mut self, n: usize) -> Result<&'a [u8], CryptoError> {
        if self.remaining() < n {
            return Err(CryptoError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take exactly `N` raw bytes as an array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.raw(N)?);
        Ok(out)
    }

    pub fn byte(&mut self) -> Result<u8, CryptoError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn short(&mut self) -> Result<u16, CryptoError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn int(&mut self) -> Result<u32, CryptoError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Length-prefixed opaque bytes.
    pub fn data(&mut self) -> Result<&'a [u8], CryptoError> {
        let len = self.int()? as usize;
        self.raw(len)
    }

    /// Length-prefixed big integer.
    pub fn mpi(&mut self) -> Result<BigUint, CryptoError> {
        Ok(BigUint::from_bytes_be(self.data()?))
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Fail unless the whole buffer was consumed.
    pub fn finish(&self) -> Result<(), CryptoError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CryptoError::Malformed(format!(
                "{} trailing bytes",
                self.remaining()
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_encodes_as_empty_mpi() {
        assert_eq!(encode_mpi(&BigUint::from(0u32)), vec![0, 0, 0, 0]);
    }

    #[test]
    fn mpi_drops_leading_zero_bytes() {
        let n = BigUint::from(0x01_02u32);
        assert_eq!(encode_mpi(&n), vec![0, 0, 0, 2, 0x01, 0x02]);
    }

    #[test]
    fn reader_parses_what_writer_wrote() {
        let n = BigUint::from(0xdead_beef_u32);
        let mut w = Writer::new();
        w.byte(7).short(0x0302).int(42).data(b"abc").mpi(&n).raw(&[9, 9]);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.byte().unwrap(), 7);
        assert_eq!(r.short().unwrap(), 0x0302);
        assert_eq!(r.int().unwrap(), 42);
        assert_eq!(r.data().unwrap(), b"abc");
        assert_eq!(r.mpi().unwrap(), n);
        assert_eq!(r.raw(2).unwrap(), &[9, 9]);
        r.finish().unwrap();
    }

    #[test]
    fn truncated_data_is_rejected() {
        // Declares 10 bytes, carries 3
        let bytes = [0, 0, 0, 10, 1, 2, 3];
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.data(),
            Err(CryptoError::Truncated {
                needed: 10,
                available: 3
            })
        ));
    }

    #[test]
    fn finish_reports_trailing_bytes() {
        let bytes = [0, 1, 2];
        let mut r = Reader::new(&bytes);
        r.byte().unwrap();
        assert!(matches!(r.finish(), Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn fixed_width_padding() {
        let n = BigUint::from(5u32);
        assert_eq!(to_fixed_be(&n, 3).unwrap(), vec![0, 0, 5]);
        let big = BigUint::from(0x0100_0000u32);
        assert!(to_fixed_be(&big, 3).is_none());
    }
}
