//! Type-length-value records appended to data-message plaintext.
//!
//! The decrypted payload is the user's text, optionally followed by a NUL
//! byte and a run of `type(SHORT) length(SHORT) value` records.

use tracing::trace;

use crate::error::{OtrError, Result};

pub const TLV_PADDING: u16 = 0;
pub const TLV_DISCONNECTED: u16 = 1;
pub const TLV_SMP1: u16 = 2;
pub const TLV_SMP2: u16 = 3;
pub const TLV_SMP3: u16 = 4;
pub const TLV_SMP4: u16 = 5;
pub const TLV_SMP_ABORT: u16 = 6;
pub const TLV_SMP1Q: u16 = 7;
pub const TLV_EXTRA_SYMKEY: u16 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u16,
    pub value: Vec<u8>,
}

impl Tlv {
    pub const fn new(kind: u16, value: Vec<u8>) -> Self {
        Self { kind, value }
    }

    pub const fn empty(kind: u16) -> Self {
        Self {
            kind,
            value: Vec::new(),
        }
    }
}

/// Build the plaintext of a data message.
///
/// `text` may not contain NUL: the receiver would read what follows it as records.
pub fn encode_payload(text: &str, tlvs: &[Tlv]) -> Result<Vec<u8>> {
    if text.contains('\0') {
        return Err(OtrError::EmbeddedNul("Message text"));
    }
    let mut out = text.as_bytes().to_vec();
    if tlvs.is_empty() {
        return Ok(out);
    }
    out.push(0);
    for tlv in tlvs {
        let len = u16::try_from(tlv.value.len()).map_err(|_| {
            OtrError::Malformed(format!(
                "TLV type {} value of {} bytes exceeds 65535",
                tlv.kind,
                tlv.value.len()
            ))
        })?;
        out.extend_from_slice(&tlv.kind.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&tlv.value);
    }
    Ok(out)
}

/// Split a decrypted payload into text and records.
///
/// A record whose declared length runs past the end is dropped together
/// with anything after it.
pub fn decode_payload(payload: &[u8]) -> (String, Vec<Tlv>) {
    let (text, mut rest) = match payload.iter().position(|b| *b == 0) {
        Some(nul) => (&payload[..nul], &payload[nul + 1..]),
        None => (payload, &[][..]),
    };

    let mut tlvs = Vec::new();
    while rest.len() >= 4 {
        let kind = u16::from_be_bytes([rest[0], rest[1]]);
        let len = usize::from(u16::from_be_bytes([rest[2], rest[3]]));
        let Some(value) = rest.get(4..4 + len) else {
            trace!(kind, len, available = rest.len() - 4, "Truncated TLV dropped");
            break;
        };
        tlvs.push(Tlv::new(kind, value.to_vec()));
        rest = &rest[4 + len..];
    }

    (String::from_utf8_lossy(text).into_owned(), tlvs)
}
