//! Binary message headers shared by the AKE and data messages.
//!
//! Every enveloped message starts with a 2-byte protocol version and a
//! 1-byte message type. Version 3 follows these with the sender and
//! receiver instance tags (4 bytes each); version 2 carries none.

use murmur_core::Policy;
use murmur_crypto::{Reader, Writer};

use crate::error::{OtrError, Result};

pub const PROTOCOL_V2: u16 = 2;
pub const PROTOCOL_V3: u16 = 3;

/// Smallest valid instance tag; lower values are reserved.
pub const MIN_INSTANCE_TAG: u32 = 0x100;

const V2_HEADER_LEN: usize = 3;
const V3_HEADER_LEN: usize = 11;

/// Enveloped message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DhCommit = 0x02,
    Data = 0x03,
    DhKey = 0x0a,
    RevealSignature = 0x11,
    Signature = 0x12,
}

impl MessageType {
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x02 => Some(Self::DhCommit),
            0x03 => Some(Self::Data),
            0x0a => Some(Self::DhKey),
            0x11 => Some(Self::RevealSignature),
            0x12 => Some(Self::Signature),
            _ => None,
        }
    }

    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this type belongs to the key exchange.
    pub const fn is_ake(self) -> bool {
        !matches!(self, Self::Data)
    }
}

/// Generate a random instance tag in the valid range.
pub fn random_instance_tag() -> u32 {
    loop {
        let tag: u32 = rand::random();
        if tag >= MIN_INSTANCE_TAG {
            return tag;
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub kind: MessageType,
    /// Zero under version 2.
    pub sender_instance: u32,
    /// Zero under version 2, or when the peer's tag is not yet known.
    pub receiver_instance: u32,
}

impl Header {
    pub const fn new(
        version: u16,
        kind: MessageType,
        sender_instance: u32,
        receiver_instance: u32,
    ) -> Self {
        Self {
            version,
            kind,
            sender_instance,
            receiver_instance,
        }
    }

    /// Encoded length for this header's version.
    pub const fn encoded_len(&self) -> usize {
        if self.version == PROTOCOL_V3 {
            V3_HEADER_LEN
        } else {
            V2_HEADER_LEN
        }
    }

    pub fn write(&self, w: &mut Writer) {
        w.short(self.version).byte(self.kind.as_byte());
        if self.version == PROTOCOL_V3 {
            w.int(self.sender_instance).int(self.receiver_instance);
        }
    }

    pub fn read(r: &mut Reader<'_>) -> Result<Self> {
        let version = r.short()?;
        if version != PROTOCOL_V2 && version != PROTOCOL_V3 {
            return Err(OtrError::UnsupportedVersion(version));
        }
        let type_byte = r.byte()?;
        let kind =
            MessageType::from_byte(type_byte).ok_or(OtrError::UnknownMessageType(type_byte))?;
        let (sender_instance, receiver_instance) = if version == PROTOCOL_V3 {
            (r.int()?, r.int()?)
        } else {
            (0, 0)
        };
        Ok(Self {
            version,
            kind,
            sender_instance,
            receiver_instance,
        })
    }
}

/// A decoded envelope: its header plus the complete binary message.
///
/// The full bytes are kept because data-message MACs cover the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub bytes: Vec<u8>,
}

impl Envelope {
    pub fn decode(bytes: Vec<u8>) -> Result<Self> {
        let header = Header::read(&mut Reader::new(&bytes))?;
        Ok(Self { header, bytes })
    }

    /// Everything after the header.
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header.encoded_len()..]
    }
}

/// Set of protocol versions, as advertised in queries and whitespace tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionSet(u8);

impl VersionSet {
    pub const EMPTY: Self = Self(0);

    /// The versions a policy allows us to speak.
    pub const fn from_policy(policy: &Policy) -> Self {
        let mut bits = 0;
        if policy.allow_v2 {
            bits |= 1 << PROTOCOL_V2;
        }
        if policy.allow_v3 {
            bits |= 1 << PROTOCOL_V3;
        }
        Self(bits)
    }

    /// Record `version`. Versions above 7 cannot be represented and are dropped.
    pub const fn insert(&mut self, version: u16) {
        if version < 8 {
            self.0 |= 1 << version;
        }
    }

    pub const fn contains(self, version: u16) -> bool {
        version < 8 && self.0 & (1 << version) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Highest version both sets contain, among those this engine speaks.
    pub const fn best_common(self, other: Self) -> Option<u16> {
        let shared = Self(self.0 & other.0);
        if shared.contains(PROTOCOL_V3) {
            Some(PROTOCOL_V3)
        } else if shared.contains(PROTOCOL_V2) {
            Some(PROTOCOL_V2)
        } else {
            None
        }
    }

    /// Supported versions in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u16> {
        [PROTOCOL_V2, PROTOCOL_V3]
            .into_iter()
            .filter(move |v| self.contains(*v))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn v3_header_carries_instance_tags() {
        let header = Header::new(PROTOCOL_V3, MessageType::Data, 0x1234_5678, 0x0000_0100);
        let mut w = Writer::new();
        header.write(&mut w);
        assert_eq!(
            w.as_bytes(),
            &[0, 3, 0x03, 0x12, 0x34, 0x56, 0x78, 0, 0, 1, 0]
        );
        assert_eq!(Header::read(&mut Reader::new(w.as_bytes())).unwrap(), header);
    }

    #[test]
    fn v2_header_has_no_instance_tags() {
        let header = Header::new(PROTOCOL_V2, MessageType::DhKey, 0, 0);
        let mut w = Writer::new();
        header.write(&mut w);
        assert_eq!(w.as_bytes(), &[0, 2, 0x0a]);
        assert_eq!(header.encoded_len(), 3);
    }

    #[test]
    fn unknown_version_and_type_are_rejected() {
        assert!(matches!(
            Header::read(&mut Reader::new(&[0, 1, 0x02])),
            Err(OtrError::UnsupportedVersion(1))
        ));
        assert!(matches!(
            Header::read(&mut Reader::new(&[0, 2, 0x7f])),
            Err(OtrError::UnknownMessageType(0x7f))
        ));
    }

    #[test]
    fn truncated_v3_header_is_rejected() {
        assert!(matches!(
            Header::read(&mut Reader::new(&[0, 3, 0x03, 0, 0])),
            Err(OtrError::Crypto(_))
        ));
    }

    #[test]
    fn envelope_body_skips_header() {
        let envelope = Envelope::decode(vec![0, 2, 0x0a, 9, 8, 7]).unwrap();
        assert_eq!(envelope.header.kind, MessageType::DhKey);
        assert_eq!(envelope.body(), &[9, 8, 7]);
    }

    #[test]
    fn best_common_prefers_v3() {
        let both = VersionSet::from_policy(&Policy::default());
        let mut only_v2 = VersionSet::EMPTY;
        only_v2.insert(PROTOCOL_V2);
        assert_eq!(both.best_common(both), Some(PROTOCOL_V3));
        assert_eq!(both.best_common(only_v2), Some(PROTOCOL_V2));

        let mut only_v1 = VersionSet::EMPTY;
        only_v1.insert(1);
        assert_eq!(both.best_common(only_v1), None);
    }

    #[test]
    fn instance_tags_avoid_reserved_range() {
        for _ in 0..64 {
            assert!(random_instance_tag() >= MIN_INSTANCE_TAG);
        }
    }
}
