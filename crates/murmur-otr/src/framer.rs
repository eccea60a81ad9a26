//! Text framing: envelopes, fragments, queries, whitespace tags, error text.
//!
//! Inbound strings are classified exactly once into an [`Inbound`] variant.
//! Fragments are buffered here and the reassembled message is classified in
//! their place, so the rest of the engine never sees a partial message.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, trace};

use crate::wire::{Envelope, PROTOCOL_V3, VersionSet};

const ENVELOPE_PREFIX: &str = "?OTR:";
const ENVELOPE_SUFFIX: char = '.';
const ERROR_PREFIX: &str = "?OTR Error:";
const FRAGMENT_V2_PREFIX: &str = "?OTR,";
const FRAGMENT_V3_PREFIX: &str = "?OTR|";
const QUERY_PREFIX: &str = "?OTR";

const WHITESPACE_BASE: &str = "\x20\x09\x20\x20\x09\x09\x09\x09\x20\x09\x20\x09\x20\x09\x20\x20";
const WHITESPACE_V1: &str = "\x20\x09\x20\x09\x20\x20\x09\x20";
const WHITESPACE_V2: &str = "\x20\x20\x09\x09\x20\x20\x09\x20";
const WHITESPACE_V3: &str = "\x20\x20\x09\x09\x20\x20\x09\x09";
const WHITESPACE_TAG_LEN: usize = 8;

const QUERY_EXPLANATION: &str = "Your peer has requested an encrypted off-the-record conversation, \
     but your client does not support it.";

/// Fixed overhead of one fragment: prefix, instance tags, indices, separators.
const FRAGMENT_V3_OVERHEAD: usize = 36;
const FRAGMENT_V2_OVERHEAD: usize = 18;

/// One classified inbound string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Ordinary text, with any whitespace tag removed and its versions recorded.
    Plain {
        text: String,
        advertised: VersionSet,
    },
    /// A request to start the AKE, listing the versions the sender speaks.
    Query(VersionSet),
    /// A fragment was consumed; the message is not complete yet.
    Fragment,
    /// A decoded envelope carrying one of the four AKE messages.
    Ake(Envelope),
    /// A decoded envelope carrying an encrypted data message.
    Data(Envelope),
    /// Human-readable error text from the peer.
    ErrorText(String),
    /// Recognisably protocol traffic that cannot be used (bad encoding,
    /// addressed to another instance, ...).
    Ignored(String),
}

/// Reassembly state for one in-progress fragmented message.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    total: usize,
    last: usize,
    data: String,
}

impl FragmentBuffer {
    /// Accept piece `k` of `n`. Returns the whole message once the last piece lands.
    ///
    /// Out-of-order pieces and inconsistent counts discard what was buffered.
    pub fn accept(&mut self, k: usize, n: usize, piece: &str) -> Option<String> {
        if k == 0 || n == 0 || k > n {
            self.reset();
            return None;
        }
        if k == 1 {
            self.data.clear();
            self.data.push_str(piece);
            self.total = n;
            self.last = 1;
        } else if n == self.total && k == self.last + 1 {
            self.data.push_str(piece);
            self.last = k;
        } else {
            trace!(k, n, expected = self.last + 1, "Fragment out of sequence");
            self.reset();
            return None;
        }

        if self.last == self.total {
            let complete = std::mem::take(&mut self.data);
            self.reset();
            Some(complete)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.last = 0;
        self.data.clear();
    }

    /// Whether a partial message is buffered.
    pub const fn is_pending(&self) -> bool {
        self.total != 0
    }
}

/// Inbound classifier for one conversation.
#[derive(Debug)]
pub struct Framer {
    our_instance: u32,
    buffer: FragmentBuffer,
}

impl Framer {
    pub fn new(our_instance: u32) -> Self {
        Self {
            our_instance,
            buffer: FragmentBuffer::default(),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.reset();
    }

    /// Classify one inbound transport string.
    pub fn classify(&mut self, raw: &str) -> Inbound {
        if let Some(idx) = raw.find(FRAGMENT_V3_PREFIX) {
            return self.accept_fragment(&raw[idx + FRAGMENT_V3_PREFIX.len()..], true);
        }
        if let Some(idx) = raw.find(FRAGMENT_V2_PREFIX) {
            return self.accept_fragment(&raw[idx + FRAGMENT_V2_PREFIX.len()..], false);
        }
        if let Some(idx) = raw.find(ENVELOPE_PREFIX) {
            return decode_envelope(&raw[idx + ENVELOPE_PREFIX.len()..]);
        }
        if let Some(idx) = raw.find(ERROR_PREFIX) {
            return Inbound::ErrorText(raw[idx + ERROR_PREFIX.len()..].trim().to_string());
        }
        if let Some(versions) = parse_query(raw) {
            return Inbound::Query(versions);
        }
        let (text, advertised) = strip_whitespace_tag(raw);
        Inbound::Plain { text, advertised }
    }

    fn accept_fragment(&mut self, rest: &str, with_instances: bool) -> Inbound {
        let rest = if with_instances {
            let Some((sender, receiver, rest)) = split_instance_tags(rest) else {
                self.buffer.reset();
                return Inbound::Ignored("malformed fragment instance tags".into());
            };
            if receiver != 0 && receiver != self.our_instance {
                debug!(
                    sender = format_args!("{sender:08x}"),
                    receiver = format_args!("{receiver:08x}"),
                    "Fragment addressed to another instance"
                );
                return Inbound::Ignored("fragment for another instance".into());
            }
            rest
        } else {
            rest
        };

        let mut parts = rest.splitn(4, ',');
        let (Some(k), Some(n), Some(piece), Some(_)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            self.buffer.reset();
            return Inbound::Ignored("malformed fragment".into());
        };
        let (Ok(k), Ok(n)) = (k.parse::<usize>(), n.parse::<usize>()) else {
            self.buffer.reset();
            return Inbound::Ignored("malformed fragment index".into());
        };

        match self.buffer.accept(k, n, piece) {
            Some(complete) => {
                trace!(pieces = n, "Fragmented message reassembled");
                self.classify(&complete)
            }
            None => Inbound::Fragment,
        }
    }
}

fn split_instance_tags(rest: &str) -> Option<(u32, u32, &str)> {
    let (sender, rest) = rest.split_once('|')?;
    let (receiver, rest) = rest.split_once(',')?;
    let sender = u32::from_str_radix(sender, 16).ok()?;
    let receiver = u32::from_str_radix(receiver, 16).ok()?;
    Some((sender, receiver, rest))
}

fn decode_envelope(rest: &str) -> Inbound {
    let Some(end) = rest.find(ENVELOPE_SUFFIX) else {
        return Inbound::Ignored("unterminated envelope".into());
    };
    let bytes = match BASE64.decode(&rest[..end]) {
        Ok(bytes) => bytes,
        Err(e) => return Inbound::Ignored(format!("envelope is not base64: {e}")),
    };
    match Envelope::decode(bytes) {
        Ok(envelope) if envelope.header.kind.is_ake() => Inbound::Ake(envelope),
        Ok(envelope) => Inbound::Data(envelope),
        Err(e) => Inbound::Ignored(format!("bad envelope header: {e}")),
    }
}

/// Parse `?OTR?` / `?OTRv23?` anywhere in `text`.
///
/// `?OTR?` advertises version 1 only, which no longer negotiates, but it is
/// still recognised so the caller can tell it from plain text.
fn parse_query(text: &str) -> Option<VersionSet> {
    let idx = text.find(QUERY_PREFIX)?;
    let mut rest = &text[idx + QUERY_PREFIX.len()..];
    let mut versions = VersionSet::EMPTY;
    let mut recognised = false;

    if let Some(after) = rest.strip_prefix('?') {
        versions.insert(1);
        recognised = true;
        rest = after;
    }
    if let Some(after) = rest.strip_prefix('v') {
        let end = after.find('?')?;
        for digit in after[..end].chars().filter_map(|c| c.to_digit(10)) {
            #[allow(clippy::cast_possible_truncation)] // single decimal digit
            versions.insert(digit as u16);
        }
        recognised = true;
    }
    recognised.then_some(versions)
}

fn strip_whitespace_tag(raw: &str) -> (String, VersionSet) {
    let mut versions = VersionSet::EMPTY;
    let Some(start) = raw.find(WHITESPACE_BASE) else {
        return (raw.to_string(), versions);
    };

    let mut end = start + WHITESPACE_BASE.len();
    while let Some(tag) = raw.get(end..end + WHITESPACE_TAG_LEN) {
        match tag {
            WHITESPACE_V1 => versions.insert(1),
            WHITESPACE_V2 => versions.insert(2),
            WHITESPACE_V3 => versions.insert(3),
            _ => break,
        }
        end += WHITESPACE_TAG_LEN;
    }

    let mut text = String::with_capacity(raw.len());
    text.push_str(&raw[..start]);
    text.push_str(&raw[end..]);
    (text, versions)
}

/// Wrap a binary message as `?OTR:<base64>.`.
pub fn encode_envelope(bytes: &[u8]) -> String {
    format!("{ENVELOPE_PREFIX}{}{ENVELOPE_SUFFIX}", BASE64.encode(bytes))
}

/// A query message advertising `versions`.
pub fn query_message(versions: VersionSet) -> String {
    let digits: String = versions.iter().map(|v| v.to_string()).collect();
    format!("{QUERY_PREFIX}v{digits}?\n{QUERY_EXPLANATION}")
}

/// The whitespace tag advertising `versions`, appended to outgoing plaintext.
pub fn whitespace_tag(versions: VersionSet) -> String {
    let mut tag = String::from(WHITESPACE_BASE);
    for version in versions.iter() {
        tag.push_str(if version == PROTOCOL_V3 {
            WHITESPACE_V3
        } else {
            WHITESPACE_V2
        });
    }
    tag
}

/// Error text for the peer.
pub fn error_message(text: &str) -> String {
    format!("{ERROR_PREFIX} {text}")
}

/// Split `message` into transport-sized fragments.
///
/// Returns the message unchanged when it already fits. Pieces never split a
/// UTF-8 character; a piece size too small for the framing overhead still
/// makes progress one character at a time.
pub fn fragment(
    message: &str,
    max_size: usize,
    version: u16,
    sender_instance: u32,
    receiver_instance: u32,
) -> Vec<String> {
    if message.len() <= max_size {
        return vec![message.to_string()];
    }
    let overhead = if version == PROTOCOL_V3 {
        FRAGMENT_V3_OVERHEAD
    } else {
        FRAGMENT_V2_OVERHEAD
    };
    let piece_len = max_size
        .saturating_sub(overhead)
        .max(1)
        .max(message.len().div_ceil(usize::from(u16::MAX)));

    let pieces = split_at_char_boundaries(message, piece_len);
    let n = pieces.len();
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            let k = i + 1;
            if version == PROTOCOL_V3 {
                format!(
                    "{FRAGMENT_V3_PREFIX}{sender_instance:08x}|{receiver_instance:08x},{k:05},{n:05},{piece},"
                )
            } else {
                format!("{FRAGMENT_V2_PREFIX}{k:05},{n:05},{piece},")
            }
        })
        .collect()
}

fn split_at_char_boundaries(s: &str, max_bytes: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < s.len() {
        let mut end = (start + max_bytes).min(s.len());
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single character wider than max_bytes
            end = start + s[start..].chars().next().map_or(1, char::len_utf8);
        }
        pieces.push(&s[start..end]);
        start = end;
    }
    pieces
}
