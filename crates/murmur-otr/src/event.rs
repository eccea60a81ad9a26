//! What a conversation hands back to its caller after each operation.

use crate::error::OtrError;
use crate::keys::EXTRA_KEY_LEN;
use crate::smp::SmpEvent;

/// Conversation-level state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// We sent the first AKE message.
    AkeStarted,
    /// The AKE finished; the session is encrypted.
    AkeSucceeded,
    /// The peer ended the session. Outgoing messages are refused until
    /// the local side ends it too.
    PeerEndedSession,
    /// The local side ended the session; back to plaintext.
    SessionEnded,
}

/// One user-visible consequence of an operation.
#[derive(Debug)]
pub enum Event {
    /// A message for the user. `encrypted` tells how it arrived.
    Message { text: String, encrypted: bool },
    Status(Status),
    Smp(SmpEvent),
    /// The peer asked to use the extra symmetric key of the current session.
    ExtraSymmetricKey {
        key: [u8; EXTRA_KEY_LEN],
        use_code: u32,
        use_data: Vec<u8>,
    },
    /// Something the user should know that is not an error.
    Warning(String),
    Error(OtrError),
}

/// Transport strings to send, in order, plus events for the user.
#[derive(Debug, Default)]
pub struct Outcome {
    pub outgoing: Vec<String>,
    pub events: Vec<Event>,
}

impl Outcome {
    pub fn send(&mut self, message: String) {
        self.outgoing.push(message);
    }

    pub fn event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.events.is_empty()
    }

    /// Received messages, in arrival order.
    pub fn messages(&self) -> impl Iterator<Item = (&str, bool)> {
        self.events.iter().filter_map(|e| match e {
            Event::Message { text, encrypted } => Some((text.as_str(), *encrypted)),
            _ => None,
        })
    }

    pub fn has_status(&self, status: Status) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, Event::Status(s) if *s == status))
    }

    pub fn errors(&self) -> impl Iterator<Item = &OtrError> {
        self.events.iter().filter_map(|e| match e {
            Event::Error(err) => Some(err),
            _ => None,
        })
    }
}
