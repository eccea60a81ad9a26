//! `murmur` off-the-record messaging engine
//!
//! Encrypted, deniable, forward-secret two-party messaging over a text
//! transport that may reorder, duplicate or fragment messages.
//!
//! ## Layers
//!
//! - [`framer`]: classifies inbound strings, reassembles fragments, builds envelopes
//! - [`ake`]: the four-message authenticated key exchange
//! - [`keys`]: two-generation DH key ratchet and data-message codec
//! - [`smp`]: zero-knowledge shared-secret verification over the encrypted channel
//! - [`conversation`]: per-peer controller tying the above together
//! - [`pacer`]: optional timed emission of outgoing pieces
//!
//! Every operation on a [`Conversation`] runs to completion synchronously and
//! returns an [`Outcome`]: strings to put on the wire and events for the user.

pub mod ake;
pub mod conversation;
pub mod error;
pub mod event;
pub mod framer;
pub mod keys;
pub mod pacer;
pub mod smp;
pub mod tlv;
pub mod wire;

pub use ake::AuthState;
pub use conversation::{Conversation, MessageState};
pub use error::{OtrError, Result};
pub use event::{Event, Outcome, Status};
pub use framer::{Framer, Inbound};
pub use pacer::OutboundPacer;
pub use smp::{SmpEvent, SmpState};
pub use wire::{MessageType, PROTOCOL_V2, PROTOCOL_V3, VersionSet};
