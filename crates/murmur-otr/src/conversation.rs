//! Per-peer protocol controller.
//!
//! A [`Conversation`] owns everything about one peer: message and auth
//! state, instance tags, the handshake in flight, the key ratchet, the SMP
//! round and the fragment buffer. Each public operation runs to completion
//! and returns an [`Outcome`]; nothing happens in the background.

use std::collections::VecDeque;
use std::sync::Arc;

use murmur_core::{Config, FragmentConfig, Policy};
use murmur_crypto::{Fingerprint, IdentityKeyPair, PublicIdentity, Writer};
use tracing::{debug, info, instrument, trace, warn};

use crate::ake::{Ake, AkeContext, AkeMessage, AkeStep, AkeSuccess, AuthState};
use crate::error::{OtrError, Result};
use crate::event::{Event, Outcome, Status};
use crate::framer::{
    Framer, Inbound, encode_envelope, error_message, fragment, query_message, whitespace_tag,
};
use crate::keys::{EXTRA_KEY_LEN, FLAG_IGNORE_UNREADABLE, KeyRatchet, peek_flags};
use crate::smp::{Smp, SmpContext, SmpEvent, SmpState};
use crate::tlv::{
    TLV_DISCONNECTED, TLV_EXTRA_SYMKEY, TLV_PADDING, TLV_SMP_ABORT, TLV_SMP1, TLV_SMP1Q, Tlv,
    decode_payload, encode_payload,
};
use crate::wire::{
    Envelope, Header, MIN_INSTANCE_TAG, MessageType, PROTOCOL_V2, PROTOCOL_V3, VersionSet,
    random_instance_tag,
};

const AKE_FAILED_TEXT: &str = "The authenticated key exchange failed.";
const UNREADABLE_TEXT: &str = "You transmitted an unreadable encrypted message.";

/// Whether user messages are currently encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageState {
    #[default]
    Plaintext,
    Encrypted,
    /// The peer ended the session. Sending is refused until [`Conversation::end`].
    Finished,
}

/// What the AKE established about the peer.
#[derive(Debug)]
struct SessionInfo {
    their_identity: PublicIdentity,
    ssid: [u8; 8],
    sent_reveal: bool,
}

/// Protocol state for one peer.
pub struct Conversation {
    identity: Arc<IdentityKeyPair>,
    policy: Policy,
    fragments: FragmentConfig,
    message_state: MessageState,
    version: Option<u16>,
    our_instance: u32,
    /// Zero until the peer's first v3 message.
    their_instance: u32,
    framer: Framer,
    ake: Ake,
    ratchet: Option<KeyRatchet>,
    smp: Smp,
    session: Option<SessionInfo>,
    /// User messages held back until the session is encrypted.
    stored: VecDeque<String>,
    /// The peer has sent untagged plaintext, so it has seen our whitespace tag
    /// or does not care for it.
    peer_sent_plaintext: bool,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("message_state", &self.message_state)
            .field("auth_state", &self.ake.state())
            .field("version", &self.version)
            .field("our_instance", &format_args!("{:08x}", self.our_instance))
            .field("their_instance", &format_args!("{:08x}", self.their_instance))
            .field("smp", &self.smp)
            .field("stored", &self.stored.len())
            .finish_non_exhaustive()
    }
}

impl Conversation {
    pub fn new(identity: Arc<IdentityKeyPair>, config: &Config) -> Self {
        let our_instance = random_instance_tag();
        Self {
            identity,
            policy: config.policy.clone(),
            fragments: config.fragments.clone(),
            message_state: MessageState::Plaintext,
            version: None,
            our_instance,
            their_instance: 0,
            framer: Framer::new(our_instance),
            ake: Ake::new(),
            ratchet: None,
            smp: Smp::new(),
            session: None,
            stored: VecDeque::new(),
            peer_sent_plaintext: false,
        }
    }

    // --- accessors ---------------------------------------------------------

    pub const fn message_state(&self) -> MessageState {
        self.message_state
    }

    pub const fn auth_state(&self) -> AuthState {
        self.ake.state()
    }

    pub const fn smp_state(&self) -> SmpState {
        self.smp.state()
    }

    /// Negotiated protocol version, once an AKE has started.
    pub const fn protocol_version(&self) -> Option<u16> {
        self.version
    }

    pub const fn our_instance_tag(&self) -> u32 {
        self.our_instance
    }

    pub const fn their_instance_tag(&self) -> Option<u32> {
        if self.their_instance == 0 {
            None
        } else {
            Some(self.their_instance)
        }
    }

    pub fn ssid(&self) -> Option<[u8; 8]> {
        self.session.as_ref().map(|s| s.ssid)
    }

    pub fn their_identity(&self) -> Option<&PublicIdentity> {
        self.session.as_ref().map(|s| &s.their_identity)
    }

    pub fn their_fingerprint(&self) -> Option<Fingerprint> {
        self.their_identity().map(|id| *id.fingerprint())
    }

    pub fn our_fingerprint(&self) -> Fingerprint {
        *self.identity.fingerprint()
    }

    /// Whether we sent the Reveal Signature in the last AKE. Chat clients
    /// use this to pick which half of the ssid to emphasise.
    pub fn sent_reveal_signature(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.sent_reveal)
    }

    /// Messages waiting for the session to become encrypted.
    pub fn stored_messages(&self) -> usize {
        self.stored.len()
    }

    // --- user operations ---------------------------------------------------

    /// Ask the peer to start an encrypted session.
    pub fn query(&mut self) -> Outcome {
        let mut out = Outcome::default();
        self.send_query(&mut out);
        out
    }

    /// Send a user message.
    #[instrument(skip_all, fields(op = "send", instance = self.our_instance))]
    pub fn send(&mut self, text: &str) -> Outcome {
        let mut out = Outcome::default();
        match self.message_state {
            MessageState::Plaintext if self.policy.require_encryption => {
                if text.contains('\0') {
                    out.event(Event::Error(OtrError::EmbeddedNul("Message text")));
                    return out;
                }
                self.stored.push_back(text.to_string());
                debug!(stored = self.stored.len(), "Message held until encrypted");
                self.send_query(&mut out);
            }
            MessageState::Plaintext => {
                let mut message = text.to_string();
                if self.policy.send_whitespace_tag && !self.peer_sent_plaintext {
                    message.push_str(&whitespace_tag(self.versions()));
                }
                out.send(message);
            }
            MessageState::Encrypted => self.send_data(text, &[], 0, &mut out),
            MessageState::Finished => out.event(Event::Error(OtrError::SessionFinished)),
        }
        out
    }

    /// Handle one inbound transport string.
    #[instrument(skip_all, fields(op = "receive", instance = self.our_instance))]
    pub fn receive(&mut self, raw: &str) -> Outcome {
        let mut out = Outcome::default();
        match self.framer.classify(raw) {
            Inbound::Fragment => trace!("Fragment buffered"),
            Inbound::Plain { text, advertised } => self.on_plaintext(text, advertised, &mut out),
            Inbound::Query(versions) => self.on_query(versions, &mut out),
            Inbound::ErrorText(text) => self.on_error_text(text, &mut out),
            Inbound::Ake(envelope) => {
                if self.accept_header(&envelope.header) {
                    self.on_ake(&envelope, &mut out);
                }
            }
            Inbound::Data(envelope) => {
                if self.accept_header(&envelope.header) {
                    self.on_data(&envelope, &mut out);
                }
            }
            Inbound::Ignored(reason) => debug!(%reason, "Inbound message ignored"),
        }
        out
    }

    /// End the session, telling the peer if it is still encrypted.
    pub fn end(&mut self) -> Outcome {
        let mut out = Outcome::default();
        match self.message_state {
            MessageState::Encrypted => {
                self.send_data(
                    "",
                    &[Tlv::empty(TLV_DISCONNECTED)],
                    FLAG_IGNORE_UNREADABLE,
                    &mut out,
                );
                self.clear_session();
                out.event(Event::Status(Status::SessionEnded));
            }
            MessageState::Finished => {
                self.clear_session();
                out.event(Event::Status(Status::SessionEnded));
            }
            MessageState::Plaintext => {}
        }
        info!(state = ?self.message_state, "Session ended locally");
        out
    }

    /// Discard all session state and return to plaintext, without telling the peer.
    pub fn reset(&mut self) {
        self.clear_session();
        self.framer.reset();
        self.stored.clear();
        self.version = None;
        self.their_instance = 0;
        self.peer_sent_plaintext = false;
        debug!("Conversation reset");
    }

    /// Start an SMP round, optionally with a question for the peer.
    pub fn smp_start(&mut self, secret: &[u8], question: Option<&str>) -> Outcome {
        let mut out = Outcome::default();
        let Some(ctx) = self.smp_context() else {
            out.event(Event::Error(OtrError::NotEncrypted));
            return out;
        };
        let restarted = self.smp.in_progress();
        match self.smp.initiate(&ctx, secret, question) {
            // The peer may be mid-round; the abort makes it drop that round first
            Ok(tlv) if restarted => self.send_data(
                "",
                &[Tlv::empty(TLV_SMP_ABORT), tlv],
                FLAG_IGNORE_UNREADABLE,
                &mut out,
            ),
            Ok(tlv) => self.send_data("", &[tlv], FLAG_IGNORE_UNREADABLE, &mut out),
            Err(e) => out.event(Event::Error(e)),
        }
        out
    }

    /// Answer an SMP round the peer started.
    pub fn smp_answer(&mut self, secret: &[u8]) -> Outcome {
        let mut out = Outcome::default();
        let Some(ctx) = self.smp_context() else {
            out.event(Event::Error(OtrError::NotEncrypted));
            return out;
        };
        match self.smp.respond(&ctx, secret) {
            Ok(tlv) => self.send_data("", &[tlv], FLAG_IGNORE_UNREADABLE, &mut out),
            Err(e) => out.event(Event::Error(e)),
        }
        out
    }

    /// Abandon the current SMP round.
    pub fn smp_abort(&mut self) -> Outcome {
        let mut out = Outcome::default();
        if self.message_state != MessageState::Encrypted {
            out.event(Event::Error(OtrError::NotEncrypted));
            return out;
        }
        let tlv = self.smp.abort();
        self.send_data("", &[tlv], FLAG_IGNORE_UNREADABLE, &mut out);
        out.event(Event::Smp(SmpEvent::Aborted));
        out
    }

    /// The extra symmetric key of the current sending session.
    ///
    /// The peer is told through TLV 8 and derives the same key. `use_code`
    /// and `use_data` are opaque to the protocol and tell the peer what the
    /// key is for.
    pub fn extra_symmetric_key(
        &mut self,
        use_code: u32,
        use_data: &[u8],
    ) -> Result<([u8; EXTRA_KEY_LEN], Outcome)> {
        if self.message_state != MessageState::Encrypted {
            return Err(OtrError::NotEncrypted);
        }
        let key = self
            .ratchet
            .as_ref()
            .ok_or(OtrError::NotEncrypted)?
            .sending_extra_key()?;

        let mut value = use_code.to_be_bytes().to_vec();
        value.extend_from_slice(use_data);
        let mut out = Outcome::default();
        self.send_data(
            "",
            &[Tlv::new(TLV_EXTRA_SYMKEY, value)],
            FLAG_IGNORE_UNREADABLE,
            &mut out,
        );
        Ok((key, out))
    }

    // --- inbound dispatch --------------------------------------------------

    fn on_plaintext(&mut self, text: String, advertised: VersionSet, out: &mut Outcome) {
        if advertised.is_empty() {
            self.peer_sent_plaintext = true;
        }
        if !text.is_empty() {
            if self.message_state != MessageState::Plaintext || self.policy.require_encryption {
                warn!(state = ?self.message_state, "Unencrypted message received");
                out.event(Event::Warning(
                    "The following message was received unencrypted.".into(),
                ));
            }
            out.event(Event::Message {
                text,
                encrypted: false,
            });
        }

        if !advertised.is_empty()
            && self.policy.whitespace_start_ake
            && self.message_state != MessageState::Encrypted
            && !self.ake.in_progress()
        {
            match self.versions().best_common(advertised) {
                Some(version) => self.start_ake(version, out),
                None => debug!("Whitespace tag without a common version"),
            }
        }
    }

    fn on_query(&mut self, versions: VersionSet, out: &mut Outcome) {
        match self.versions().best_common(versions) {
            Some(version) => self.start_ake(version, out),
            None => debug!("Query without a common version ignored"),
        }
    }

    fn on_error_text(&mut self, text: String, out: &mut Outcome) {
        warn!(%text, "Peer reported an error");
        out.event(Event::Error(OtrError::Peer(text)));
        if self.policy.error_start_ake {
            self.send_query(out);
        }
    }

    /// Version and instance-tag checks shared by all enveloped messages.
    fn accept_header(&mut self, header: &Header) -> bool {
        if !self.versions().contains(header.version) {
            debug!(version = header.version, "Message in a disallowed version");
            return false;
        }
        if let Some(negotiated) = self.version
            && header.kind != MessageType::DhCommit
            && negotiated != header.version
        {
            debug!(
                version = header.version,
                negotiated,
                "Message in a version other than the negotiated one"
            );
            return false;
        }
        if header.version != PROTOCOL_V3 {
            return true;
        }

        if header.sender_instance < MIN_INSTANCE_TAG {
            debug!(sender = header.sender_instance, "Reserved sender instance tag");
            return false;
        }
        if header.receiver_instance != 0 && header.receiver_instance != self.our_instance {
            debug!(
                receiver = format_args!("{:08x}", header.receiver_instance),
                "Message addressed to another instance"
            );
            return false;
        }
        if self.their_instance == 0 {
            self.their_instance = header.sender_instance;
        } else if header.sender_instance != self.their_instance {
            if header.kind != MessageType::DhCommit {
                debug!(
                    sender = format_args!("{:08x}", header.sender_instance),
                    "Message from an unknown peer instance"
                );
                return false;
            }
            info!(
                old = format_args!("{:08x}", self.their_instance),
                new = format_args!("{:08x}", header.sender_instance),
                "Peer instance changed"
            );
            self.their_instance = header.sender_instance;
        }
        true
    }

    fn on_ake(&mut self, envelope: &Envelope, out: &mut Outcome) {
        let message = match AkeMessage::read_body(envelope.header.kind, envelope.body()) {
            Ok(message) => message,
            Err(e) => {
                debug!(kind = ?envelope.header.kind, error = %e, "Malformed AKE message ignored");
                return;
            }
        };
        if envelope.header.kind == MessageType::DhCommit {
            self.version = Some(envelope.header.version);
        }

        let ctx = AkeContext {
            identity: &self.identity,
            keyid: self.next_ake_keyid(),
        };
        match self.ake.handle(&ctx, message) {
            AkeStep::Ignore => {}
            AkeStep::Reply(reply) => self.send_ake(&reply, out),
            AkeStep::Complete { reply, success } => {
                if let Some(reply) = reply {
                    self.send_ake(&reply, out);
                }
                self.complete_ake(*success, out);
            }
            AkeStep::Failed(e) => {
                warn!(error = %e, "AKE failed");
                // A reflected value is not answered, so nothing restarts the exchange
                if self.policy.report_errors_to_peer && !matches!(e, OtrError::SelfReflection) {
                    out.send(error_message(AKE_FAILED_TEXT));
                }
                out.event(Event::Error(e));
            }
        }
    }

    fn complete_ake(&mut self, success: AkeSuccess, out: &mut Outcome) {
        match self.ratchet.as_mut() {
            Some(ratchet) => ratchet.reseed(
                success.our_dh,
                success.our_keyid,
                success.their_dh,
                success.their_keyid,
            ),
            None => {
                self.ratchet = Some(KeyRatchet::from_ake(
                    success.our_dh,
                    success.our_keyid,
                    success.their_dh,
                    success.their_keyid,
                ));
            }
        }

        info!(
            their_fingerprint = %success.their_identity.fingerprint(),
            version = ?self.version,
            "Encrypted session established"
        );
        self.session = Some(SessionInfo {
            their_identity: success.their_identity,
            ssid: success.ssid,
            sent_reveal: success.sent_reveal,
        });
        self.message_state = MessageState::Encrypted;
        self.smp = Smp::new();
        out.event(Event::Status(Status::AkeSucceeded));

        while let Some(text) = self.stored.pop_front() {
            self.send_data(&text, &[], 0, out);
        }
    }

    fn on_data(&mut self, envelope: &Envelope, out: &mut Outcome) {
        let Some(ratchet) = self
            .ratchet
            .as_mut()
            .filter(|_| self.message_state == MessageState::Encrypted)
        else {
            let flags = peek_flags(envelope).unwrap_or(0);
            if flags & FLAG_IGNORE_UNREADABLE != 0 {
                debug!("Unreadable control message ignored");
                return;
            }
            warn!(state = ?self.message_state, "Encrypted message outside an encrypted session");
            if self.policy.report_errors_to_peer {
                out.send(error_message(UNREADABLE_TEXT));
            }
            out.event(Event::Error(OtrError::UnreadableMessage));
            return;
        };

        let decrypted = match ratchet.decrypt(envelope) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                warn!(error = %e, "Data message rejected");
                out.event(Event::Error(e));
                return;
            }
        };

        let (text, tlvs) = decode_payload(&decrypted.payload);
        if !text.is_empty() {
            out.event(Event::Message {
                text,
                encrypted: true,
            });
        }

        let mut replies = Vec::new();
        for tlv in tlvs {
            match tlv.kind {
                TLV_DISCONNECTED => {
                    self.peer_disconnected(out);
                    break;
                }
                TLV_SMP1..=TLV_SMP1Q => {
                    let step = self.smp.handle(&tlv);
                    replies.extend(step.reply);
                    if let Some(event) = step.event {
                        out.event(Event::Smp(event));
                    }
                }
                TLV_EXTRA_SYMKEY => match tlv.value.split_first_chunk::<4>() {
                    Some((code, data)) => out.event(Event::ExtraSymmetricKey {
                        key: decrypted.extra_key,
                        use_code: u32::from_be_bytes(*code),
                        use_data: data.to_vec(),
                    }),
                    None => debug!("Extra symmetric key TLV without a use code"),
                },
                TLV_PADDING => {}
                kind => trace!(kind, "Unknown TLV ignored"),
            }
        }

        if !replies.is_empty() && self.message_state == MessageState::Encrypted {
            self.send_data("", &replies, FLAG_IGNORE_UNREADABLE, out);
        }
    }

    fn peer_disconnected(&mut self, out: &mut Outcome) {
        info!("Peer ended the encrypted session");
        self.message_state = MessageState::Finished;
        self.ratchet = None;
        self.smp = Smp::new();
        out.event(Event::Status(Status::PeerEndedSession));
    }

    // --- outbound ----------------------------------------------------------

    fn versions(&self) -> VersionSet {
        VersionSet::from_policy(&self.policy)
    }

    fn next_ake_keyid(&self) -> u32 {
        self.ratchet.as_ref().map_or(1, KeyRatchet::next_ake_keyid)
    }

    fn send_query(&self, out: &mut Outcome) {
        let versions = self.versions();
        if versions.is_empty() {
            out.event(Event::Warning("No protocol version is allowed by policy.".into()));
            return;
        }
        out.send(query_message(versions));
    }

    fn start_ake(&mut self, version: u16, out: &mut Outcome) {
        self.version = Some(version);
        let ctx = AkeContext {
            identity: &self.identity,
            keyid: self.next_ake_keyid(),
        };
        match self.ake.initiate(&ctx) {
            Ok(commit) => {
                info!(version, "Starting AKE");
                self.send_ake(&commit, out);
                out.event(Event::Status(Status::AkeStarted));
            }
            Err(e) => out.event(Event::Error(e)),
        }
    }

    fn header(&self, kind: MessageType) -> Header {
        let version = self.version.unwrap_or(PROTOCOL_V3);
        if version == PROTOCOL_V2 {
            Header::new(version, kind, 0, 0)
        } else {
            Header::new(version, kind, self.our_instance, self.their_instance)
        }
    }

    fn send_ake(&self, message: &AkeMessage, out: &mut Outcome) {
        let mut w = Writer::new();
        self.header(message.kind()).write(&mut w);
        message.write_body(&mut w);
        self.emit(w.as_bytes(), out);
    }

    fn send_data(&mut self, text: &str, tlvs: &[Tlv], flags: u8, out: &mut Outcome) {
        let payload = match encode_payload(text, tlvs) {
            Ok(payload) => payload,
            Err(e) => {
                out.event(Event::Error(e));
                return;
            }
        };
        let header = self.header(MessageType::Data);
        let Some(ratchet) = self.ratchet.as_mut() else {
            out.event(Event::Error(OtrError::NotEncrypted));
            return;
        };
        match ratchet.encrypt(&header, flags, &payload) {
            Ok(bytes) => self.emit(&bytes, out),
            Err(e) => {
                warn!(error = %e, "Failed to encrypt data message");
                out.event(Event::Error(e));
            }
        }
    }

    /// Envelope `bytes` and split them into fragments if configured.
    fn emit(&self, bytes: &[u8], out: &mut Outcome) {
        let envelope = encode_envelope(bytes);
        match self.fragments.max_fragment_size {
            Some(max) if envelope.len() > max => {
                let header = self.header(MessageType::Data);
                let pieces = fragment(
                    &envelope,
                    max,
                    header.version,
                    header.sender_instance,
                    header.receiver_instance,
                );
                trace!(pieces = pieces.len(), "Message fragmented");
                out.outgoing.extend(pieces);
            }
            _ => out.send(envelope),
        }
    }

    fn smp_context(&self) -> Option<SmpContext> {
        if self.message_state != MessageState::Encrypted {
            return None;
        }
        let session = self.session.as_ref()?;
        Some(SmpContext {
            our_fingerprint: *self.identity.fingerprint(),
            their_fingerprint: *session.their_identity.fingerprint(),
            ssid: session.ssid,
        })
    }

    fn clear_session(&mut self) {
        self.message_state = MessageState::Plaintext;
        self.ratchet = None;
        self.smp = Smp::new();
        self.session = None;
        self.ake.reset();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use murmur_crypto::test_parameters;

    fn party(config: &Config) -> Conversation {
        let params = test_parameters().unwrap();
        Conversation::new(Arc::new(IdentityKeyPair::generate(&params)), config)
    }

    #[test]
    fn plaintext_send_passes_through() {
        let mut alice = party(&Config::default());
        let out = alice.send("hello");
        assert_eq!(out.outgoing, vec!["hello".to_string()]);
        assert!(out.events.is_empty());
    }

    #[test]
    fn whitespace_tag_is_sent_until_peer_sends_plaintext() {
        let mut config = Config::default();
        config.policy.send_whitespace_tag = true;
        let mut alice = party(&config);

        let tagged = alice.send("hi").outgoing.remove(0);
        assert!(tagged.starts_with("hi") && tagged.len() > 2);

        alice.receive("plain reply");
        assert_eq!(alice.send("again").outgoing, vec!["again".to_string()]);
    }

    #[test]
    fn require_encryption_holds_messages_and_queries() {
        let mut config = Config::default();
        config.policy.require_encryption = true;
        let mut alice = party(&config);

        let out = alice.send("secret plans");
        assert_eq!(out.outgoing.len(), 1);
        assert!(out.outgoing[0].starts_with("?OTRv23?"));
        assert_eq!(alice.stored_messages(), 1);
    }

    #[test]
    fn query_starts_ake_with_best_version() {
        let mut bob = party(&Config::default());
        let out = bob.receive("?OTRv23?");
        assert_eq!(out.outgoing.len(), 1);
        assert!(out.outgoing[0].starts_with("?OTR:"));
        assert!(out.has_status(Status::AkeStarted));
        assert_eq!(bob.auth_state(), AuthState::AwaitingDhKey);
        assert_eq!(bob.protocol_version(), Some(PROTOCOL_V3));
    }

    #[test]
    fn v2_only_policy_negotiates_v2() {
        let mut config = Config::default();
        config.policy.allow_v3 = false;
        let mut bob = party(&config);
        bob.receive("?OTRv23?");
        assert_eq!(bob.protocol_version(), Some(PROTOCOL_V2));
    }

    #[test]
    fn legacy_query_is_ignored() {
        let mut bob = party(&Config::default());
        let out = bob.receive("?OTR?");
        assert!(out.is_empty());
        assert_eq!(bob.auth_state(), AuthState::None);
    }

    #[test]
    fn data_message_while_plaintext_reports_unreadable() {
        let mut bob = party(&Config::default());
        let mut w = Writer::new();
        Header::new(PROTOCOL_V3, MessageType::Data, 0x1234, 0).write(&mut w);
        w.byte(0).int(1).int(1);
        let out = bob.receive(&encode_envelope(w.as_bytes()));
        assert!(matches!(out.errors().next(), Some(OtrError::UnreadableMessage)));
        assert!(out.outgoing[0].starts_with("?OTR Error:"));
    }

    #[test]
    fn peer_error_triggers_query() {
        let mut alice = party(&Config::default());
        let out = alice.receive("?OTR Error: boom");
        assert!(matches!(out.errors().next(), Some(OtrError::Peer(t)) if t == "boom"));
        assert!(out.outgoing[0].starts_with("?OTRv"));
    }

    #[test]
    fn operations_needing_encryption_fail_in_plaintext() {
        let mut alice = party(&Config::default());
        assert!(matches!(
            alice.smp_start(b"s", None).errors().next(),
            Some(OtrError::NotEncrypted)
        ));
        assert!(matches!(
            alice.extra_symmetric_key(1, b""),
            Err(OtrError::NotEncrypted)
        ));
        assert!(alice.end().is_empty());
    }

    #[test]
    fn misaddressed_v3_message_is_ignored() {
        let mut bob = party(&Config::default());
        let mut w = Writer::new();
        let wrong = bob.our_instance_tag().wrapping_add(1).max(MIN_INSTANCE_TAG);
        Header::new(PROTOCOL_V3, MessageType::DhKey, 0x1234, wrong).write(&mut w);
        w.int(0);
        assert!(bob.receive(&encode_envelope(w.as_bytes())).is_empty());
        assert_eq!(bob.their_instance_tag(), None);
    }
}
