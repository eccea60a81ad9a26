//! Session keys, the two-generation DH ratchet, and the data-message codec.
//!
//! Each side keeps its current and previous DH keypair and the peer's
//! current and previous public value. Every (ours, theirs) pairing has its
//! own [`SessionKeys`] with independent counters, so a message encrypted
//! under either generation on either side still decrypts after one
//! rotation. Older keys are forgotten; the MAC keys among them that were
//! actually used are published in the next outgoing message.

use murmur_crypto::cipher::{AES_KEY_LEN, aes128_ctr};
use murmur_crypto::encoding::encode_mpi;
use murmur_crypto::hash::{MAC_LEN, constant_time_eq, hmac_sha1, sha1, sha256_parts};
use murmur_crypto::{BigUint, DhKeyPair, Reader, Writer, check_group_element};
use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{OtrError, Result};
use crate::wire::{Envelope, Header};

/// Data-message flag: the receiver should not complain if it cannot decrypt.
pub const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

pub const EXTRA_KEY_LEN: usize = 32;

const CURRENT: usize = 0;
const PREVIOUS: usize = 1;

/// Keys for one (our keypair, their public value) pairing.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    sid: [u8; 8],
    send_enc: [u8; AES_KEY_LEN],
    rcv_enc: [u8; AES_KEY_LEN],
    send_mac: [u8; MAC_LEN],
    rcv_mac: [u8; MAC_LEN],
    extra_key: [u8; EXTRA_KEY_LEN],
    send_counter: u64,
    rcv_counter: u64,
    send_mac_used: bool,
    rcv_mac_used: bool,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("sid", &hex_short(&self.sid))
            .field("send_counter", &self.send_counter)
            .field("rcv_counter", &self.rcv_counter)
            .finish_non_exhaustive()
    }
}

fn hex_short(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SessionKeys {
    /// Derive keys for `ours` x `theirs`.
    ///
    /// The side with the numerically larger public value is "high" and
    /// encrypts with the `0x01` key; the low side with `0x02`.
    pub fn derive(ours: &DhKeyPair, theirs: &BigUint) -> Self {
        let mut secbytes = encode_mpi(&ours.shared_secret(theirs));
        let h = |b: u8| sha256_parts(&[&[b], &secbytes]);

        let (send_byte, rcv_byte) = if ours.public() > theirs {
            (0x01, 0x02)
        } else {
            (0x02, 0x01)
        };

        let mut sid = [0u8; 8];
        sid.copy_from_slice(&h(0x00)[..8]);
        let mut send_enc = [0u8; AES_KEY_LEN];
        send_enc.copy_from_slice(&h(send_byte)[..AES_KEY_LEN]);
        let mut rcv_enc = [0u8; AES_KEY_LEN];
        rcv_enc.copy_from_slice(&h(rcv_byte)[..AES_KEY_LEN]);
        let extra_key = h(0xff);
        secbytes.zeroize();

        Self {
            sid,
            send_mac: sha1(&send_enc),
            rcv_mac: sha1(&rcv_enc),
            send_enc,
            rcv_enc,
            extra_key,
            send_counter: 0,
            rcv_counter: 0,
            send_mac_used: false,
            rcv_mac_used: false,
        }
    }

    pub const fn sid(&self) -> &[u8; 8] {
        &self.sid
    }

    pub const fn extra_key(&self) -> &[u8; EXTRA_KEY_LEN] {
        &self.extra_key
    }

    /// MAC keys of this pairing that authenticated at least one message.
    fn used_mac_keys(&self) -> impl Iterator<Item = [u8; MAC_LEN]> + '_ {
        [
            (self.send_mac_used, self.send_mac),
            (self.rcv_mac_used, self.rcv_mac),
        ]
        .into_iter()
        .filter_map(|(used, key)| used.then_some(key))
    }
}

/// A successfully decrypted data message.
#[derive(Debug)]
pub struct Decrypted {
    pub flags: u8,
    pub payload: Vec<u8>,
    /// Extra symmetric key of the pairing that authenticated the message.
    pub extra_key: [u8; EXTRA_KEY_LEN],
}

/// The DH ratchet of an established session.
pub struct KeyRatchet {
    our_current: DhKeyPair,
    our_previous: DhKeyPair,
    /// Key id of `our_current`; `our_previous` is one less.
    our_keyid: u32,
    their_current: BigUint,
    their_previous: Option<BigUint>,
    /// Key id of `their_current`.
    their_keyid: u32,
    /// Indexed `[our generation][their generation]`, 0 = current, 1 = previous.
    sessions: [[Option<SessionKeys>; 2]; 2],
    /// Used MAC keys of discarded pairings, published in the next outgoing message.
    old_mac_keys: Vec<[u8; MAC_LEN]>,
}

impl std::fmt::Debug for KeyRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRatchet")
            .field("our_keyid", &self.our_keyid)
            .field("their_keyid", &self.their_keyid)
            .field("pending_disclosures", &self.old_mac_keys.len())
            .finish_non_exhaustive()
    }
}

impl KeyRatchet {
    /// Seed from a completed AKE.
    ///
    /// The AKE keypair becomes our previous generation and a fresh keypair
    /// our current one, so the first message already advertises a new key.
    pub fn from_ake(
        ake_key: DhKeyPair,
        ake_keyid: u32,
        their_y: BigUint,
        their_keyid: u32,
    ) -> Self {
        let our_current = DhKeyPair::generate();
        let sessions = [
            [Some(SessionKeys::derive(&our_current, &their_y)), None],
            [Some(SessionKeys::derive(&ake_key, &their_y)), None],
        ];
        Self {
            our_current,
            our_previous: ake_key,
            our_keyid: ake_keyid.wrapping_add(1),
            their_current: their_y,
            their_previous: None,
            their_keyid,
            sessions,
            old_mac_keys: Vec::new(),
        }
    }

    /// Re-seed after a repeated AKE inside a running session.
    ///
    /// The peer's known generations survive when the AKE used one of them;
    /// every pairing is recomputed and the used MAC keys of replaced pairings
    /// are queued for disclosure.
    pub fn reseed(
        &mut self,
        ake_key: DhKeyPair,
        ake_keyid: u32,
        their_y: BigUint,
        their_keyid: u32,
    ) {
        let keeps_theirs = (their_keyid == self.their_keyid && their_y == self.their_current)
            || (their_keyid.wrapping_add(1) == self.their_keyid
                && self.their_previous.as_ref() == Some(&their_y));
        if !keeps_theirs {
            self.their_current = their_y;
            self.their_previous = None;
            self.their_keyid = their_keyid;
        }

        self.our_previous = ake_key;
        self.our_current = DhKeyPair::generate();
        self.our_keyid = ake_keyid.wrapping_add(1);

        for row in &mut self.sessions {
            for slot in row {
                if let Some(old) = slot.take() {
                    self.old_mac_keys.extend(old.used_mac_keys());
                }
            }
        }
        self.sessions[CURRENT][CURRENT] =
            Some(SessionKeys::derive(&self.our_current, &self.their_current));
        self.sessions[PREVIOUS][CURRENT] =
            Some(SessionKeys::derive(&self.our_previous, &self.their_current));
        if let Some(prev) = &self.their_previous {
            self.sessions[CURRENT][PREVIOUS] = Some(SessionKeys::derive(&self.our_current, prev));
            self.sessions[PREVIOUS][PREVIOUS] = Some(SessionKeys::derive(&self.our_previous, prev));
        }
        debug!(our_keyid = self.our_keyid, their_keyid = self.their_keyid, "Ratchet re-seeded");
    }

    /// Key id a new AKE should use for our ephemeral key.
    pub const fn next_ake_keyid(&self) -> u32 {
        self.our_keyid.wrapping_add(1)
    }

    pub const fn our_keyid(&self) -> u32 {
        self.our_keyid
    }

    pub const fn their_keyid(&self) -> u32 {
        self.their_keyid
    }

    /// Keys used for sending: our previous keypair with their current value.
    ///
    /// Our current public value rides along as `next_dh`; once the peer has
    /// used it we rotate and it becomes the sending key.
    fn sending(&self) -> Result<&SessionKeys> {
        self.sessions[PREVIOUS][CURRENT]
            .as_ref()
            .ok_or(OtrError::NotEncrypted)
    }

    /// Extra symmetric key of the current sending pairing.
    pub fn sending_extra_key(&self) -> Result<[u8; EXTRA_KEY_LEN]> {
        Ok(*self.sending()?.extra_key())
    }

    /// Encrypt `payload` into a complete binary data message.
    pub fn encrypt(&mut self, header: &Header, flags: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let sender_keyid = self.our_keyid.wrapping_sub(1);
        let recipient_keyid = self.their_keyid;
        let next_dh = self.our_current.public().clone();
        let keys = self.sessions[PREVIOUS][CURRENT]
            .as_mut()
            .ok_or(OtrError::NotEncrypted)?;

        keys.send_counter = keys
            .send_counter
            .checked_add(1)
            .ok_or(OtrError::CounterExhausted)?;
        let ctr = keys.send_counter.to_be_bytes();
        let encrypted = aes128_ctr(&keys.send_enc, ctr, payload)?;

        let mut w = Writer::new();
        header.write(&mut w);
        w.byte(flags)
            .int(sender_keyid)
            .int(recipient_keyid)
            .mpi(&next_dh)
            .raw(&ctr)
            .data(&encrypted);
        let mac = hmac_sha1(&keys.send_mac, w.as_bytes());
        keys.send_mac_used = true;
        w.raw(&mac);

        let disclosed: Vec<u8> = self.old_mac_keys.drain(..).flatten().collect();
        if !disclosed.is_empty() {
            trace!(count = disclosed.len() / MAC_LEN, "Disclosing old MAC keys");
        }
        w.data(&disclosed);

        trace!(
            sender_keyid,
            recipient_keyid,
            counter = keys.send_counter,
            "Data message encrypted"
        );
        Ok(w.into_bytes())
    }

    /// Authenticate and decrypt a data message, then rotate if the peer
    /// has caught up with our newest key or advertised a new one of theirs.
    ///
    /// Nothing in the ratchet changes unless the message authenticates and
    /// its counter is fresh.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<Decrypted> {
        let mut r = Reader::new(&envelope.bytes);
        r.raw(envelope.header.encoded_len())?;
        let flags = r.byte()?;
        let sender_keyid = r.int()?;
        let recipient_keyid = r.int()?;
        let next_dh = r.mpi()?;
        let ctr: [u8; 8] = r.array()?;
        let encrypted = r.data()?;
        let authenticated = &envelope.bytes[..r.position()];
        let mac: [u8; MAC_LEN] = r.array()?;
        let _disclosed = r.data()?;
        r.finish()?;

        let unknown = || OtrError::UnknownKeyIds {
            sender: sender_keyid,
            recipient: recipient_keyid,
        };
        if sender_keyid == 0 || recipient_keyid == 0 {
            return Err(unknown());
        }
        let our_gen = generation(self.our_keyid, recipient_keyid).ok_or_else(unknown)?;
        let their_gen = generation(self.their_keyid, sender_keyid).ok_or_else(unknown)?;
        let keys = self.sessions[our_gen][their_gen]
            .as_mut()
            .ok_or_else(unknown)?;

        if !constant_time_eq(&hmac_sha1(&keys.rcv_mac, authenticated), &mac) {
            return Err(OtrError::BadMac);
        }
        let counter = u64::from_be_bytes(ctr);
        if counter <= keys.rcv_counter {
            return Err(OtrError::Replay {
                counter,
                last_seen: keys.rcv_counter,
            });
        }
        let advertises_new = their_gen == CURRENT && next_dh != self.their_current;
        if advertises_new && !check_group_element(&next_dh) {
            return Err(OtrError::IllegalGroupElement("next D-H value"));
        }

        let payload = aes128_ctr(&keys.rcv_enc, ctr, encrypted)?;
        keys.rcv_counter = counter;
        keys.rcv_mac_used = true;
        let extra_key = keys.extra_key;

        if our_gen == CURRENT {
            self.rotate_ours();
        }
        if advertises_new {
            self.rotate_theirs(next_dh);
        }

        Ok(Decrypted {
            flags,
            payload,
            extra_key,
        })
    }

    /// The peer used our newest key: generate the next one.
    fn rotate_ours(&mut self) {
        for slot in &mut self.sessions[PREVIOUS] {
            if let Some(old) = slot.take() {
                self.old_mac_keys.extend(old.used_mac_keys());
            }
        }
        let [current, previous] = &mut self.sessions;
        std::mem::swap(current, previous);

        let fresh = DhKeyPair::generate();
        self.our_previous = std::mem::replace(&mut self.our_current, fresh);
        self.our_keyid = self.our_keyid.wrapping_add(1);

        self.sessions[CURRENT][CURRENT] =
            Some(SessionKeys::derive(&self.our_current, &self.their_current));
        self.sessions[CURRENT][PREVIOUS] = self
            .their_previous
            .as_ref()
            .map(|prev| SessionKeys::derive(&self.our_current, prev));
        debug!(our_keyid = self.our_keyid, "Rotated our D-H key");
    }

    /// The peer advertised a new key of theirs.
    fn rotate_theirs(&mut self, next: BigUint) {
        for row in &mut self.sessions {
            if let Some(old) = row[PREVIOUS].take() {
                self.old_mac_keys.extend(old.used_mac_keys());
            }
            row.swap(CURRENT, PREVIOUS);
        }

        self.their_previous = Some(std::mem::replace(&mut self.their_current, next));
        self.their_keyid = self.their_keyid.wrapping_add(1);

        self.sessions[CURRENT][CURRENT] =
            Some(SessionKeys::derive(&self.our_current, &self.their_current));
        self.sessions[PREVIOUS][CURRENT] =
            Some(SessionKeys::derive(&self.our_previous, &self.their_current));
        debug!(their_keyid = self.their_keyid, "Rotated their D-H key");
    }

    /// Number of MAC keys waiting to be disclosed.
    pub fn pending_disclosures(&self) -> usize {
        self.old_mac_keys.len()
    }
}

/// 0 for the newest key id, 1 for the one before it, `None` otherwise.
fn generation(newest: u32, keyid: u32) -> Option<usize> {
    match newest.wrapping_sub(keyid) {
        0 => Some(CURRENT),
        1 => Some(PREVIOUS),
        _ => None,
    }
}

/// Read the flags byte of a data message without decrypting it.
pub fn peek_flags(envelope: &Envelope) -> Option<u8> {
    envelope.body().first().copied()
}

/// Split the disclosed MAC keys out of a data message.
pub fn disclosed_mac_keys(envelope: &Envelope) -> Result<Vec<[u8; MAC_LEN]>> {
    let mut r = Reader::new(envelope.body());
    r.byte()?;
    r.int()?;
    r.int()?;
    r.mpi()?;
    r.raw(8)?;
    r.data()?;
    r.raw(MAC_LEN)?;
    let disclosed = r.data()?;
    if disclosed.len() % MAC_LEN != 0 {
        return Err(OtrError::Malformed(format!(
            "{} bytes of disclosed MAC keys",
            disclosed.len()
        )));
    }
    Ok(disclosed
        .chunks_exact(MAC_LEN)
        .map(|chunk| {
            let mut key = [0u8; MAC_LEN];
            key.copy_from_slice(chunk);
            key
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::wire::{MessageType, PROTOCOL_V3};

    fn header() -> Header {
        Header::new(PROTOCOL_V3, MessageType::Data, 0x100, 0x200)
    }

    fn envelope(bytes: Vec<u8>) -> Envelope {
        Envelope::decode(bytes).unwrap()
    }

    /// Ratchets as left by an AKE between Alice (key id 1) and Bob (key id 1).
    fn pair() -> (KeyRatchet, KeyRatchet) {
        let alice_dh = DhKeyPair::generate();
        let bob_dh = DhKeyPair::generate();
        let alice = KeyRatchet::from_ake(alice_dh.clone(), 1, bob_dh.public().clone(), 1);
        let bob = KeyRatchet::from_ake(bob_dh, 1, alice_dh.public().clone(), 1);
        (alice, bob)
    }

    fn send(from: &mut KeyRatchet, to: &mut KeyRatchet, text: &[u8]) -> Vec<u8> {
        let bytes = from.encrypt(&header(), 0, text).unwrap();
        to.decrypt(&envelope(bytes)).unwrap().payload
    }

    fn filled(r: &KeyRatchet) -> usize {
        r.sessions.iter().flatten().filter(|s| s.is_some()).count()
    }

    #[test]
    fn both_sides_derive_matching_keys() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let ours = SessionKeys::derive(&a, b.public());
        let theirs = SessionKeys::derive(&b, a.public());
        assert_eq!(ours.sid, theirs.sid);
        assert_eq!(ours.send_enc, theirs.rcv_enc);
        assert_eq!(ours.rcv_enc, theirs.send_enc);
        assert_eq!(ours.send_mac, theirs.rcv_mac);
        assert_ne!(ours.send_enc, ours.rcv_enc);
        assert_eq!(ours.extra_key, theirs.extra_key);
    }

    #[test]
    fn messages_flow_both_ways_across_rotations() {
        let (mut alice, mut bob) = pair();
        for round in 0..6u8 {
            assert_eq!(send(&mut alice, &mut bob, &[round; 5]), vec![round; 5]);
            assert_eq!(send(&mut bob, &mut alice, &[round, 1]), vec![round, 1]);
        }
        assert!(alice.our_keyid() > 2);
        assert!(bob.their_keyid() > 2);
        assert_eq!(alice.our_keyid(), bob.their_keyid() + 1);
    }

    #[test]
    fn one_directional_stream_keeps_working() {
        let (mut alice, mut bob) = pair();
        for i in 0..10u8 {
            assert_eq!(send(&mut alice, &mut bob, &[i]), vec![i]);
        }
    }

    #[test]
    fn at_most_two_generations_per_side() {
        let (mut alice, mut bob) = pair();
        for _ in 0..5 {
            send(&mut alice, &mut bob, b"ping");
            send(&mut bob, &mut alice, b"pong");
            assert!(filled(&alice) <= 4);
            assert!(filled(&bob) <= 4);
        }
        assert!(alice.their_previous.is_some());
        assert_eq!(filled(&alice), 4);
    }

    #[test]
    fn replayed_message_is_rejected_without_state_change() {
        let (mut alice, mut bob) = pair();
        let bytes = alice.encrypt(&header(), 0, b"once").unwrap();
        bob.decrypt(&envelope(bytes.clone())).unwrap();
        let before = (bob.our_keyid(), bob.their_keyid());

        let err = bob.decrypt(&envelope(bytes)).unwrap_err();
        assert!(matches!(err, OtrError::Replay { counter: 1, last_seen: 1 }));
        assert_eq!((bob.our_keyid(), bob.their_keyid()), before);
    }

    #[test]
    fn tampered_message_is_rejected_without_state_change() {
        let (mut alice, mut bob) = pair();
        let mut bytes = alice.encrypt(&header(), 0, b"secret").unwrap();
        // Last ciphertext byte: before the MAC and the empty disclosure list
        let mac_start = bytes.len() - 4 - MAC_LEN;
        bytes[mac_start - 1] ^= 0x01;
        let before = (bob.our_keyid(), bob.their_keyid());

        assert!(matches!(
            bob.decrypt(&envelope(bytes)),
            Err(OtrError::BadMac)
        ));
        assert_eq!((bob.our_keyid(), bob.their_keyid()), before);
        // The genuine stream still works afterwards
        assert_eq!(send(&mut alice, &mut bob, b"next"), b"next");
    }

    #[test]
    fn stale_key_ids_are_unknown() {
        let (mut alice, mut bob) = pair();
        let stale = alice.encrypt(&header(), 0, b"old").unwrap();
        for _ in 0..3 {
            send(&mut alice, &mut bob, b"x");
            send(&mut bob, &mut alice, b"y");
        }
        assert!(matches!(
            bob.decrypt(&envelope(stale)),
            Err(OtrError::UnknownKeyIds { .. })
        ));
    }

    #[test]
    fn used_mac_keys_are_disclosed_after_rotation() {
        let (mut alice, mut bob) = pair();
        let first = alice.encrypt(&header(), 0, b"1").unwrap();
        bob.decrypt(&envelope(first.clone())).unwrap();
        let first_mac_key = alice.sessions[PREVIOUS][CURRENT].as_ref().unwrap().send_mac;

        // Push both generations far enough that the first pairing is dropped
        let mut disclosed = Vec::new();
        for _ in 0..4 {
            let to_bob = alice.encrypt(&header(), 0, b"a").unwrap();
            disclosed.extend(disclosed_mac_keys(&envelope(to_bob.clone())).unwrap());
            bob.decrypt(&envelope(to_bob)).unwrap();
            let to_alice = bob.encrypt(&header(), 0, b"b").unwrap();
            alice.decrypt(&envelope(to_alice)).unwrap();
        }
        assert!(disclosed.contains(&first_mac_key));
    }

    #[test]
    fn reseed_keeps_a_known_peer_key() {
        let (mut alice, mut bob) = pair();
        send(&mut alice, &mut bob, b"x");
        send(&mut bob, &mut alice, b"y");
        let their_keyid = alice.their_keyid();
        let their_y = alice.their_current.clone();

        let next = alice.next_ake_keyid();
        alice.reseed(DhKeyPair::generate(), next, their_y, their_keyid);
        assert_eq!(alice.their_keyid(), their_keyid);
        assert!(alice.their_previous.is_some());
        assert_eq!(filled(&alice), 4);
        assert_eq!(alice.our_keyid(), next + 1);
    }

    #[test]
    fn reseed_with_unknown_peer_key_forgets_old_generations() {
        let (mut alice, mut bob) = pair();
        send(&mut alice, &mut bob, b"x");
        send(&mut bob, &mut alice, b"y");

        alice.reseed(DhKeyPair::generate(), 9, DhKeyPair::generate().public().clone(), 1);
        assert_eq!(alice.their_keyid(), 1);
        assert!(alice.their_previous.is_none());
        assert_eq!(filled(&alice), 2);
        assert!(alice.pending_disclosures() > 0);
    }

    #[test]
    fn counter_exhaustion_is_an_error() {
        let (mut alice, _bob) = pair();
        alice.sessions[PREVIOUS][CURRENT].as_mut().unwrap().send_counter = u64::MAX;
        assert!(matches!(
            alice.encrypt(&header(), 0, b"x"),
            Err(OtrError::CounterExhausted)
        ));
    }

    #[test]
    fn flags_survive_the_round_trip() {
        let (mut alice, mut bob) = pair();
        let bytes = alice
            .encrypt(&header(), FLAG_IGNORE_UNREADABLE, b"")
            .unwrap();
        assert_eq!(peek_flags(&envelope(bytes.clone())), Some(FLAG_IGNORE_UNREADABLE));
        let decrypted = bob.decrypt(&envelope(bytes)).unwrap();
        assert_eq!(decrypted.flags, FLAG_IGNORE_UNREADABLE);
        assert_eq!(decrypted.extra_key, alice.sending_extra_key().unwrap());
    }
}
