//! Authenticated key exchange.
//!
//! Four messages establish a shared DH secret and bind it to both long-term
//! DSA identities without ever producing a transferable signature:
//!
//! ```text
//! Bob                                     Alice
//!  | -- D-H Commit  (AES_r(g^x), H(g^x)) --> |
//!  | <-------------- D-H Key (g^y) --------- |
//!  | -- Reveal Sig (r, enc+MAC sig_B) -----> |
//!  | <------------ Signature (enc+MAC sig_A) |
//! ```
//!
//! The committer reveals `r` only after seeing the responder's value, so
//! neither side can choose its DH value as a function of the other's.

use murmur_crypto::cipher::aes128_ctr;
use murmur_crypto::encoding::encode_mpi;
use murmur_crypto::hash::{
    MAC_LEN, constant_time_eq, hmac_sha256, hmac_sha256_160, sha256, sha256_parts,
};
use murmur_crypto::identity::SIGNATURE_LEN;
use murmur_crypto::{
    BigUint, DhKeyPair, IdentityKeyPair, PublicIdentity, Reader, Writer, check_group_element,
};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, info, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{OtrError, Result};
use crate::wire::MessageType;

/// Length of the commitment key `r`.
pub const REVEAL_KEY_LEN: usize = 16;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    None,
    AwaitingDhKey,
    AwaitingRevealSig,
    AwaitingSig,
}

/// The four AKE message bodies (everything after the header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AkeMessage {
    DhCommit {
        encrypted_gx: Vec<u8>,
        hashed_gx: Vec<u8>,
    },
    DhKey {
        gy: BigUint,
    },
    RevealSignature {
        revealed_key: Vec<u8>,
        encrypted_signature: Vec<u8>,
        mac: [u8; MAC_LEN],
    },
    Signature {
        encrypted_signature: Vec<u8>,
        mac: [u8; MAC_LEN],
    },
}

impl AkeMessage {
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::DhCommit { .. } => MessageType::DhCommit,
            Self::DhKey { .. } => MessageType::DhKey,
            Self::RevealSignature { .. } => MessageType::RevealSignature,
            Self::Signature { .. } => MessageType::Signature,
        }
    }

    pub fn write_body(&self, w: &mut Writer) {
        match self {
            Self::DhCommit {
                encrypted_gx,
                hashed_gx,
            } => {
                w.data(encrypted_gx).data(hashed_gx);
            }
            Self::DhKey { gy } => {
                w.mpi(gy);
            }
            Self::RevealSignature {
                revealed_key,
                encrypted_signature,
                mac,
            } => {
                w.data(revealed_key).data(encrypted_signature).raw(mac);
            }
            Self::Signature {
                encrypted_signature,
                mac,
            } => {
                w.data(encrypted_signature).raw(mac);
            }
        }
    }

    pub fn read_body(kind: MessageType, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let message = match kind {
            MessageType::DhCommit => Self::DhCommit {
                encrypted_gx: r.data()?.to_vec(),
                hashed_gx: r.data()?.to_vec(),
            },
            MessageType::DhKey => Self::DhKey { gy: r.mpi()? },
            MessageType::RevealSignature => Self::RevealSignature {
                revealed_key: r.data()?.to_vec(),
                encrypted_signature: r.data()?.to_vec(),
                mac: r.array()?,
            },
            MessageType::Signature => Self::Signature {
                encrypted_signature: r.data()?.to_vec(),
                mac: r.array()?,
            },
            MessageType::Data => {
                return Err(OtrError::Malformed("data message is not an AKE message".into()));
            }
        };
        r.finish()?;
        Ok(message)
    }
}

/// Keys derived from the AKE shared secret.
#[derive(Zeroize, ZeroizeOnDrop)]
struct AkeSecrets {
    ssid: [u8; 8],
    c: [u8; 16],
    c_prime: [u8; 16],
    m1: [u8; 32],
    m2: [u8; 32],
    m1_prime: [u8; 32],
    m2_prime: [u8; 32],
}

impl AkeSecrets {
    fn derive(secret: &BigUint) -> Self {
        let mut secbytes = encode_mpi(secret);
        let h2 = |b: u8| sha256_parts(&[&[b], &secbytes]);

        let mut ssid = [0u8; 8];
        ssid.copy_from_slice(&h2(0x00)[..8]);
        let cc = h2(0x01);
        let mut c = [0u8; 16];
        c.copy_from_slice(&cc[..16]);
        let mut c_prime = [0u8; 16];
        c_prime.copy_from_slice(&cc[16..]);
        let secrets = Self {
            ssid,
            c,
            c_prime,
            m1: h2(0x02),
            m2: h2(0x03),
            m1_prime: h2(0x04),
            m2_prime: h2(0x05),
        };
        secbytes.zeroize();
        secrets
    }
}

/// Which half of the exchange a signature block belongs to.
#[derive(Clone, Copy)]
enum Half {
    /// Sent in Reveal Signature, keyed by `c`, `m1`, `m2`.
    Reveal,
    /// Sent in Signature, keyed by `c'`, `m1'`, `m2'`.
    Final,
}

impl AkeSecrets {
    const fn keys(&self, half: Half) -> (&[u8; 16], &[u8; 32], &[u8; 32]) {
        match half {
            Half::Reveal => (&self.c, &self.m1, &self.m2),
            Half::Final => (&self.c_prime, &self.m1_prime, &self.m2_prime),
        }
    }
}

/// `MPI(sender g) || MPI(receiver g) || pubkey || keyid`, MACed then signed.
fn transcript(
    mac_key: &[u8],
    sender_dh: &BigUint,
    receiver_dh: &BigUint,
    public: &PublicIdentity,
    keyid: u32,
) -> [u8; 32] {
    let mut w = Writer::new();
    w.mpi(sender_dh)
        .mpi(receiver_dh)
        .raw(public.encode())
        .int(keyid);
    hmac_sha256(mac_key, w.as_bytes())
}

/// Encrypt and MAC our identity proof.
fn seal_signature(
    secrets: &AkeSecrets,
    half: Half,
    identity: &IdentityKeyPair,
    our_dh: &BigUint,
    their_dh: &BigUint,
    keyid: u32,
) -> Result<(Vec<u8>, [u8; MAC_LEN])> {
    let (enc_key, sig_key, mac_key) = secrets.keys(half);
    let m = transcript(sig_key, our_dh, their_dh, identity.public(), keyid);
    let signature = identity.sign(&m)?;

    let mut x = Writer::new();
    x.raw(identity.public().encode())
        .int(keyid)
        .raw(&signature);
    let encrypted = aes128_ctr(enc_key, [0; 8], x.as_bytes())?;

    let mut mac_input = Writer::new();
    mac_input.data(&encrypted);
    let mac = hmac_sha256_160(mac_key, mac_input.as_bytes());
    Ok((encrypted, mac))
}

/// Verify and open the peer's identity proof.
fn open_signature(
    secrets: &AkeSecrets,
    half: Half,
    encrypted: &[u8],
    mac: &[u8; MAC_LEN],
    their_dh: &BigUint,
    our_dh: &BigUint,
) -> Result<(PublicIdentity, u32)> {
    let (enc_key, sig_key, mac_key) = secrets.keys(half);

    let mut mac_input = Writer::new();
    mac_input.data(encrypted);
    if !constant_time_eq(&hmac_sha256_160(mac_key, mac_input.as_bytes()), mac) {
        return Err(OtrError::BadMac);
    }

    let x = aes128_ctr(enc_key, [0; 8], encrypted)?;
    let mut r = Reader::new(&x);
    let their_public = PublicIdentity::read(&mut r)?;
    let keyid = r.int()?;
    let signature = r.raw(SIGNATURE_LEN)?;
    r.finish()?;
    if keyid == 0 {
        return Err(OtrError::Malformed("AKE key id 0".into()));
    }

    let m = transcript(sig_key, their_dh, our_dh, &their_public, keyid);
    if !their_public.verify(&m, signature) {
        return Err(OtrError::BadSignature);
    }
    Ok((their_public, keyid))
}

/// What the caller supplies for one AKE step.
#[derive(Debug, Clone, Copy)]
pub struct AkeContext<'a> {
    pub identity: &'a IdentityKeyPair,
    /// Key id to give a fresh ephemeral keypair.
    pub keyid: u32,
}

/// Everything a completed AKE hands to the key ratchet.
#[derive(Debug)]
pub struct AkeSuccess {
    pub ssid: [u8; 8],
    pub our_dh: DhKeyPair,
    pub our_keyid: u32,
    pub their_dh: BigUint,
    pub their_keyid: u32,
    pub their_identity: PublicIdentity,
    /// Whether we were the committer (sent Reveal Signature). Decides which
    /// half of the session id is shown in bold by chat clients.
    pub sent_reveal: bool,
}

/// Outcome of feeding one message to the AKE.
#[derive(Debug)]
pub enum AkeStep {
    /// Unexpected in this state; nothing changes.
    Ignore,
    /// Send this message.
    Reply(AkeMessage),
    /// The AKE finished; send the message first if there is one.
    Complete {
        reply: Option<AkeMessage>,
        success: Box<AkeSuccess>,
    },
    /// The message was rejected and the handshake abandoned.
    Failed(OtrError),
}

/// Our half of an outstanding commitment.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Commitment {
    r: [u8; REVEAL_KEY_LEN],
    #[zeroize(skip)]
    encrypted_gx: Vec<u8>,
    #[zeroize(skip)]
    hashed_gx: [u8; 32],
}

/// State of one handshake attempt.
struct Handshake {
    our_dh: DhKeyPair,
    our_keyid: u32,
    /// Set when we committed first.
    commitment: Option<Commitment>,
    /// The peer's `(AES_r(g^x), H(g^x))`, set when we responded to a commit.
    their_commitment: Option<(Vec<u8>, Vec<u8>)>,
    their_dh: Option<BigUint>,
    secrets: Option<AkeSecrets>,
    /// Last message sent, kept for retransmission.
    last_sent: Option<AkeMessage>,
}

impl Handshake {
    fn new(keyid: u32) -> Self {
        Self {
            our_dh: DhKeyPair::generate(),
            our_keyid: keyid,
            commitment: None,
            their_commitment: None,
            their_dh: None,
            secrets: None,
            last_sent: None,
        }
    }
}

/// The AKE state machine of one conversation.
#[derive(Default)]
pub struct Ake {
    state: AuthState,
    handshake: Option<Handshake>,
}

impl std::fmt::Debug for Ake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ake").field("state", &self.state).finish()
    }
}

impl Ake {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Whether a handshake is in flight.
    pub const fn in_progress(&self) -> bool {
        !matches!(self.state, AuthState::None)
    }

    /// Forget any handshake in flight.
    pub fn reset(&mut self) {
        self.state = AuthState::None;
        self.handshake = None;
    }

    /// Start a handshake as committer. Any attempt in flight is abandoned.
    pub fn initiate(&mut self, ctx: &AkeContext<'_>) -> Result<AkeMessage> {
        let mut handshake = Handshake::new(ctx.keyid);
        let mut r = [0u8; REVEAL_KEY_LEN];
        OsRng.fill_bytes(&mut r);

        let gx = encode_mpi(handshake.our_dh.public());
        let encrypted_gx = aes128_ctr(&r, [0; 8], &gx)?;
        let hashed_gx = sha256(&gx);
        let message = AkeMessage::DhCommit {
            encrypted_gx: encrypted_gx.clone(),
            hashed_gx: hashed_gx.to_vec(),
        };
        handshake.commitment = Some(Commitment {
            r,
            encrypted_gx,
            hashed_gx,
        });
        r.zeroize();
        handshake.last_sent = Some(message.clone());

        self.handshake = Some(handshake);
        self.state = AuthState::AwaitingDhKey;
        debug!(keyid = ctx.keyid, "AKE started");
        Ok(message)
    }

    /// Feed one inbound AKE message.
    pub fn handle(&mut self, ctx: &AkeContext<'_>, message: AkeMessage) -> AkeStep {
        let kind = message.kind();
        let step = match message {
            AkeMessage::DhCommit {
                encrypted_gx,
                hashed_gx,
            } => self.on_commit(ctx, encrypted_gx, hashed_gx),
            AkeMessage::DhKey { gy } => self.on_dh_key(ctx, gy),
            AkeMessage::RevealSignature {
                revealed_key,
                encrypted_signature,
                mac,
            } => self.on_reveal(ctx, &revealed_key, &encrypted_signature, &mac),
            AkeMessage::Signature {
                encrypted_signature,
                mac,
            } => self.on_signature(&encrypted_signature, &mac),
        };

        match &step {
            AkeStep::Ignore => trace!(?kind, state = ?self.state, "AKE message ignored"),
            AkeStep::Reply(reply) => trace!(?kind, reply = ?reply.kind(), state = ?self.state, "AKE step"),
            AkeStep::Complete { .. } => info!("AKE completed"),
            AkeStep::Failed(e) => {
                debug!(?kind, error = %e, "AKE failed");
                self.reset();
            }
        }
        step
    }

    fn on_commit(&mut self, ctx: &AkeContext<'_>, encrypted_gx: Vec<u8>, hashed_gx: Vec<u8>) -> AkeStep {
        match (self.state, self.handshake.as_mut()) {
            (AuthState::AwaitingDhKey, Some(hs)) => {
                let ours = hs
                    .commitment
                    .as_ref()
                    .map(|c| BigUint::from_bytes_be(&c.hashed_gx));
                let theirs = BigUint::from_bytes_be(&hashed_gx);
                if ours.is_some_and(|ours| ours > theirs) {
                    // We win the crossing: the peer will answer our commit
                    return hs.last_sent.clone().map_or(AkeStep::Ignore, AkeStep::Reply);
                }
                self.respond_to_commit(ctx, encrypted_gx, hashed_gx)
            }
            (AuthState::AwaitingRevealSig, Some(hs)) => {
                // Our D-H Key may have been lost; answer with the same value
                hs.their_commitment = Some((encrypted_gx, hashed_gx));
                hs.last_sent.clone().map_or(AkeStep::Ignore, AkeStep::Reply)
            }
            _ => self.respond_to_commit(ctx, encrypted_gx, hashed_gx),
        }
    }

    fn respond_to_commit(
        &mut self,
        ctx: &AkeContext<'_>,
        encrypted_gx: Vec<u8>,
        hashed_gx: Vec<u8>,
    ) -> AkeStep {
        let mut handshake = Handshake::new(ctx.keyid);
        handshake.their_commitment = Some((encrypted_gx, hashed_gx));
        let reply = AkeMessage::DhKey {
            gy: handshake.our_dh.public().clone(),
        };
        handshake.last_sent = Some(reply.clone());
        self.handshake = Some(handshake);
        self.state = AuthState::AwaitingRevealSig;
        AkeStep::Reply(reply)
    }

    fn on_dh_key(&mut self, ctx: &AkeContext<'_>, gy: BigUint) -> AkeStep {
        match (self.state, self.handshake.as_mut()) {
            (AuthState::AwaitingDhKey, Some(hs)) => {
                if !check_group_element(&gy) {
                    return AkeStep::Failed(OtrError::IllegalGroupElement("D-H Key"));
                }
                if gy == *hs.our_dh.public() {
                    return AkeStep::Failed(OtrError::SelfReflection);
                }
                match reveal_signature(ctx, hs, gy) {
                    Ok(reply) => {
                        self.state = AuthState::AwaitingSig;
                        AkeStep::Reply(reply)
                    }
                    Err(e) => AkeStep::Failed(e),
                }
            }
            (AuthState::AwaitingSig, Some(hs)) => {
                if hs.their_dh.as_ref() == Some(&gy) {
                    // Our Reveal Signature may have been lost
                    hs.last_sent.clone().map_or(AkeStep::Ignore, AkeStep::Reply)
                } else {
                    AkeStep::Ignore
                }
            }
            _ => AkeStep::Ignore,
        }
    }

    fn on_reveal(
        &mut self,
        ctx: &AkeContext<'_>,
        revealed_key: &[u8],
        encrypted: &[u8],
        mac: &[u8; MAC_LEN],
    ) -> AkeStep {
        if self.state != AuthState::AwaitingRevealSig {
            return AkeStep::Ignore;
        }
        let Some(hs) = self.handshake.as_ref() else {
            return AkeStep::Ignore;
        };
        match accept_reveal(ctx, hs, revealed_key, encrypted, mac) {
            Ok((reply, success)) => {
                self.reset();
                AkeStep::Complete {
                    reply: Some(reply),
                    success: Box::new(success),
                }
            }
            Err(e) => AkeStep::Failed(e),
        }
    }

    fn on_signature(&mut self, encrypted: &[u8], mac: &[u8; MAC_LEN]) -> AkeStep {
        if self.state != AuthState::AwaitingSig {
            return AkeStep::Ignore;
        }
        let Some(hs) = self.handshake.as_ref() else {
            return AkeStep::Ignore;
        };
        match accept_signature(hs, encrypted, mac) {
            Ok(success) => {
                self.reset();
                AkeStep::Complete {
                    reply: None,
                    success: Box::new(success),
                }
            }
            Err(e) => AkeStep::Failed(e),
        }
    }
}

/// Committer, on D-H Key: compute the secret and prove our identity.
fn reveal_signature(ctx: &AkeContext<'_>, hs: &mut Handshake, gy: BigUint) -> Result<AkeMessage> {
    let commitment = hs
        .commitment
        .as_ref()
        .ok_or_else(|| OtrError::Malformed("no commitment outstanding".into()))?;
    let secrets = AkeSecrets::derive(&hs.our_dh.shared_secret(&gy));
    let (encrypted_signature, mac) = seal_signature(
        &secrets,
        Half::Reveal,
        ctx.identity,
        hs.our_dh.public(),
        &gy,
        hs.our_keyid,
    )?;
    let reply = AkeMessage::RevealSignature {
        revealed_key: commitment.r.to_vec(),
        encrypted_signature,
        mac,
    };
    hs.secrets = Some(secrets);
    hs.their_dh = Some(gy);
    hs.last_sent = Some(reply.clone());
    Ok(reply)
}

/// Responder, on Reveal Signature: open the commitment, verify, and answer.
fn accept_reveal(
    ctx: &AkeContext<'_>,
    hs: &Handshake,
    revealed_key: &[u8],
    encrypted: &[u8],
    mac: &[u8; MAC_LEN],
) -> Result<(AkeMessage, AkeSuccess)> {
    let (their_encrypted_gx, their_hashed_gx) = hs
        .their_commitment
        .as_ref()
        .ok_or_else(|| OtrError::Malformed("no commitment received".into()))?;
    if revealed_key.len() != REVEAL_KEY_LEN {
        return Err(OtrError::Malformed(format!(
            "revealed key of {} bytes",
            revealed_key.len()
        )));
    }

    let gx_mpi = aes128_ctr(revealed_key, [0; 8], their_encrypted_gx)?;
    if !constant_time_eq(&sha256(&gx_mpi), their_hashed_gx) {
        return Err(OtrError::CommitmentMismatch);
    }
    let mut r = Reader::new(&gx_mpi);
    let gx = r.mpi()?;
    r.finish()?;
    if !check_group_element(&gx) {
        return Err(OtrError::IllegalGroupElement("D-H Commit"));
    }
    if gx == *hs.our_dh.public() {
        return Err(OtrError::SelfReflection);
    }

    let secrets = AkeSecrets::derive(&hs.our_dh.shared_secret(&gx));
    let (their_identity, their_keyid) = open_signature(
        &secrets,
        Half::Reveal,
        encrypted,
        mac,
        &gx,
        hs.our_dh.public(),
    )?;
    let (encrypted_signature, mac) = seal_signature(
        &secrets,
        Half::Final,
        ctx.identity,
        hs.our_dh.public(),
        &gx,
        hs.our_keyid,
    )?;

    let success = AkeSuccess {
        ssid: secrets.ssid,
        our_dh: hs.our_dh.clone(),
        our_keyid: hs.our_keyid,
        their_dh: gx,
        their_keyid,
        their_identity,
        sent_reveal: false,
    };
    Ok((
        AkeMessage::Signature {
            encrypted_signature,
            mac,
        },
        success,
    ))
}

/// Committer, on Signature: verify the responder's identity.
fn accept_signature(hs: &Handshake, encrypted: &[u8], mac: &[u8; MAC_LEN]) -> Result<AkeSuccess> {
    let (Some(secrets), Some(gy)) = (hs.secrets.as_ref(), hs.their_dh.clone()) else {
        return Err(OtrError::Malformed("no shared secret yet".into()));
    };
    let (their_identity, their_keyid) =
        open_signature(secrets, Half::Final, encrypted, mac, &gy, hs.our_dh.public())?;
    Ok(AkeSuccess {
        ssid: secrets.ssid,
        our_dh: hs.our_dh.clone(),
        our_keyid: hs.our_keyid,
        their_dh: gy,
        their_keyid,
        their_identity,
        sent_reveal: true,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use murmur_crypto::test_parameters;

    fn identities() -> (IdentityKeyPair, IdentityKeyPair) {
        let params = test_parameters().unwrap();
        (
            IdentityKeyPair::generate(&params),
            IdentityKeyPair::generate(&params),
        )
    }

    fn ctx(identity: &IdentityKeyPair) -> AkeContext<'_> {
        AkeContext { identity, keyid: 1 }
    }

    fn expect_reply(step: AkeStep) -> AkeMessage {
        match step {
            AkeStep::Reply(m) => m,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    /// Runs the four-message exchange and returns both results.
    fn handshake(bob_id: &IdentityKeyPair, alice_id: &IdentityKeyPair) -> (AkeSuccess, AkeSuccess) {
        let mut bob = Ake::new();
        let mut alice = Ake::new();
        let commit = bob.initiate(&ctx(bob_id)).unwrap();
        let dh_key = expect_reply(alice.handle(&ctx(alice_id), commit));
        let reveal = expect_reply(bob.handle(&ctx(bob_id), dh_key));
        let AkeStep::Complete {
            reply: Some(signature),
            success: alice_result,
        } = alice.handle(&ctx(alice_id), reveal)
        else {
            panic!("alice did not complete");
        };
        let AkeStep::Complete {
            reply: None,
            success: bob_result,
        } = bob.handle(&ctx(bob_id), signature)
        else {
            panic!("bob did not complete");
        };
        assert_eq!(alice.state(), AuthState::None);
        assert_eq!(bob.state(), AuthState::None);
        (*bob_result, *alice_result)
    }

    #[test]
    fn full_exchange_agrees_on_ssid_and_identities() {
        let (bob_id, alice_id) = identities();
        let (bob, alice) = handshake(&bob_id, &alice_id);
        assert_eq!(bob.ssid, alice.ssid);
        assert_eq!(bob.their_dh, *alice.our_dh.public());
        assert_eq!(alice.their_dh, *bob.our_dh.public());
        assert_eq!(&bob.their_identity, alice_id.public());
        assert_eq!(&alice.their_identity, bob_id.public());
        assert!(bob.sent_reveal);
        assert!(!alice.sent_reveal);
    }

    #[test]
    fn message_bodies_parse_back() {
        let (bob_id, _) = identities();
        let mut bob = Ake::new();
        let commit = bob.initiate(&ctx(&bob_id)).unwrap();
        let mut w = Writer::new();
        commit.write_body(&mut w);
        assert_eq!(
            AkeMessage::read_body(MessageType::DhCommit, w.as_bytes()).unwrap(),
            commit
        );
        assert!(AkeMessage::read_body(MessageType::DhKey, w.as_bytes()).is_err());
    }

    #[test]
    fn crossing_commits_resolve_to_one_exchange() {
        let (bob_id, alice_id) = identities();
        let mut bob = Ake::new();
        let mut alice = Ake::new();
        let bob_commit = bob.initiate(&ctx(&bob_id)).unwrap();
        let alice_commit = alice.initiate(&ctx(&alice_id)).unwrap();

        let hash = |m: &AkeMessage| match m {
            AkeMessage::DhCommit { hashed_gx, .. } => BigUint::from_bytes_be(hashed_gx),
            _ => unreachable!(),
        };
        let bob_wins = hash(&bob_commit) > hash(&alice_commit);

        let to_alice = alice.handle(&ctx(&alice_id), bob_commit.clone());
        let to_bob = bob.handle(&ctx(&bob_id), alice_commit.clone());
        let (winner_reply, loser_reply) = if bob_wins {
            (to_bob, to_alice)
        } else {
            (to_alice, to_bob)
        };
        // The winner repeats its commit, the loser answers with a D-H Key
        assert!(matches!(expect_reply(winner_reply), AkeMessage::DhCommit { .. }));
        assert!(matches!(expect_reply(loser_reply), AkeMessage::DhKey { .. }));

        let (winner, loser, winner_id, loser_id) = if bob_wins {
            (&mut bob, &mut alice, &bob_id, &alice_id)
        } else {
            (&mut alice, &mut bob, &alice_id, &bob_id)
        };
        assert_eq!(winner.state(), AuthState::AwaitingDhKey);
        assert_eq!(loser.state(), AuthState::AwaitingRevealSig);

        // The loser's D-H Key already answers the winner's original commit
        let AkeStep::Reply(dh_key) = loser.handle(
            &ctx(loser_id),
            if bob_wins { bob_commit } else { alice_commit },
        ) else {
            panic!("loser should retransmit its D-H Key");
        };
        let reveal = expect_reply(winner.handle(&ctx(winner_id), dh_key));
        let AkeStep::Complete {
            reply: Some(signature),
            success: loser_result,
        } = loser.handle(&ctx(loser_id), reveal)
        else {
            panic!("loser did not complete");
        };
        let AkeStep::Complete {
            success: winner_result,
            ..
        } = winner.handle(&ctx(winner_id), signature)
        else {
            panic!("winner did not complete");
        };
        assert_eq!(winner_result.ssid, loser_result.ssid);
    }

    #[test]
    fn duplicate_dh_key_retransmits_reveal_signature() {
        let (bob_id, alice_id) = identities();
        let mut bob = Ake::new();
        let mut alice = Ake::new();
        let commit = bob.initiate(&ctx(&bob_id)).unwrap();
        let dh_key = expect_reply(alice.handle(&ctx(&alice_id), commit));
        let first = expect_reply(bob.handle(&ctx(&bob_id), dh_key.clone()));
        let again = expect_reply(bob.handle(&ctx(&bob_id), dh_key));
        assert_eq!(first, again);

        let other = AkeMessage::DhKey {
            gy: DhKeyPair::generate().public().clone(),
        };
        assert!(matches!(bob.handle(&ctx(&bob_id), other), AkeStep::Ignore));
        assert_eq!(bob.state(), AuthState::AwaitingSig);
    }

    #[test]
    fn commit_while_awaiting_signature_restarts_as_responder() {
        let (bob_id, alice_id) = identities();
        let mut bob = Ake::new();
        let mut alice = Ake::new();
        let commit = bob.initiate(&ctx(&bob_id)).unwrap();
        let dh_key = expect_reply(alice.handle(&ctx(&alice_id), commit));
        expect_reply(bob.handle(&ctx(&bob_id), dh_key));

        let fresh_commit = Ake::new().initiate(&ctx(&alice_id)).unwrap();
        let reply = expect_reply(bob.handle(&ctx(&bob_id), fresh_commit));
        assert!(matches!(reply, AkeMessage::DhKey { .. }));
        assert_eq!(bob.state(), AuthState::AwaitingRevealSig);
    }

    #[test]
    fn tampered_reveal_signature_aborts_to_none() {
        let (bob_id, alice_id) = identities();
        let mut bob = Ake::new();
        let mut alice = Ake::new();
        let commit = bob.initiate(&ctx(&bob_id)).unwrap();
        let dh_key = expect_reply(alice.handle(&ctx(&alice_id), commit));
        let AkeMessage::RevealSignature {
            revealed_key,
            mut encrypted_signature,
            mac,
        } = expect_reply(bob.handle(&ctx(&bob_id), dh_key))
        else {
            panic!("expected reveal signature");
        };
        encrypted_signature[3] ^= 0x80;
        let tampered = AkeMessage::RevealSignature {
            revealed_key: revealed_key.clone(),
            encrypted_signature: encrypted_signature.clone(),
            mac,
        };
        assert!(matches!(
            alice.handle(&ctx(&alice_id), tampered),
            AkeStep::Failed(OtrError::BadMac)
        ));
        assert_eq!(alice.state(), AuthState::None);

        // The attempt is gone: even the genuine message is now out of state
        encrypted_signature[3] ^= 0x80;
        let genuine = AkeMessage::RevealSignature {
            revealed_key,
            encrypted_signature,
            mac,
        };
        assert!(matches!(
            alice.handle(&ctx(&alice_id), genuine),
            AkeStep::Ignore
        ));
        assert_eq!(alice.state(), AuthState::None);
    }

    #[test]
    fn wrong_revealed_key_breaks_the_commitment() {
        let (bob_id, alice_id) = identities();
        let mut bob = Ake::new();
        let mut alice = Ake::new();
        let commit = bob.initiate(&ctx(&bob_id)).unwrap();
        let dh_key = expect_reply(alice.handle(&ctx(&alice_id), commit));
        let AkeMessage::RevealSignature {
            encrypted_signature,
            mac,
            ..
        } = expect_reply(bob.handle(&ctx(&bob_id), dh_key))
        else {
            panic!("expected reveal signature");
        };
        let forged = AkeMessage::RevealSignature {
            revealed_key: vec![0x42; REVEAL_KEY_LEN],
            encrypted_signature,
            mac,
        };
        assert!(matches!(
            alice.handle(&ctx(&alice_id), forged),
            AkeStep::Failed(OtrError::CommitmentMismatch)
        ));
        assert_eq!(alice.state(), AuthState::None);
    }

    #[test]
    fn illegal_dh_key_is_rejected() {
        let (bob_id, _) = identities();
        let mut bob = Ake::new();
        bob.initiate(&ctx(&bob_id)).unwrap();
        let bogus = AkeMessage::DhKey {
            gy: BigUint::from(1u32),
        };
        assert!(matches!(
            bob.handle(&ctx(&bob_id), bogus),
            AkeStep::Failed(OtrError::IllegalGroupElement(_))
        ));
        assert_eq!(bob.state(), AuthState::None);
    }

    #[test]
    fn echoed_dh_value_is_refused_before_replying() {
        let (bob_id, _) = identities();
        let mut bob = Ake::new();
        bob.initiate(&ctx(&bob_id)).unwrap();
        let ours = bob.handshake.as_ref().unwrap().our_dh.public().clone();
        assert!(matches!(
            bob.handle(&ctx(&bob_id), AkeMessage::DhKey { gy: ours }),
            AkeStep::Failed(OtrError::SelfReflection)
        ));
        assert_eq!(bob.state(), AuthState::None);
    }

    #[test]
    fn out_of_state_messages_are_ignored() {
        let (bob_id, _) = identities();
        let mut bob = Ake::new();
        let signature = AkeMessage::Signature {
            encrypted_signature: vec![1, 2, 3],
            mac: [0; MAC_LEN],
        };
        assert!(matches!(bob.handle(&ctx(&bob_id), signature), AkeStep::Ignore));
        let dh_key = AkeMessage::DhKey {
            gy: DhKeyPair::generate().public().clone(),
        };
        assert!(matches!(bob.handle(&ctx(&bob_id), dh_key), AkeStep::Ignore));
        assert_eq!(bob.state(), AuthState::None);
    }
}
