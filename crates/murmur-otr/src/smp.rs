//! Socialist Millionaires' Protocol: checks that both users know the same
//! secret without revealing anything else about it.
//!
//! Four TLV messages run inside the encrypted session. Every group element
//! is range-checked and every zero-knowledge proof verified; any failure
//! aborts the round, tells the peer, and reports the secrets as unequal.
//!
//! ```text
//! Alice (initiator)                          Bob
//!  | -- SMP1  g2a, g3a + proofs ----------->  |   (Bob supplies his secret)
//!  | <- SMP2  g2b, g3b, Pb, Qb + proofs ----  |
//!  | -- SMP3  Pa, Qa, Ra + proofs --------->  |   Bob learns the result
//!  | <- SMP4  Rb + proof -------------------  |   Alice learns the result
//! ```

use murmur_crypto::dh::{
    check_exponent, divide_mod_p, g_pow, mod_pow, mul_mod_p, mul_mod_q, random_exponent, sub_mod_q,
};
use murmur_crypto::hash::{sha256, sha256_parts};
use murmur_crypto::{BigUint, Fingerprint, Reader, Writer, check_group_element};
use tracing::{debug, info, warn};

use crate::error::{OtrError, Result};
use crate::tlv::{TLV_SMP_ABORT, TLV_SMP1, TLV_SMP1Q, TLV_SMP2, TLV_SMP3, TLV_SMP4, Tlv};

/// Bit length of the random exponents.
const EXPONENT_BITS: usize = 1536;

/// Version byte mixed into the secret hash.
const SECRET_VERSION: u8 = 0x01;

const SMP1_FIELDS: u32 = 6;
const SMP2_FIELDS: u32 = 11;
const SMP3_FIELDS: u32 = 8;
const SMP4_FIELDS: u32 = 3;

/// Which SMP message the engine will accept next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpState {
    /// Idle: waiting for the peer to start a round.
    Expect1,
    /// The peer started a round; waiting for our own secret.
    Expect0,
    Expect2,
    Expect3,
    Expect4,
}

/// What the user learns from an SMP step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpEvent {
    /// The peer started a round; answer with [`crate::Conversation::smp_answer`].
    SecretRequested { question: Option<String> },
    /// The round finished. `true` means both secrets matched.
    Trust(bool),
    /// The round was abandoned by either side.
    Aborted,
}

/// Reply and/or event produced by one SMP step.
#[derive(Debug)]
pub struct SmpStep {
    pub reply: Option<Tlv>,
    pub event: Option<SmpEvent>,
}

impl SmpStep {
    const fn ignore() -> Self {
        Self {
            reply: None,
            event: None,
        }
    }
}

/// The identity binding mixed into the secret: both fingerprints and the session id.
#[derive(Debug, Clone, Copy)]
pub struct SmpContext {
    pub our_fingerprint: Fingerprint,
    pub their_fingerprint: Fingerprint,
    pub ssid: [u8; 8],
}

/// Per-round state; each variant holds exactly what the next step needs.
enum Progress {
    Idle,
    AwaitingSecret {
        g2a: BigUint,
        g3a: BigUint,
    },
    Expect2 {
        secret: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        pb: BigUint,
        qb: BigUint,
    },
    Expect4 {
        g3b: BigUint,
        pab: BigUint,
        qab: BigUint,
        a3: BigUint,
    },
}

/// SMP engine for one encrypted session.
pub struct Smp {
    progress: Progress,
}

impl Default for Smp {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Smp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Smp").field("state", &self.state()).finish()
    }
}

/// `SHA256(version || MPI(a) [|| MPI(b)])` as an integer.
fn hash(version: u8, a: &BigUint, b: Option<&BigUint>) -> BigUint {
    let mut w = Writer::new();
    w.byte(version).mpi(a);
    if let Some(b) = b {
        w.mpi(b);
    }
    BigUint::from_bytes_be(&sha256(w.as_bytes()))
}

/// Schnorr proof of knowledge of `x` with `g^x` public: `(c, r - x*c)`.
fn prove_log(version: u8, x: &BigUint) -> (BigUint, BigUint) {
    let r = random_exponent(EXPONENT_BITS);
    let c = hash(version, &g_pow(&r), None);
    let d = sub_mod_q(&r, &mul_mod_q(x, &c));
    (c, d)
}

fn verify_log(version: u8, public: &BigUint, c: &BigUint, d: &BigUint) -> bool {
    let commitment = mul_mod_p(&g_pow(d), &mod_pow(public, c));
    hash(version, &commitment, None) == *c
}

fn encode(fields: &[&BigUint]) -> Vec<u8> {
    let mut w = Writer::new();
    #[allow(clippy::cast_possible_truncation)] // at most 11 fields
    w.int(fields.len() as u32);
    for field in fields {
        w.mpi(field);
    }
    w.into_bytes()
}

fn decode(payload: &[u8], expected: u32) -> Result<Vec<BigUint>> {
    let mut r = Reader::new(payload);
    let count = r.int()?;
    if count != expected {
        return Err(OtrError::Malformed(format!(
            "SMP message with {count} fields, expected {expected}"
        )));
    }
    let fields = (0..count).map(|_| r.mpi()).collect::<std::result::Result<Vec<_>, _>>()?;
    r.finish()?;
    Ok(fields)
}

fn require_elements(fields: &[&BigUint]) -> Result<()> {
    if fields.iter().all(|x| check_group_element(x)) {
        Ok(())
    } else {
        Err(OtrError::IllegalGroupElement("SMP message"))
    }
}

fn require_exponents(fields: &[&BigUint]) -> Result<()> {
    if fields.iter().all(|x| check_exponent(x)) {
        Ok(())
    } else {
        Err(OtrError::Malformed("SMP exponent out of range".into()))
    }
}

fn require_proof(ok: bool, what: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(OtrError::Malformed(format!("SMP proof failed: {what}")))
    }
}

/// The user's secret bound to both identities and the session.
fn secret_exponent(
    initiator: &Fingerprint,
    responder: &Fingerprint,
    ssid: &[u8; 8],
    secret: &[u8],
) -> BigUint {
    BigUint::from_bytes_be(&sha256_parts(&[
        &[SECRET_VERSION],
        initiator.as_bytes(),
        responder.as_bytes(),
        ssid,
        secret,
    ]))
}

impl Smp {
    pub const fn new() -> Self {
        Self {
            progress: Progress::Idle,
        }
    }

    pub const fn state(&self) -> SmpState {
        match self.progress {
            Progress::Idle => SmpState::Expect1,
            Progress::AwaitingSecret { .. } => SmpState::Expect0,
            Progress::Expect2 { .. } => SmpState::Expect2,
            Progress::Expect3 { .. } => SmpState::Expect3,
            Progress::Expect4 { .. } => SmpState::Expect4,
        }
    }

    /// Whether a round is in progress or waiting for our secret.
    pub const fn in_progress(&self) -> bool {
        !matches!(self.progress, Progress::Idle)
    }

    /// Start a round as initiator. Any round in progress is replaced; the
    /// caller tells the peer to drop it with an abort ahead of this TLV.
    pub fn initiate(
        &mut self,
        ctx: &SmpContext,
        secret: &[u8],
        question: Option<&str>,
    ) -> Result<Tlv> {
        if question.is_some_and(|q| q.contains('\0')) {
            return Err(OtrError::EmbeddedNul("SMP question"));
        }
        if self.in_progress() {
            debug!(state = ?self.state(), "SMP restarted locally");
        }
        let x = secret_exponent(&ctx.our_fingerprint, &ctx.their_fingerprint, &ctx.ssid, secret);
        let a2 = random_exponent(EXPONENT_BITS);
        let a3 = random_exponent(EXPONENT_BITS);
        let g2a = g_pow(&a2);
        let g3a = g_pow(&a3);
        let (c2, d2) = prove_log(1, &a2);
        let (c3, d3) = prove_log(2, &a3);

        let body = encode(&[&g2a, &c2, &d2, &g3a, &c3, &d3]);
        self.progress = Progress::Expect2 { secret: x, a2, a3 };
        info!(with_question = question.is_some(), "SMP started");

        Ok(match question {
            Some(q) => {
                let mut value = q.as_bytes().to_vec();
                value.push(0);
                value.extend_from_slice(&body);
                Tlv::new(TLV_SMP1Q, value)
            }
            None => Tlv::new(TLV_SMP1, body),
        })
    }

    /// Supply our secret after the peer started a round.
    pub fn respond(&mut self, ctx: &SmpContext, secret: &[u8]) -> Result<Tlv> {
        if !matches!(self.progress, Progress::AwaitingSecret { .. }) {
            return Err(OtrError::SmpNotAwaitingSecret);
        }
        let Progress::AwaitingSecret { g2a, g3a } =
            std::mem::replace(&mut self.progress, Progress::Idle)
        else {
            return Err(OtrError::SmpNotAwaitingSecret);
        };
        // The peer initiated: their fingerprint comes first
        let y = secret_exponent(&ctx.their_fingerprint, &ctx.our_fingerprint, &ctx.ssid, secret);

        let b2 = random_exponent(EXPONENT_BITS);
        let b3 = random_exponent(EXPONENT_BITS);
        let g2b = g_pow(&b2);
        let g3b = g_pow(&b3);
        let (c2, d2) = prove_log(3, &b2);
        let (c3, d3) = prove_log(4, &b3);

        let g2 = mod_pow(&g2a, &b2);
        let g3 = mod_pow(&g3a, &b3);

        let r4 = random_exponent(EXPONENT_BITS);
        let pb = mod_pow(&g3, &r4);
        let qb = mul_mod_p(&g_pow(&r4), &mod_pow(&g2, &y));

        let r5 = random_exponent(EXPONENT_BITS);
        let r6 = random_exponent(EXPONENT_BITS);
        let cp = hash(
            5,
            &mod_pow(&g3, &r5),
            Some(&mul_mod_p(&g_pow(&r5), &mod_pow(&g2, &r6))),
        );
        let d5 = sub_mod_q(&r5, &mul_mod_q(&r4, &cp));
        let d6 = sub_mod_q(&r6, &mul_mod_q(&y, &cp));

        let body = encode(&[&g2b, &c2, &d2, &g3b, &c3, &d3, &pb, &qb, &cp, &d5, &d6]);
        self.progress = Progress::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        };
        Ok(Tlv::new(TLV_SMP2, body))
    }

    /// Abandon the round. Returns the abort TLV to send.
    pub fn abort(&mut self) -> Tlv {
        self.progress = Progress::Idle;
        Tlv::empty(TLV_SMP_ABORT)
    }

    /// Feed one SMP TLV from the peer.
    ///
    /// Messages that do not fit the current state are dropped without a
    /// reply; malformed ones or failed proofs abort the round.
    pub fn handle(&mut self, tlv: &Tlv) -> SmpStep {
        let result = match (tlv.kind, self.state()) {
            (TLV_SMP_ABORT, _) => {
                self.progress = Progress::Idle;
                info!("SMP aborted by peer");
                return SmpStep {
                    reply: None,
                    event: Some(SmpEvent::Aborted),
                };
            }
            (TLV_SMP1 | TLV_SMP1Q, SmpState::Expect1) => self.on_smp1(tlv),
            (TLV_SMP2, SmpState::Expect2) => self.on_smp2(&tlv.value),
            (TLV_SMP3, SmpState::Expect3) => self.on_smp3(&tlv.value),
            (TLV_SMP4, SmpState::Expect4) => self.on_smp4(&tlv.value),
            (kind, _) => {
                debug!(kind, state = ?self.state(), "SMP message out of sequence");
                return SmpStep::ignore();
            }
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "SMP verification failed; aborting round");
            SmpStep {
                reply: Some(self.abort()),
                event: Some(SmpEvent::Trust(false)),
            }
        })
    }

    fn on_smp1(&mut self, tlv: &Tlv) -> Result<SmpStep> {
        let (question, payload) = if tlv.kind == TLV_SMP1Q {
            let nul = tlv
                .value
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| OtrError::Malformed("SMP question is not terminated".into()))?;
            (
                Some(String::from_utf8_lossy(&tlv.value[..nul]).into_owned()),
                &tlv.value[nul + 1..],
            )
        } else {
            (None, &tlv.value[..])
        };

        let f = decode(payload, SMP1_FIELDS)?;
        let [g2a, c2, d2, g3a, c3, d3] = &f[..] else {
            return Err(OtrError::Malformed("SMP field count".into()));
        };
        require_elements(&[g2a, g3a])?;
        require_exponents(&[d2, d3])?;
        require_proof(verify_log(1, g2a, c2, d2), "g2a")?;
        require_proof(verify_log(2, g3a, c3, d3), "g3a")?;

        self.progress = Progress::AwaitingSecret {
            g2a: g2a.clone(),
            g3a: g3a.clone(),
        };
        info!(with_question = question.is_some(), "SMP requested by peer");
        Ok(SmpStep {
            reply: None,
            event: Some(SmpEvent::SecretRequested { question }),
        })
    }

    fn on_smp2(&mut self, payload: &[u8]) -> Result<SmpStep> {
        let Progress::Expect2 { secret, a2, a3 } = &self.progress else {
            return Ok(SmpStep::ignore());
        };
        let f = decode(payload, SMP2_FIELDS)?;
        let [g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6] = &f[..] else {
            return Err(OtrError::Malformed("SMP field count".into()));
        };
        require_elements(&[g2b, g3b, pb, qb])?;
        require_exponents(&[d2, d3, d5, d6])?;
        require_proof(verify_log(3, g2b, c2, d2), "g2b")?;
        require_proof(verify_log(4, g3b, c3, d3), "g3b")?;

        let g2 = mod_pow(g2b, a2);
        let g3 = mod_pow(g3b, a3);
        let check_cp = hash(
            5,
            &mul_mod_p(&mod_pow(&g3, d5), &mod_pow(pb, cp)),
            Some(&mul_mod_p(
                &mul_mod_p(&g_pow(d5), &mod_pow(&g2, d6)),
                &mod_pow(qb, cp),
            )),
        );
        require_proof(check_cp == *cp, "Pb/Qb")?;

        let r4 = random_exponent(EXPONENT_BITS);
        let pa = mod_pow(&g3, &r4);
        let qa = mul_mod_p(&g_pow(&r4), &mod_pow(&g2, secret));

        let r5 = random_exponent(EXPONENT_BITS);
        let r6 = random_exponent(EXPONENT_BITS);
        let cp_a = hash(
            6,
            &mod_pow(&g3, &r5),
            Some(&mul_mod_p(&g_pow(&r5), &mod_pow(&g2, &r6))),
        );
        let d5_a = sub_mod_q(&r5, &mul_mod_q(&r4, &cp_a));
        let d6_a = sub_mod_q(&r6, &mul_mod_q(secret, &cp_a));

        let pab = divide_mod_p(&pa, pb);
        let qab = divide_mod_p(&qa, qb);
        let ra = mod_pow(&qab, a3);

        let r7 = random_exponent(EXPONENT_BITS);
        let cr = hash(7, &g_pow(&r7), Some(&mod_pow(&qab, &r7)));
        let d7 = sub_mod_q(&r7, &mul_mod_q(a3, &cr));

        let body = encode(&[&pa, &qa, &cp_a, &d5_a, &d6_a, &ra, &cr, &d7]);
        self.progress = Progress::Expect4 {
            g3b: g3b.clone(),
            pab,
            qab,
            a3: a3.clone(),
        };
        Ok(SmpStep {
            reply: Some(Tlv::new(TLV_SMP3, body)),
            event: None,
        })
    }

    fn on_smp3(&mut self, payload: &[u8]) -> Result<SmpStep> {
        let Progress::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        } = &self.progress
        else {
            return Ok(SmpStep::ignore());
        };
        let f = decode(payload, SMP3_FIELDS)?;
        let [pa, qa, cp, d5, d6, ra, cr, d7] = &f[..] else {
            return Err(OtrError::Malformed("SMP field count".into()));
        };
        require_elements(&[pa, qa, ra])?;
        require_exponents(&[d5, d6, d7])?;

        let check_cp = hash(
            6,
            &mul_mod_p(&mod_pow(g3, d5), &mod_pow(pa, cp)),
            Some(&mul_mod_p(
                &mul_mod_p(&g_pow(d5), &mod_pow(g2, d6)),
                &mod_pow(qa, cp),
            )),
        );
        require_proof(check_cp == *cp, "Pa/Qa")?;

        let pab = divide_mod_p(pa, pb);
        let qab = divide_mod_p(qa, qb);
        let check_cr = hash(
            7,
            &mul_mod_p(&g_pow(d7), &mod_pow(g3a, cr)),
            Some(&mul_mod_p(&mod_pow(&qab, d7), &mod_pow(ra, cr))),
        );
        require_proof(check_cr == *cr, "Ra")?;

        let rb = mod_pow(&qab, b3);
        let r7 = random_exponent(EXPONENT_BITS);
        let cr_b = hash(8, &g_pow(&r7), Some(&mod_pow(&qab, &r7)));
        let d7_b = sub_mod_q(&r7, &mul_mod_q(b3, &cr_b));

        let rab = mod_pow(ra, b3);
        let matched = rab == pab;
        let body = encode(&[&rb, &cr_b, &d7_b]);

        self.progress = Progress::Idle;
        info!(matched, "SMP completed");
        Ok(SmpStep {
            reply: Some(Tlv::new(TLV_SMP4, body)),
            event: Some(SmpEvent::Trust(matched)),
        })
    }

    fn on_smp4(&mut self, payload: &[u8]) -> Result<SmpStep> {
        let Progress::Expect4 { g3b, pab, qab, a3 } = &self.progress else {
            return Ok(SmpStep::ignore());
        };
        let f = decode(payload, SMP4_FIELDS)?;
        let [rb, cr, d7] = &f[..] else {
            return Err(OtrError::Malformed("SMP field count".into()));
        };
        require_elements(&[rb])?;
        require_exponents(&[d7])?;

        let check_cr = hash(
            8,
            &mul_mod_p(&g_pow(d7), &mod_pow(g3b, cr)),
            Some(&mul_mod_p(&mod_pow(qab, d7), &mod_pow(rb, cr))),
        );
        require_proof(check_cr == *cr, "Rb")?;

        let rab = mod_pow(rb, a3);
        let matched = rab == *pab;

        self.progress = Progress::Idle;
        info!(matched, "SMP completed");
        Ok(SmpStep {
            reply: None,
            event: Some(SmpEvent::Trust(matched)),
        })
    }
}
