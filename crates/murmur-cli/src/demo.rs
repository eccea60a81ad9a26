//! Loopback session between two in-process conversations.
//!
//! Each side's outgoing strings go through its own [`OutboundPacer`] onto a
//! channel read by the other side. The script: Alice queries, sends her
//! messages once encrypted, runs SMP against Bob and ends the session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use murmur_core::Config;
use murmur_crypto::{DsaParameters, IdentityKeyPair};
use murmur_otr::{Conversation, Event, OutboundPacer, Outcome, SmpEvent, Status};

const WIRE_CAPACITY: usize = 64;
const DEMO_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DemoOptions {
    pub config: Config,
    pub alice_secret: String,
    pub bob_secret: String,
    pub question: Option<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Who {
    Alice,
    Bob,
}

struct Side {
    name: &'static str,
    conv: Conversation,
    pacer: OutboundPacer,
    secret: Vec<u8>,
}

impl Side {
    /// Hand outgoing strings to the pacer; return the events.
    fn dispatch(&self, out: Outcome) -> anyhow::Result<Vec<Event>> {
        for piece in &out.outgoing {
            debug!(side = self.name, len = piece.len(), "Outgoing");
        }
        self.pacer.enqueue(out.outgoing)?;
        Ok(out.events)
    }
}

/// What the script has seen so far.
#[derive(Default)]
struct Script {
    trust: Vec<(Who, bool)>,
    finished: bool,
}

pub async fn run(opts: DemoOptions) -> anyhow::Result<()> {
    info!("Generating DSA parameters for both identities");
    let params = DsaParameters::generate_async().await?;
    let alice_id = IdentityKeyPair::generate_async(Some(params.clone())).await?;
    let bob_id = IdentityKeyPair::generate_async(Some(params)).await?;

    let interval = opts.config.fragments.send_interval();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (to_bob, mut bob_inbox) = mpsc::channel::<String>(WIRE_CAPACITY);
    let (to_alice, mut alice_inbox) = mpsc::channel::<String>(WIRE_CAPACITY);
    let (alice_pacer, alice_task) = OutboundPacer::spawn(interval, to_bob, shutdown_rx.clone());
    let (bob_pacer, bob_task) = OutboundPacer::spawn(interval, to_alice, shutdown_rx);

    let mut alice = Side {
        name: "alice",
        conv: Conversation::new(Arc::new(alice_id), &opts.config),
        pacer: alice_pacer,
        secret: opts.alice_secret.into_bytes(),
    };
    let mut bob = Side {
        name: "bob",
        conv: Conversation::new(Arc::new(bob_id), &opts.config),
        pacer: bob_pacer,
        secret: opts.bob_secret.into_bytes(),
    };
    report(&format!(
        "alice {}  bob {}",
        alice.conv.our_fingerprint(),
        bob.conv.our_fingerprint()
    ));

    let mut script = Script::default();
    let query = alice.conv.query();
    let events = alice.dispatch(query)?;
    react(Who::Alice, &mut alice, events, &opts.messages, opts.question.as_deref(), &mut script)?;

    let driven = tokio::time::timeout(DEMO_TIMEOUT, async {
        while !script.finished {
            let (who, side, raw) = tokio::select! {
                Some(raw) = bob_inbox.recv() => (Who::Bob, &mut bob, raw),
                Some(raw) = alice_inbox.recv() => (Who::Alice, &mut alice, raw),
                else => break,
            };
            let out = side.conv.receive(&raw);
            let events = side.dispatch(out)?;
            react(who, side, events, &opts.messages, opts.question.as_deref(), &mut script)?;
        }
        anyhow::Ok(())
    })
    .await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(alice_task, bob_task);
    driven.context("demo did not finish in time")??;

    for (who, matched) in &script.trust {
        let verdict = if *matched {
            "secrets match"
        } else {
            "secrets differ"
        };
        report(&format!("{who:?} SMP result: {verdict}"));
    }
    Ok(())
}

/// Drive the script forward from one side's events.
fn react(
    who: Who,
    side: &mut Side,
    events: Vec<Event>,
    messages: &[String],
    question: Option<&str>,
    script: &mut Script,
) -> anyhow::Result<()> {
    let mut queue: VecDeque<Event> = events.into();
    while let Some(event) = queue.pop_front() {
        let follow_up = match event {
            Event::Message { text, encrypted } => {
                let lock = if encrypted { "encrypted" } else { "plaintext" };
                report(&format!("{} received ({lock}): {text}", side.name));
                None
            }
            Event::Status(Status::AkeSucceeded) => {
                report(&format!(
                    "{} is encrypted; ssid {}",
                    side.name,
                    side.conv.ssid().map(format_ssid).unwrap_or_default()
                ));
                (who == Who::Alice).then(|| {
                    let mut out = Outcome::default();
                    for text in messages {
                        let sent = side.conv.send(text);
                        out.outgoing.extend(sent.outgoing);
                        out.events.extend(sent.events);
                    }
                    let smp = side.conv.smp_start(&side.secret, question);
                    out.outgoing.extend(smp.outgoing);
                    out.events.extend(smp.events);
                    out
                })
            }
            Event::Smp(SmpEvent::SecretRequested { question }) => {
                if let Some(q) = question {
                    report(&format!("{} was asked: {q}", side.name));
                }
                Some(side.conv.smp_answer(&side.secret))
            }
            Event::Smp(SmpEvent::Trust(matched)) => {
                script.trust.push((who, matched));
                (who == Who::Alice).then(|| side.conv.end())
            }
            Event::Smp(SmpEvent::Aborted) => {
                warn!(side = side.name, "SMP aborted");
                None
            }
            Event::Status(Status::PeerEndedSession) => {
                report(&format!("{} saw the peer end the session", side.name));
                script.finished = true;
                Some(side.conv.end())
            }
            Event::Status(status) => {
                debug!(side = side.name, ?status, "Status");
                None
            }
            Event::ExtraSymmetricKey { use_code, .. } => {
                info!(side = side.name, use_code, "Extra symmetric key offered");
                None
            }
            Event::Warning(text) => {
                warn!(side = side.name, %text, "Protocol warning");
                None
            }
            Event::Error(e) => {
                warn!(side = side.name, error = %e, "Protocol error");
                None
            }
        };
        if let Some(out) = follow_up {
            queue.extend(side.dispatch(out)?);
        }
    }
    Ok(())
}

fn format_ssid(ssid: [u8; 8]) -> String {
    ssid.iter().map(|b| format!("{b:02x}")).collect()
}

#[allow(clippy::print_stdout)]
fn report(line: &str) {
    println!("{line}");
}
