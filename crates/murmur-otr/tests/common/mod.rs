//! Loopback harness: two conversations joined by an in-memory transport.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::collections::VecDeque;
use std::sync::Arc;

use murmur_core::Config;
use murmur_crypto::{IdentityKeyPair, test_parameters};
use murmur_otr::{Conversation, Event, Framer, Inbound, MessageType, OtrError, Outcome, SmpEvent, Status};

/// One end of the link and everything it has reported so far.
pub struct Peer {
    pub conv: Conversation,
    pub events: Vec<Event>,
    /// Strings this peer handed to the transport, in order.
    pub sent: Vec<String>,
}

impl Peer {
    fn new(config: &Config) -> Self {
        let params = test_parameters().unwrap();
        let identity = Arc::new(IdentityKeyPair::generate(&params));
        Self {
            conv: Conversation::new(identity, config),
            events: Vec::new(),
            sent: Vec::new(),
        }
    }

    pub fn messages(&self) -> Vec<(String, bool)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Message { text, encrypted } => Some((text.clone(), *encrypted)),
                _ => None,
            })
            .collect()
    }

    pub fn has_status(&self, status: Status) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, Event::Status(s) if *s == status))
    }

    pub fn errors(&self) -> Vec<&OtrError> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    pub fn smp_events(&self) -> Vec<SmpEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Smp(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.sent.clear();
    }
}

pub struct Link {
    pub alice: Peer,
    pub bob: Peer,
    to_alice: VecDeque<String>,
    to_bob: VecDeque<String>,
}

impl Link {
    pub fn new() -> Self {
        Self::with_configs(&Config::default(), &Config::default())
    }

    pub fn with_configs(alice: &Config, bob: &Config) -> Self {
        Self {
            alice: Peer::new(alice),
            bob: Peer::new(bob),
            to_alice: VecDeque::new(),
            to_bob: VecDeque::new(),
        }
    }

    /// Record what Alice's operation produced; her outgoing strings head to Bob.
    pub fn from_alice(&mut self, out: Outcome) {
        self.alice.events.extend(out.events);
        self.alice.sent.extend(out.outgoing.iter().cloned());
        self.to_bob.extend(out.outgoing);
    }

    pub fn from_bob(&mut self, out: Outcome) {
        self.bob.events.extend(out.events);
        self.bob.sent.extend(out.outgoing.iter().cloned());
        self.to_alice.extend(out.outgoing);
    }

    /// Take the next string in flight to Bob without delivering it.
    pub fn intercept_to_bob(&mut self) -> Option<String> {
        self.to_bob.pop_front()
    }

    pub fn intercept_to_alice(&mut self) -> Option<String> {
        self.to_alice.pop_front()
    }

    pub fn deliver_to_bob(&mut self, raw: &str) {
        let out = self.bob.conv.receive(raw);
        self.from_bob(out);
    }

    pub fn deliver_to_alice(&mut self, raw: &str) {
        let out = self.alice.conv.receive(raw);
        self.from_alice(out);
    }

    /// Deliver everything in flight, alternating directions, until quiet.
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            let mut moved = false;
            if let Some(raw) = self.to_bob.pop_front() {
                self.deliver_to_bob(&raw);
                moved = true;
            }
            if let Some(raw) = self.to_alice.pop_front() {
                self.deliver_to_alice(&raw);
                moved = true;
            }
            if !moved {
                return;
            }
        }
        panic!("link did not go quiet");
    }

    /// Alice queries and both sides run the AKE to completion.
    pub fn establish(&mut self) {
        let out = self.alice.conv.query();
        self.from_alice(out);
        self.pump();
    }
}

/// AKE message types in a list of transport strings, skipping anything else.
pub fn ake_types(sent: &[String]) -> Vec<MessageType> {
    let mut framer = Framer::new(0);
    sent.iter()
        .filter_map(|raw| match framer.classify(raw) {
            Inbound::Ake(envelope) => Some(envelope.header.kind),
            _ => None,
        })
        .collect()
}
