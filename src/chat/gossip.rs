//! Peer discovery: the candidate handshake and the pending-address queue.
//!
//! A new server-to-server stream accepted on the peer listener becomes the
//! *candidate*. We immediately send it every peer address we know
//! (`ALL_ADDRS`, chunked to the frame limit) and wait for it to answer with
//! its own listen address (`MY_ADDR`). Only one candidate may be outstanding;
//! the reactor stops accepting on the peer listener until the slot frees.
//!
//! ```text
//!   Accepted ──send ALL_ADDRS──▶ AddressesSent ──MY_ADDR──▶ Confirmed (promoted)
//!       │                              │
//!       └──── socket error / timeout ──┴──▶ Failed (dropped, slot freed)
//! ```
//!
//! Addresses learned from gossip that we are not connected to yet wait in
//! the pending queue; the reactor drains it every iteration and dials each.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

use super::message::{Message, PeerAddr};
use super::registry::ConnId;
use super::timer::Timer;

/// Progress of the outstanding candidate handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Accepted,
    AddressesSent,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: ConnId,
    state: HandshakeState,
}

#[derive(Debug)]
pub struct PeerDiscovery {
    self_addr: PeerAddr,
    pending: VecDeque<PeerAddr>,
    candidate: Option<Candidate>,
    handshake: Timer,
}

impl PeerDiscovery {
    pub fn new(self_addr: PeerAddr, handshake_timeout: Duration) -> Self {
        Self {
            self_addr,
            pending: VecDeque::new(),
            candidate: None,
            handshake: Timer::new(handshake_timeout),
        }
    }

    /// The listen address this node advertises in `MY_ADDR`.
    pub fn self_addr(&self) -> &PeerAddr {
        &self.self_addr
    }

    /// Queue every address not already connected, pending, or our own.
    /// Returns how many were newly queued.
    pub fn learn<I>(&mut self, addrs: I, connected: &[PeerAddr]) -> usize
    where
        I: IntoIterator<Item = PeerAddr>,
    {
        let mut queued = 0;
        for addr in addrs {
            if addr == self.self_addr || connected.contains(&addr) || self.pending.contains(&addr) {
                continue;
            }
            self.pending.push_back(addr);
            queued += 1;
        }
        queued
    }

    pub fn pending(&self) -> impl Iterator<Item = &PeerAddr> {
        self.pending.iter()
    }

    /// Drain the queue. A failed dial is not re-queued; the address comes
    /// back only if gossip mentions it again.
    pub fn take_pending(&mut self) -> Vec<PeerAddr> {
        self.pending.drain(..).collect()
    }

    pub fn candidate(&self) -> Option<ConnId> {
        self.candidate.map(|c| c.id)
    }

    /// Claim the candidate slot for `id` and arm the handshake timer.
    /// Returns `false` if another handshake is still outstanding.
    pub fn accept_candidate(&mut self, id: ConnId) -> bool {
        if self.candidate.is_some() {
            return false;
        }
        self.candidate = Some(Candidate {
            id,
            state: HandshakeState::Accepted,
        });
        self.handshake.start(None);
        true
    }

    pub fn addresses_sent(&mut self, id: ConnId) {
        if let Some(c) = self.candidate.as_mut().filter(|c| c.id == id) {
            c.state = HandshakeState::AddressesSent;
        }
    }

    /// The candidate confirmed its address; free the slot for promotion.
    /// Only valid once the address list has gone out.
    pub fn confirm(&mut self, id: ConnId) -> bool {
        let sent = self
            .candidate
            .is_some_and(|c| c.id == id && c.state == HandshakeState::AddressesSent);
        sent && self.release(id)
    }

    /// The candidate failed or timed out; free the slot.
    pub fn abandon(&mut self, id: ConnId) -> bool {
        self.release(id)
    }

    fn release(&mut self, id: ConnId) -> bool {
        if self.candidate() != Some(id) {
            return false;
        }
        self.candidate = None;
        self.handshake.reset();
        true
    }

    /// The candidate whose handshake has outlived its timeout, if any.
    pub fn expired_candidate(&self) -> Option<ConnId> {
        self.candidate
            .filter(|_| self.handshake.has_expired())
            .map(|c| c.id)
    }

    /// Time left on the outstanding handshake, if there is one.
    pub fn handshake_remaining(&self) -> Option<Duration> {
        self.handshake.remaining()
    }
}

/// Split `addrs` into `ALL_ADDRS` frames no longer than `max_len` bytes
/// (newline included). Always yields at least one frame.
pub fn address_frames(addrs: &[PeerAddr], max_len: usize) -> Vec<Message> {
    const HEAD: usize = "ALL_ADDRS".len() + 1; // + newline

    let mut frames = Vec::new();
    let mut chunk: Vec<PeerAddr> = Vec::new();
    let mut len = HEAD;

    for addr in addrs {
        let token = 1 + addr.host.len() + 1 + addr.port.to_string().len();
        if HEAD + token > max_len {
            warn!(%addr, "peer address too long for a single frame, not advertised");
            continue;
        }
        if len + token > max_len {
            frames.push(Message::AllAddrs(std::mem::take(&mut chunk)));
            len = HEAD;
        }
        chunk.push(addr.clone());
        len += token;
    }

    if !chunk.is_empty() || frames.is_empty() {
        frames.push(Message::AllAddrs(chunk));
    }
    frames
}
