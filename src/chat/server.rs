/// Reactor: the single task that owns all chat state and dispatches frames.
///
/// Connection tasks only move bytes. Everything else (registries, channel
/// membership, the candidate handshake, heartbeats) lives here and is touched
/// from one place, so no registry needs a lock. Broadcasts always iterate a
/// snapshot of their targets because a failed send closes the recipient
/// in-line, which mutates the very tables being walked.
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::ChannelRegistry;
use super::codec::{CodecError, LineCodec};
use super::config::{Config, ConfigError};
use super::connection::{self, CloseReason, Event, Link};
use super::gossip::{self, PeerDiscovery};
use super::message::{Message, PeerAddr};
use super::registry::{ConnId, ConnectionRegistry};
use super::timer::Timer;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What the node looks like from the outside, republished whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Listen addresses of every registered peer.
    pub peers: Vec<PeerAddr>,
    pub clients: usize,
    pub channels: usize,
    /// Whether a peer handshake is in flight.
    pub candidate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Peer,
    Candidate,
}

/// Why the reactor woke up.
enum Wake {
    Shutdown,
    Client(io::Result<(TcpStream, SocketAddr)>),
    Peer(io::Result<(TcpStream, SocketAddr)>),
    Event(Event),
    Tick,
}

pub struct Server {
    config: Config,
    client_listener: TcpListener,
    peer_listener: TcpListener,
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
    clients: ConnectionRegistry,
    peers: ConnectionRegistry,
    channels: ChannelRegistry,
    discovery: PeerDiscovery,
    links: HashMap<ConnId, Link>,
    last_id: u64,
    heartbeat: Timer,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    topology: watch::Sender<Topology>,
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

impl Server {
    /// Bind both listeners, so port conflicts fail before anything runs.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let client_listener = bind(config.client_listen).await?;
        let peer_listener = bind(config.peer_listen).await?;
        let client_addr = client_listener.local_addr()?;
        let peer_addr = peer_listener.local_addr()?;

        let self_addr = PeerAddr::new(config.advertised_host(), peer_addr.port());
        info!(clients = %client_addr, peers = %peer_addr, advertise = %self_addr, "mchat listening");

        let mut discovery = PeerDiscovery::new(self_addr, config.handshake_timeout);
        discovery.learn(config.seed_peers.iter().cloned(), &[]);

        let (events_tx, events_rx) = mpsc::channel(config.event_queue);
        let (topology, _) = watch::channel(Topology::default());

        Ok(Self {
            clients: ConnectionRegistry::new("clients", config.max_clients),
            peers: ConnectionRegistry::new("peers", config.max_peers),
            channels: ChannelRegistry::new(config.max_channels, config.max_channel_members),
            heartbeat: Timer::new(config.heartbeat_interval),
            links: HashMap::new(),
            last_id: 0,
            config,
            client_listener,
            peer_listener,
            client_addr,
            peer_addr,
            discovery,
            events_tx,
            events_rx,
            topology,
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The `(host, port)` other servers should use to reach this one.
    pub fn advertised_addr(&self) -> &PeerAddr {
        self.discovery.self_addr()
    }

    pub fn topology(&self) -> watch::Receiver<Topology> {
        self.topology.subscribe()
    }

    /// Drive the reactor until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ServerError> {
        self.heartbeat.start(None);

        loop {
            self.dial_pending();

            if self.heartbeat.has_expired() {
                self.sweep_heartbeats();
                self.heartbeat.start(None);
            }

            if let Some(id) = self.discovery.expired_candidate() {
                warn!(%id, "peer handshake timed out");
                self.close(id);
            }

            self.publish();

            let nap = self.next_deadline();
            let accept_peer = self.discovery.candidate().is_none();

            let wake = tokio::select! {
                () = shutdown.cancelled() => Wake::Shutdown,
                accepted = self.client_listener.accept() => Wake::Client(accepted),
                accepted = self.peer_listener.accept(), if accept_peer => Wake::Peer(accepted),
                Some(event) = self.events_rx.recv() => Wake::Event(event),
                () = tokio::time::sleep(nap) => Wake::Tick,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Client(accepted) => {
                    let (stream, addr) = accepted?;
                    self.on_client_accept(stream, addr);
                }
                Wake::Peer(accepted) => {
                    let (stream, addr) = accepted?;
                    self.on_peer_accept(stream, addr);
                }
                Wake::Event(event) => self.on_event(event),
                Wake::Tick => {}
            }
        }

        info!(connections = self.links.len(), "shutting down");
        for (_, link) in self.links.drain() {
            link.close();
        }
        Ok(())
    }

    /// How long the reactor may sleep before a timer needs attention.
    fn next_deadline(&self) -> Duration {
        [self.heartbeat.remaining(), self.discovery.handshake_remaining()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(self.config.heartbeat_interval)
    }

    fn next_id(&mut self) -> ConnId {
        self.last_id += 1;
        ConnId::new(self.last_id)
    }

    fn spawn_link(&mut self, id: ConnId, stream: TcpStream) {
        let codec = LineCodec::new(self.config.max_frame_len);
        let link = Link::spawn(
            id,
            stream,
            codec,
            self.config.link_queue,
            self.events_tx.clone(),
        );
        self.links.insert(id, link);
    }

    fn role(&self, id: ConnId) -> Option<Role> {
        if self.clients.contains(id) {
            Some(Role::Client)
        } else if self.peers.contains(id) {
            Some(Role::Peer)
        } else if self.discovery.candidate() == Some(id) {
            Some(Role::Candidate)
        } else {
            None
        }
    }

    fn publish(&self) {
        let snapshot = Topology {
            peers: self.peers.listen_addrs(),
            clients: self.clients.len(),
            channels: self.channels.len(),
            candidate: self.discovery.candidate().is_some(),
        };
        self.topology.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    // ── Accepting and dialing ────────────────────────────────────

    fn on_client_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id();
        if let Err(e) = self.clients.add(id, None, None) {
            warn!(%addr, "refusing client: {e}");
            return;
        }
        self.spawn_link(id, stream);
        info!(%id, %addr, "client connected");
    }

    fn on_peer_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id();
        if !self.discovery.accept_candidate(id) {
            warn!(%addr, "peer handshake already in flight, dropping connection");
            return;
        }
        self.spawn_link(id, stream);
        info!(%id, %addr, "peer candidate accepted");

        let known = self.peers.listen_addrs();
        for frame in gossip::address_frames(&known, self.config.max_frame_len) {
            if !self.send(id, frame) {
                return;
            }
        }
        self.discovery.addresses_sent(id);
    }

    fn dial_pending(&mut self) {
        for addr in self.discovery.take_pending() {
            debug!(%addr, "dialing peer");
            connection::dial(addr, self.config.dial_timeout, self.events_tx.clone());
        }
    }

    fn on_dialed(&mut self, addr: PeerAddr, result: io::Result<TcpStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%addr, "peer dial failed: {e}");
                return;
            }
        };
        if self.peers.listen_addrs().contains(&addr) {
            debug!(%addr, "already connected to peer, dropping duplicate dial");
            return;
        }
        let id = self.next_id();
        if let Err(e) = self.peers.add(id, Some(addr.clone()), None) {
            warn!(%addr, "not registering peer: {e}");
            return;
        }
        self.spawn_link(id, stream);
        info!(%id, %addr, "connected to peer");
    }

    // ── Inbound events ───────────────────────────────────────────

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Frame { id, text } => match self.role(id) {
                Some(Role::Client) => self.on_client_frame(id, &text),
                Some(Role::Peer) => self.on_peer_frame(id, &text),
                Some(Role::Candidate) => self.on_candidate_frame(id, &text),
                None => {}
            },
            Event::Undecodable { id } => match self.role(id) {
                Some(Role::Candidate) => {
                    warn!(%id, "undecodable handshake from peer candidate");
                    self.close(id);
                }
                Some(_) => debug!(%id, "dropping frame that is not valid UTF-8"),
                None => {}
            },
            Event::Closed { id, reason } => {
                if !self.links.contains_key(&id) {
                    return;
                }
                match reason {
                    CloseReason::Codec(CodecError::LineTooLong { max }) => {
                        warn!(%id, max, "frame exceeded limit, disconnecting");
                    }
                    reason => info!(%id, "connection closed: {reason}"),
                }
                self.close(id);
            }
            Event::Dialed { addr, result } => self.on_dialed(addr, result),
        }
    }

    fn on_candidate_frame(&mut self, id: ConnId, text: &str) {
        let addr = match Message::parse(text) {
            Ok(Message::MyAddr(addr)) => addr,
            _ => {
                warn!(%id, frame = text, "peer candidate did not answer with MY_ADDR");
                self.close(id);
                return;
            }
        };

        if !self.discovery.confirm(id) {
            warn!(%id, %addr, "MY_ADDR before the address list went out");
            self.close(id);
            return;
        }
        if let Err(e) = self.peers.add(id, Some(addr.clone()), None) {
            warn!(%id, %addr, "not promoting peer: {e}");
            self.close(id);
            return;
        }
        info!(%id, %addr, "peer promoted");
    }

    fn on_client_frame(&mut self, id: ConnId, text: &str) {
        let msg = match Message::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%id, "ignoring client frame: {e}");
                return;
            }
        };

        match &msg {
            Message::Join { channel } => match self.channels.join(id, channel) {
                Ok(true) => {
                    let Ok(nick) = self.clients.nickname(id).map(str::to_owned) else {
                        return;
                    };
                    self.announce(channel, format!("{nick} joined the channel"), Some(id));
                }
                Ok(false) => {}
                Err(e) => debug!(%id, %channel, "join refused: {e}"),
            },
            Message::Part { channel } => {
                if !self.channels.part(id, channel) {
                    return;
                }
                let Ok(nick) = self.clients.nickname(id).map(str::to_owned) else {
                    return;
                };
                self.announce(channel, format!("{nick} left the channel"), None);
            }
            Message::Nick { name } => self.rename(id, name),
            Message::Msg { nick, channel, .. } => {
                // The nick riding on a message counts as a rename even when
                // the message itself is dropped.
                self.rename(id, nick);
                if !self.channels.is_member(id, channel) {
                    debug!(%id, %channel, "dropping message to channel not joined");
                    return;
                }
                self.deliver_local(channel, &msg, Some(id));
                self.broadcast_peers(&msg);
            }
            Message::Heart => {
                self.send(id, Message::Bleed);
            }
            Message::Bleed => {
                if let Err(e) = self.clients.heartbeat_received(id) {
                    debug!(%id, "heartbeat answer from unknown client: {e}");
                }
            }
            Message::System { .. } | Message::AllAddrs(_) | Message::MyAddr(_) => {
                debug!(%id, "ignoring server-only frame from client");
            }
        }
    }

    fn on_peer_frame(&mut self, id: ConnId, text: &str) {
        let msg = match Message::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%id, "ignoring peer frame: {e}");
                return;
            }
        };

        match &msg {
            Message::Msg { channel, .. } | Message::System { channel, .. } => {
                self.deliver_local(channel, &msg, None);
            }
            Message::AllAddrs(addrs) => {
                let reply = Message::MyAddr(self.discovery.self_addr().clone());
                if !self.send(id, reply) {
                    return;
                }
                let connected = self.peers.listen_addrs();
                let queued = self.discovery.learn(addrs.iter().cloned(), &connected);
                if queued > 0 {
                    info!(%id, queued, "learned peer addresses");
                }
            }
            Message::Heart => {
                self.send(id, Message::Bleed);
            }
            Message::Bleed => {
                if let Err(e) = self.peers.heartbeat_received(id) {
                    debug!(%id, "heartbeat answer from unknown peer: {e}");
                }
            }
            Message::MyAddr(_) => debug!(%id, "ignoring MY_ADDR from established peer"),
            Message::Join { .. } | Message::Part { .. } | Message::Nick { .. } => {
                debug!(%id, "ignoring client-only frame from peer");
            }
        }
    }

    /// Store a new nickname and tell every channel the client is in.
    fn rename(&mut self, id: ConnId, name: &str) {
        let Ok(old) = self.clients.nickname(id).map(str::to_owned) else {
            return;
        };
        if !matches!(self.clients.set_nickname(id, name), Ok(true)) {
            return;
        }
        info!(%id, %old, new = name, "nickname changed");
        for channel in self.channels.channels_of(id) {
            self.announce(&channel, format!("{old} is now known as {name}"), Some(id));
        }
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Queue `msg` on a link. A dead link is closed on the spot.
    fn send(&mut self, id: ConnId, msg: Message) -> bool {
        let queued = self.links.get(&id).is_some_and(|link| link.send(msg));
        if !queued {
            self.close(id);
        }
        queued
    }

    fn deliver_local(&mut self, channel: &str, msg: &Message, exclude: Option<ConnId>) {
        for id in self.channels.members(channel) {
            if Some(id) != exclude {
                self.send(id, msg.clone());
            }
        }
    }

    fn broadcast_peers(&mut self, msg: &Message) {
        for id in self.peers.handles() {
            self.send(id, msg.clone());
        }
    }

    /// A `SYSTEM` notice to the local members of `channel` and to every peer.
    fn announce(&mut self, channel: &str, text: String, exclude: Option<ConnId>) {
        let msg = Message::System {
            channel: channel.to_owned(),
            text,
        };
        self.deliver_local(channel, &msg, exclude);
        self.broadcast_peers(&msg);
    }

    // ── Liveness ─────────────────────────────────────────────────

    fn sweep_heartbeats(&mut self) {
        let threshold = i32::try_from(self.config.missed_heartbeats).unwrap_or(i32::MAX);

        for id in self.clients.sweep(threshold) {
            warn!(%id, "client stopped answering heartbeats");
            self.close(id);
        }
        for id in self.peers.sweep(threshold) {
            warn!(%id, "peer stopped answering heartbeats");
            self.close(id);
        }

        let mut targets = self.clients.handles();
        targets.extend(self.peers.handles());
        for id in targets {
            self.send(id, Message::Heart);
        }
    }

    /// Forget `id` everywhere. Safe to call for a handle already gone.
    fn close(&mut self, id: ConnId) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        link.close();

        if self.discovery.abandon(id) {
            info!(%id, "peer candidate dropped");
            return;
        }

        if let Ok(addr) = self.peers.listen_addr(id).map(|a| a.cloned()) {
            self.peers.remove(id);
            match addr {
                Some(addr) => info!(%id, %addr, "peer disconnected"),
                None => info!(%id, "peer disconnected"),
            }
            return;
        }

        let Ok(nick) = self.clients.nickname(id).map(str::to_owned) else {
            return;
        };
        self.clients.remove(id);
        let parted = self.channels.part_all(id);
        info!(%id, %nick, channels = parted.len(), "client disconnected");
        for channel in parted {
            self.announce(&channel, format!("{nick} disconnected"), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn loopback() -> Config {
        Config {
            client_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            peer_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn bind_reports_ephemeral_ports() {
        let server = Server::bind(loopback()).await.unwrap();
        assert_ne!(server.client_addr().port(), 0);
        assert_ne!(server.peer_addr().port(), 0);
        assert_eq!(
            server.advertised_addr(),
            &PeerAddr::new("127.0.0.1", server.peer_addr().port())
        );
    }

    #[tokio::test]
    async fn bind_rejects_invalid_config() {
        let config = Config {
            max_clients: 0,
            ..loopback()
        };
        assert!(matches!(
            Server::bind(config).await,
            Err(ServerError::Config(ConfigError::Zero("max clients")))
        ));
    }

    #[tokio::test]
    async fn bind_conflict_fails_fast() {
        let first = Server::bind(loopback()).await.unwrap();
        let config = Config {
            client_listen: first.client_addr(),
            ..loopback()
        };
        match Server::bind(config).await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, first.client_addr()),
            other => panic!("expected bind failure, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn seed_peers_are_queued_for_dialing() {
        let config = Config {
            seed_peers: vec![PeerAddr::new("127.0.0.1", 1), PeerAddr::new("127.0.0.1", 1)],
            ..loopback()
        };
        let server = Server::bind(config).await.unwrap();
        assert_eq!(
            server.discovery.pending().cloned().collect::<Vec<_>>(),
            vec![PeerAddr::new("127.0.0.1", 1)]
        );
    }

    #[tokio::test]
    async fn topology_starts_empty() {
        let server = Server::bind(loopback()).await.unwrap();
        assert_eq!(*server.topology().borrow(), Topology::default());
    }
}
