//! Node configuration.
//!
//! [`Config`] is what the reactor consumes; [`Args`] is the command-line
//! surface that produces it. Every flag can also come from an `MCHAT_*`
//! environment variable.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use super::codec::DEFAULT_MAX_FRAME_LEN;
use super::message::PeerAddr;

/// Smallest frame limit that still carries a `MY_ADDR` for a short host.
pub const MIN_FRAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max frame length must be at least {min} bytes, got {0}", min = MIN_FRAME_LEN)]
    FrameTooSmall(usize),
    #[error("missed heartbeat threshold {0} is out of range")]
    ThresholdTooLarge(u32),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client_listen: SocketAddr,
    pub peer_listen: SocketAddr,
    /// Host we announce in `MY_ADDR`. Derived from `peer_listen` when unset.
    pub advertise_host: Option<String>,
    /// Peers to dial at startup.
    pub seed_peers: Vec<PeerAddr>,
    pub max_clients: usize,
    pub max_peers: usize,
    pub max_channels: usize,
    pub max_channel_members: usize,
    /// Longest accepted frame in bytes, newline included.
    pub max_frame_len: usize,
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeats tolerated before the next one evicts.
    pub missed_heartbeats: u32,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    /// Capacity of the connection → reactor event queue.
    pub event_queue: usize,
    /// Outbound frames buffered per connection before it counts as stalled.
    pub link_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_listen: SocketAddr::from(([0, 0, 0, 0], 6061)),
            peer_listen: SocketAddr::from(([0, 0, 0, 0], 6071)),
            advertise_host: None,
            seed_peers: Vec::new(),
            max_clients: 1024,
            max_peers: 64,
            max_channels: 1024,
            max_channel_members: 1024,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            heartbeat_interval: Duration::from_secs(15),
            missed_heartbeats: 3,
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(5),
            event_queue: 1024,
            link_queue: 256,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("max clients", self.max_clients),
            ("max peers", self.max_peers),
            ("max channels", self.max_channels),
            ("max channel members", self.max_channel_members),
            ("event queue", self.event_queue),
            ("link queue", self.link_queue),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        let durations = [
            ("heartbeat interval", self.heartbeat_interval),
            ("handshake timeout", self.handshake_timeout),
            ("dial timeout", self.dial_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(ConfigError::FrameTooSmall(self.max_frame_len));
        }
        if i32::try_from(self.missed_heartbeats).is_err() {
            return Err(ConfigError::ThresholdTooLarge(self.missed_heartbeats));
        }
        Ok(())
    }

    /// The host announced to peers: the explicit override, else the peer
    /// listen IP, else (for a wildcard bind) the system hostname.
    pub fn advertised_host(&self) -> String {
        if let Some(host) = &self.advertise_host {
            return host.clone();
        }
        let ip = self.peer_listen.ip();
        if !ip.is_unspecified() {
            return ip.to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".into())
    }
}

/// Command-line arguments for the `mchat` server.
#[derive(Parser, Debug)]
#[command(name = "mchat", version, about = "Federated channel chat server")]
pub struct Args {
    /// Address to accept client connections on.
    #[arg(long, env = "MCHAT_CLIENT_LISTEN", default_value = "0.0.0.0:6061")]
    pub client_listen: SocketAddr,

    /// Address to accept peer-server connections on.
    #[arg(long, env = "MCHAT_PEER_LISTEN", default_value = "0.0.0.0:6071")]
    pub peer_listen: SocketAddr,

    /// Host announced to other servers (defaults to the listen IP or hostname).
    #[arg(long, env = "MCHAT_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Peer server to join, as host:port. Repeatable.
    #[arg(long = "peer", env = "MCHAT_PEERS", value_delimiter = ',')]
    pub peers: Vec<PeerAddr>,

    #[arg(long, env = "MCHAT_MAX_CLIENTS", default_value_t = 1024)]
    pub max_clients: usize,

    #[arg(long, env = "MCHAT_MAX_PEERS", default_value_t = 64)]
    pub max_peers: usize,

    #[arg(long, env = "MCHAT_MAX_CHANNELS", default_value_t = 1024)]
    pub max_channels: usize,

    #[arg(long, env = "MCHAT_MAX_CHANNEL_MEMBERS", default_value_t = 1024)]
    pub max_channel_members: usize,

    /// Longest accepted protocol line, newline included.
    #[arg(long, env = "MCHAT_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Seconds between heartbeat sweeps.
    #[arg(long, env = "MCHAT_HEARTBEAT_SECS", default_value_t = 15)]
    pub heartbeat_secs: u64,

    /// Unanswered heartbeats tolerated before disconnecting.
    #[arg(long, env = "MCHAT_MISSED_HEARTBEATS", default_value_t = 3)]
    pub missed_heartbeats: u32,

    /// Seconds a new peer has to complete the address handshake.
    #[arg(long, env = "MCHAT_HANDSHAKE_SECS", default_value_t = 10)]
    pub handshake_secs: u64,

    #[arg(long, env = "MCHAT_DIAL_TIMEOUT_SECS", default_value_t = 5)]
    pub dial_timeout_secs: u64,

    /// Outbound frames buffered per connection before a slow reader is dropped.
    #[arg(long, env = "MCHAT_LINK_QUEUE", default_value_t = 256)]
    pub link_queue: usize,
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let config = Config {
            client_listen: self.client_listen,
            peer_listen: self.peer_listen,
            advertise_host: self.advertise_host,
            seed_peers: self.peers,
            max_clients: self.max_clients,
            max_peers: self.max_peers,
            max_channels: self.max_channels,
            max_channel_members: self.max_channel_members,
            max_frame_len: self.max_frame_len,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            missed_heartbeats: self.missed_heartbeats,
            handshake_timeout: Duration::from_secs(self.handshake_secs),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            link_queue: self.link_queue,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = Config {
            max_clients: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("max clients")));
    }

    #[test]
    fn rejects_zero_heartbeat() {
        let config = Config {
            heartbeat_interval: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("heartbeat interval"))
        );
    }

    #[test]
    fn rejects_zero_link_queue() {
        let config = Config {
            link_queue: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("link queue")));

        let args = Args::try_parse_from(["mchat", "--link-queue", "16"]).unwrap();
        assert_eq!(args.into_config().unwrap().link_queue, 16);
    }

    #[test]
    fn rejects_tiny_frames() {
        let config = Config {
            max_frame_len: 8,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::FrameTooSmall(8)));
    }

    #[test]
    fn advertised_host_prefers_override_then_listen_ip() {
        let mut config = Config {
            peer_listen: "10.1.2.3:7000".parse().unwrap(),
            ..Config::default()
        };
        assert_eq!(config.advertised_host(), "10.1.2.3");

        config.advertise_host = Some("chat.example".into());
        assert_eq!(config.advertised_host(), "chat.example");
    }

    #[test]
    fn advertised_host_for_wildcard_is_not_wildcard() {
        let config = Config::default();
        assert_ne!(config.advertised_host(), "0.0.0.0");
        assert!(!config.advertised_host().is_empty());
    }

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["mchat"]).unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.client_listen, "0.0.0.0:6061".parse::<SocketAddr>().unwrap());
        assert_eq!(config.peer_listen, "0.0.0.0:6071".parse::<SocketAddr>().unwrap());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.max_frame_len, 1024);
        assert!(config.seed_peers.is_empty());
    }

    #[test]
    fn args_collect_peers() {
        let args = Args::try_parse_from([
            "mchat",
            "--client-listen",
            "127.0.0.1:7001",
            "--peer",
            "a.example:6071",
            "--peer",
            "b.example:6072,c.example:6073",
            "--missed-heartbeats",
            "5",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.client_listen, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        assert_eq!(
            config.seed_peers,
            vec![
                PeerAddr::new("a.example", 6071),
                PeerAddr::new("b.example", 6072),
                PeerAddr::new("c.example", 6073),
            ]
        );
        assert_eq!(config.missed_heartbeats, 5);
    }

    #[test]
    fn args_reject_malformed_peer() {
        assert!(Args::try_parse_from(["mchat", "--peer", "nope"]).is_err());
    }

    #[test]
    fn args_reject_zero_heartbeat() {
        let args = Args::try_parse_from(["mchat", "--heartbeat-secs", "0"]).unwrap();
        assert_eq!(
            args.into_config().unwrap_err(),
            ConfigError::Zero("heartbeat interval")
        );
    }
}
