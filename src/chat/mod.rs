//! Federated channel chat.
//!
//! A node accepts clients on one listener and other nodes on a second. Clients
//! join named channels and exchange `MSG` frames; every node relays channel
//! traffic to all of its peers, which deliver it to their own members. Peers
//! find each other through address gossip exchanged when one node connects to
//! another, and `HEART`/`BLEED` heartbeats evict connections that go quiet.

pub mod channels;
pub mod codec;
pub mod config;
pub mod connection;
pub mod gossip;
pub mod message;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod timer;
