//! Loopback harness shared by the integration tests: spawn nodes on
//! ephemeral ports and talk to them with a line-oriented client.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mchat::chat::config::Config;
use mchat::chat::message::PeerAddr;
use mchat::chat::server::{Server, ServerError, Topology};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long any single expectation may take before the test fails.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Loopback listeners on ephemeral ports, heartbeats slow enough to stay
/// out of the way.
pub fn test_config() -> Config {
    Config {
        client_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        peer_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        heartbeat_interval: Duration::from_secs(60),
        ..Config::default()
    }
}

/// A running server.
pub struct TestNode {
    pub client_addr: SocketAddr,
    pub peer_addr: PeerAddr,
    pub topology: watch::Receiver<Topology>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestNode {
    pub async fn spawn(config: Config) -> Self {
        let server = Server::bind(config).await.unwrap();
        let client_addr = server.client_addr();
        let peer_addr = server.advertised_addr().clone();
        let topology = server.topology();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));
        Self {
            client_addr,
            peer_addr,
            topology,
            shutdown,
            task,
        }
    }

    /// Wait until the published topology satisfies `f`.
    pub async fn wait_for(&mut self, what: &str, f: impl FnMut(&Topology) -> bool) {
        let outcome = tokio::time::timeout(PATIENCE, self.topology.wait_for(f))
            .await
            .map(|seen| seen.is_ok());
        match outcome {
            Ok(true) => {}
            Ok(false) => panic!("server stopped while waiting for {what}"),
            Err(_) => panic!("timeout waiting for {what}, topology: {:?}", *self.topology.borrow()),
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.client_addr).await.unwrap()
    }

    pub async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.cancel();
        tokio::time::timeout(PATIENCE, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
    }
}

/// Line-oriented client for a node's client or peer port.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Every line received so far, in order.
    pub lines: Vec<String>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            lines: Vec::new(),
        })
    }

    pub async fn send(&mut self, line: &str) {
        self.send_raw(format!("{line}\n").as_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next line, `Ok(None)` on EOF, `Err` if nothing arrived within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Result<Option<String>, ()> {
        let mut line = String::new();
        match tokio::time::timeout(wait, self.reader.read_line(&mut line)).await {
            Err(_) => Err(()),
            Ok(Ok(0)) | Ok(Err(_)) => Ok(None),
            Ok(Ok(_)) => {
                let trimmed = line.trim_end_matches(['\r', '\n']).to_owned();
                self.lines.push(trimmed.clone());
                Ok(Some(trimmed))
            }
        }
    }

    pub async fn recv(&mut self) -> String {
        match self.recv_within(PATIENCE).await {
            Ok(Some(line)) => line,
            Ok(None) => panic!("connection closed, saw: {:?}", self.lines),
            Err(()) => panic!("timeout waiting for a line, saw: {:?}", self.lines),
        }
    }

    /// Next line starting with `prefix`, skipping anything else.
    pub async fn recv_prefixed(&mut self, prefix: &str) -> String {
        loop {
            let line = self.recv().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
    }

    /// Round-trip a heartbeat so every frame sent before it has been handled.
    pub async fn sync(&mut self) {
        self.send("HEART").await;
        self.recv_prefixed("BLEED").await;
    }

    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(line) = self.recv_within(wait).await {
            panic!("expected silence, got {line:?}");
        }
    }

    /// Read until the server closes the connection, skipping any lines.
    pub async fn expect_eof(&mut self) {
        loop {
            match self.recv_within(PATIENCE).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(()) => panic!("connection still open, saw: {:?}", self.lines),
            }
        }
    }
}
