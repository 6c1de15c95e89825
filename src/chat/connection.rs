/// Per-connection I/O tasks.
///
/// Each accepted or dialed stream gets one task that frames inbound bytes
/// into [`Event`]s for the reactor and writes whatever the reactor queues on
/// its [`Link`]. The task owns no chat state; every decision is the reactor's.
use std::io;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use super::codec::{CodecError, Inbound, LineCodec};
use super::message::{Message, PeerAddr};
use super::registry::ConnId;

/// Why a connection task stopped on its own.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("connection closed by remote")]
    Eof,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Events sent from connection and dial tasks to the reactor.
#[derive(Debug)]
pub enum Event {
    /// One complete, decoded line.
    Frame { id: ConnId, text: String },
    /// A line that was not valid UTF-8 (already discarded).
    Undecodable { id: ConnId },
    /// The connection died: EOF, framing overflow or socket error.
    Closed { id: ConnId, reason: CloseReason },
    /// An outbound peer dial finished.
    Dialed {
        addr: PeerAddr,
        result: io::Result<TcpStream>,
    },
}

/// The reactor's handle on a running connection task.
#[derive(Debug)]
pub struct Link {
    outgoing: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

impl Link {
    pub fn spawn(
        id: ConnId,
        stream: TcpStream,
        codec: LineCodec,
        queue: usize,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let (outgoing, rx) = mpsc::channel(queue);
        let task = tokio::spawn(run(id, stream, codec, rx, events));
        Self { outgoing, task }
    }

    /// Queue a message without waiting. `false` means the link is dead or
    /// its reader has stalled long enough to fill the queue.
    pub fn send(&self, msg: Message) -> bool {
        self.outgoing.try_send(msg).is_ok() && !self.task.is_finished()
    }

    /// Stop the task now, even mid-write, and drop the socket.
    pub fn close(self) {
        self.task.abort();
    }
}

async fn run(
    id: ConnId,
    stream: TcpStream,
    codec: LineCodec,
    mut outgoing: mpsc::Receiver<Message>,
    events: mpsc::Sender<Event>,
) {
    let mut framed = Framed::new(stream, codec);

    let reason = loop {
        tokio::select! {
            frame = framed.next() => {
                let event = match frame {
                    Some(Ok(Inbound::Line(text))) => Event::Frame { id, text },
                    Some(Ok(Inbound::Undecodable)) => Event::Undecodable { id },
                    Some(Err(e)) => break Some(CloseReason::Codec(e)),
                    None => break Some(CloseReason::Eof),
                };
                if events.send(event).await.is_err() {
                    break None;
                }
            }

            msg = outgoing.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = framed.send(msg).await {
                        break Some(CloseReason::Codec(e));
                    }
                }
                // The reactor dropped the link: it already forgot us.
                None => break None,
            }
        }
    };

    if let Some(reason) = reason {
        let _ = events.send(Event::Closed { id, reason }).await;
    }
}

/// Dial `addr` in the background and report the outcome as [`Event::Dialed`].
pub fn dial(addr: PeerAddr, timeout: Duration, events: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let connect = TcpStream::connect((addr.host.as_str(), addr.port));
        let result = match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        };
        let _ = events.send(Event::Dialed { addr, result }).await;
    });
}
