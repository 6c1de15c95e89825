/// Line codec: frames a TCP byte stream into protocol lines.
///
/// Splits on `\n` and enforces a hard per-frame length cap so a peer that
/// never sends a newline cannot grow our buffer without bound. Outgoing
/// messages are serialized with `\n` termination.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// Default maximum frame length in bytes (including the `\n`).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

/// Codec error: the frame overflowed, or the socket failed.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length ({max} bytes) without a delimiter")]
    LineTooLong { max: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded frame.
///
/// Undecodable bytes are surfaced as an item rather than an error: a
/// decoder error terminates the framed stream, but a garbled line only
/// costs the sender that one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Line(String),
    Undecodable,
}

/// A tokio codec that frames protocol lines on `\n` boundaries.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    max_len: usize,
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for LineCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Only the first `max_len` bytes may hold the delimiter.
        let window = src.len().min(self.max_len);
        match src[..window].iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut line = src.split_to(pos);
                src.advance(1);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }

                match String::from_utf8(line.to_vec()) {
                    Ok(text) => Ok(Some(Inbound::Line(text))),
                    Err(_) => Ok(Some(Inbound::Undecodable)),
                }
            }
            None if src.len() >= self.max_len => Err(CodecError::LineTooLong { max: self.max_len }),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 1);
        dst.put_slice(wire.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
