//! Tag-framed codec for host <-> controller messages.
//!
//! Every message starts with a 4-byte little-endian tag. Request and Response
//! messages carry an XML document with no length prefix: the payload runs to
//! the end of the connection, so the reader drains until EOF and every
//! payload-bearing message travels on its own connection. Writers always emit
//! the tag as a separate write before any payload because the host reads it
//! with its own fixed-size read.

use std::io;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

/// Size of a message tag (and of the SetPort payload) on the wire.
pub const TAG_LEN: usize = 4;

/// Message kinds understood by both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    Quit = 3,
    /// Ask the host to bring the controller's window to the foreground.
    ActivatePython = 4,
    Ping = 5,
    Pong = 6,
    SetPort = 10005,
}

impl MessageType {
    pub fn tag(self) -> i32 {
        self as i32
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Quit),
            4 => Some(Self::ActivatePython),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            10005 => Some(Self::SetPort),
            _ => None,
        }
    }

    /// Request and Response carry a document that runs until EOF.
    pub fn carries_document(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }
}

/// A single decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(String),
    Response(String),
    Quit,
    ActivatePython,
    Ping,
    Pong,
    SetPort(u16),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::Quit => MessageType::Quit,
            Self::ActivatePython => MessageType::ActivatePython,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::SetPort(_) => MessageType::SetPort,
        }
    }

    /// Encode into the tag and the optional payload, which must be written
    /// separately.
    pub fn encode(&self) -> ([u8; TAG_LEN], Option<Vec<u8>>) {
        let tag = self.message_type().tag().to_le_bytes();
        let payload = match self {
            Self::Request(xml) | Self::Response(xml) => Some(xml.as_bytes().to_vec()),
            Self::SetPort(port) => Some(i32::from(*port).to_le_bytes().to_vec()),
            Self::Quit | Self::ActivatePython | Self::Ping | Self::Pong => None,
        };
        (tag, payload)
    }

    /// Payload size in bytes, for logging.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Request(xml) | Self::Response(xml) => xml.len(),
            Self::SetPort(_) => TAG_LEN,
            _ => 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown message tag {0}")]
    UnknownTag(i32),
    #[error("truncated message: {0} bytes left at end of stream")]
    Truncated(usize),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid port {0}")]
    InvalidPort(i32),
    #[error("connection closed before a message arrived")]
    Closed,
    #[error("document payload exceeds {0} bytes")]
    TooLarge(usize),
}

/// Decoder for one inbound message.
///
/// Tag-only messages decode as soon as the tag is buffered. Request and
/// Response only decode in `decode_eof`, once the peer has closed its half.
/// A document that grows past `max_document` bytes before EOF is rejected.
#[derive(Debug)]
pub struct MessageCodec {
    max_document: usize,
}

/// Largest Request/Response document accepted on one connection.
pub const MAX_DOCUMENT_LEN: usize = 64 * 1024 * 1024;

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_document: MAX_DOCUMENT_LEN,
        }
    }

    pub fn with_max_document(max_document: usize) -> Self {
        Self { max_document }
    }
}

fn peek_i32(src: &BytesMut) -> i32 {
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&src[..TAG_LEN]);
    i32::from_le_bytes(tag)
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < TAG_LEN {
            return Ok(None);
        }

        let tag = peek_i32(src);
        let kind = MessageType::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

        let message = match kind {
            MessageType::Request | MessageType::Response => {
                let len = src.len() - TAG_LEN;
                if len > self.max_document {
                    return Err(CodecError::TooLarge(self.max_document));
                }
                return Ok(None);
            }
            MessageType::SetPort => {
                if src.len() < 2 * TAG_LEN {
                    return Ok(None);
                }
                src.advance(TAG_LEN);
                let raw = src.get_i32_le();
                let port = u16::try_from(raw).map_err(|_| CodecError::InvalidPort(raw))?;
                Message::SetPort(port)
            }
            MessageType::Quit => {
                src.advance(TAG_LEN);
                Message::Quit
            }
            MessageType::ActivatePython => {
                src.advance(TAG_LEN);
                Message::ActivatePython
            }
            MessageType::Ping => {
                src.advance(TAG_LEN);
                Message::Ping
            }
            MessageType::Pong => {
                src.advance(TAG_LEN);
                Message::Pong
            }
        };

        Ok(Some(message))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < TAG_LEN {
            return Err(CodecError::Truncated(src.len()));
        }

        let kind = MessageType::from_tag(peek_i32(src));
        match kind {
            Some(kind) if kind.carries_document() => {
                src.advance(TAG_LEN);
                let payload = String::from_utf8(src.split().to_vec())?;
                tracing::trace!(payload_bytes = payload.len(), "Decoded document frame");
                if kind == MessageType::Request {
                    Ok(Some(Message::Request(payload)))
                } else {
                    Ok(Some(Message::Response(payload)))
                }
            }
            // A SetPort whose port never fully arrived.
            _ => Err(CodecError::Truncated(src.len())),
        }
    }
}

/// Write a message: tag first, flushed on its own, then the payload.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (tag, payload) = message.encode();
    writer.write_all(&tag).await?;
    writer.flush().await?;
    if let Some(payload) = payload {
        writer.write_all(&payload).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Read exactly one raw tag (used for the synchronous Ping/Pong exchange).
pub async fn read_tag<R>(reader: &mut R) -> io::Result<i32>
where
    R: AsyncRead + Unpin,
{
    reader.read_i32_le().await
}

/// Read the single message carried by a connection.
pub async fn read_message<R>(reader: R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, MessageCodec::new());
    match frames.next().await {
        Some(result) => result,
        None => Err(CodecError::Closed),
    }
}
