//! # Wire Protocol
//!
//! All three broker channels speak the same two-part frame: a topic part
//! and a body part, each length-prefixed with a big-endian `u32`. On the
//! broadcast and collect channels the body is the JSON event envelope; on
//! the control channel the topic part carries the client identity and the
//! body a [`ControlMessage`].

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::event::Event;

/// Maximum size of a single frame part (1 MiB).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Messages exchanged on the control channel and as transport-level
/// subscription updates on the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// A client announces itself after opening its sockets.
    Connect {
        /// The client's unique id.
        client_id: String,
    },
    /// A client announces a graceful departure.
    Disconnect {
        /// The client's unique id.
        client_id: String,
    },
    /// Topic-prefix filters a broadcast receiver wants frames for.
    Subscribe {
        /// Prefixes to add to the receiver's filter set.
        topics: Vec<String>,
    },
}

impl ControlMessage {
    /// Serialize to a frame body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse from a frame body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

async fn write_part<W: AsyncWrite + Unpin>(writer: &mut W, part: &[u8]) -> io::Result<()> {
    if part.len() > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame part too large",
        ));
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = part.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(part).await?;
    Ok(())
}

async fn read_part<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame part too large",
        ));
    }
    let mut part = vec![0u8; len as usize];
    reader.read_exact(&mut part).await?;
    Ok(part)
}

/// Write a two-part `(topic, body)` frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    topic: &[u8],
    body: &[u8],
) -> io::Result<()> {
    write_part(writer, topic).await?;
    write_part(writer, body).await?;
    writer.flush().await
}

/// Read a two-part `(topic, body)` frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let topic = read_part(reader).await?;
    let body = read_part(reader).await?;
    Ok((topic, body))
}

/// Write an event as a `(topic, envelope-json)` frame.
pub async fn write_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &Event) -> io::Result<()> {
    let body = serde_json::to_vec(event)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_frame(writer, event.topic.as_bytes(), &body).await
}
