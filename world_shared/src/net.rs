//! Networking primitives and the wire protocol.
//!
//! Goals:
//! - One reliable, FIFO-ordered message channel per connected client.
//! - Explicit, versionable serialization (length-prefixed JSON frames).
//! - Message types that carry full entity records, never partial identity.
//!
//! The protocol is deliberately snapshot-friendly: the server can always
//! correct a desynchronized client by resending the full entity list or the
//! full object log, and receivers apply both idempotently.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::math::{Orientation, Vec3};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; anything larger is a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Identifies a connected session. Assigned by the server at join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

/// Display identity supplied by the client at join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub numeric_id: Option<u64>,
    /// Reference to an avatar asset; resolution is the renderer's business.
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Animation hint for a remote player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Animation {
    #[default]
    Idle,
    Walk,
    Run,
    Jump,
}

/// One entity's replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: SessionId,
    pub position: Vec3,
    pub orientation: Orientation,
    pub carrying: bool,
    pub animation: Animation,
    /// Sender wall-clock, milliseconds since epoch. Last-write-wins.
    pub timestamp_ms: i64,
}

impl EntityRecord {
    /// A record at the origin, used as the placeholder for a fresh session.
    pub fn initial(id: SessionId) -> Self {
        Self {
            id,
            position: Vec3::ZERO,
            orientation: Orientation::default(),
            carrying: false,
            animation: Animation::Idle,
            timestamp_ms: now_ms(),
        }
    }

    /// True when the transform or display state differs from `other`.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.position != other.position
            || self.orientation != other.orientation
            || self.carrying != other.carrying
            || self.animation != other.animation
    }
}

/// Integer grid coordinate of a placed object. The dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCoord {
    pub x: i32,
    pub z: i32,
    pub layer: i32,
}

impl GridCoord {
    pub const fn new(x: i32, z: i32, layer: i32) -> Self {
        Self { x, z, layer }
    }
}

/// A durable placed building block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedObject {
    pub coord: GridCoord,
    /// Packed RGB color.
    pub color: u32,
    pub owner: SessionId,
    pub placed_at_ms: i64,
}

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMsg {
    Join {
        protocol: u32,
        identity: Identity,
    },
    /// Own transform/display state for this instant.
    EntityUpdate(EntityRecord),
    PlaceObject {
        coord: GridCoord,
        color: u32,
        timestamp_ms: i64,
    },
    Chat {
        text: String,
    },
    Heartbeat {
        timestamp_ms: i64,
    },
    /// Ask for a full object-log replay and entity list.
    Resync,
    /// Expected, client-initiated close.
    Disconnect,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMsg {
    Welcome {
        session_id: SessionId,
    },
    /// Full authoritative snapshot of live entities.
    EntityList(Vec<EntityRecord>),
    /// Same shape as `EntityList`, sent periodically as a correction.
    EntityListSync(Vec<EntityRecord>),
    /// Single entity record forwarded from its owner.
    EntityUpdate(EntityRecord),
    ObjectPlaced(PlacedObject),
    /// Full object log, sent once per (re)join or on request.
    WorldState(Vec<PlacedObject>),
    Chat {
        sender: SessionId,
        name: String,
        text: String,
    },
    Disconnect {
        reason: String,
    },
}

/// Current wall-clock in milliseconds since epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read half of a framed connection.
#[derive(Debug)]
pub struct FrameReader {
    stream: OwnedReadHalf,
}

impl FrameReader {
    pub async fn recv<T: DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        let mut len_buf = [0u8; 4];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame of {len} bytes exceeds limit");
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        serde_json::from_slice(&payload).context("deserialize msg")
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

/// Write half of a framed connection.
#[derive(Debug)]
pub struct FrameWriter {
    stream: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize msg")?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }
}

/// Bidirectional framed channel over TCP. FIFO per connection.
#[derive(Debug)]
pub struct Channel {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader { stream: read },
            writer: FrameWriter { stream: write },
        }
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> anyhow::Result<T> {
        self.reader.recv().await
    }

    /// Splits into independently-owned halves. Each side runs one reader
    /// task per connection: `FrameReader::recv` reads a frame in two steps
    /// and must never be dropped between them, so the reader future has to
    /// live until the stream ends.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        self.reader.peer_addr()
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(Channel, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((Channel::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes<T: DeserializeOwned>(b: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_roundtrip_bytes() {
        let msg = ClientMsg::Join {
            protocol: PROTOCOL_VERSION,
            identity: Identity {
                name: "Ada".into(),
                numeric_id: Some(7),
                avatar: None,
            },
        };
        let bytes = encode_to_bytes(&msg).unwrap();
        let back: ClientMsg = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn entity_list_roundtrip_bytes() {
        let msg = ServerMsg::EntityList(vec![EntityRecord::initial(SessionId(3))]);
        let bytes = encode_to_bytes(&msg).unwrap();
        let back: ServerMsg = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn record_differs_ignores_timestamp() {
        let a = EntityRecord::initial(SessionId(1));
        let mut b = a.clone();
        b.timestamp_ms += 500;
        assert!(!a.differs_from(&b));
        b.carrying = true;
        assert!(a.differs_from(&b));
    }
}
