//! Defensive codec for the external mesh firmware wire contract
//!
//! Frames are `[version u8][type u8][JSON payload]`. The firmware side of the
//! contract is versioned and may grow fields or frame types at any time, so
//! decoding never fails hard: unknown versions and type tags decode to
//! [`InboundFrame::Unknown`], and unknown JSON fields are ignored.

use crate::error::{MeshError, MeshResult};
use crate::types::{
    Annotation, AnnotationId, Channel, ChannelId, LocationSource, Peer, PeerId, PeerLocationEntry,
    StatusUpdate,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Wire protocol version this build speaks
pub const WIRE_VERSION: u8 = 1;

const TAG_HANDSHAKE: u8 = 0x01;
const TAG_CONFIG_FRAGMENT: u8 = 0x02;
const TAG_NODE_INFO: u8 = 0x03;
const TAG_POSITION: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_ANNOTATION: u8 = 0x06;
const TAG_ANNOTATION_DELETE: u8 = 0x07;
const TAG_STATE_SYNC: u8 = 0x08;
const TAG_STATUS: u8 = 0x09;
const TAG_ACK: u8 = 0x0a;

/// Section of radio configuration a bootstrap fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSection {
    Device,
    Module,
    Channel,
    NodeInfo,
    MyInfo,
}

/// Opening frame of the config bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: PeerId,
    pub app_version: String,
    pub want_config_id: u32,
}

/// One streamed fragment of the radio's configuration download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFragment {
    pub section: ConfigSection,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Set on the final fragment of the final section
    #[serde(default)]
    pub complete: bool,
}

/// Node table entry for a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoFrame {
    pub peer: Peer,
}

/// Location fix for a peer (or for our own node, echoed back by the radio)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionFrame {
    pub peer_id: PeerId,
    pub latitude: f64,
    pub longitude: f64,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub source: LocationSource,
}

/// Text message, either channel-addressed or a direct message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextFrame {
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub recipient: Option<PeerId>,
    pub sender: PeerId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Direct messages are sealed by the radio firmware to this key
    #[serde(default)]
    pub pki_encrypted: bool,
    #[serde(default)]
    pub recipient_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationFrame {
    pub annotation: Annotation,
}

/// Tombstone deletion for a set of annotation ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationDeleteFrame {
    pub ids: Vec<AnnotationId>,
    pub origin: PeerId,
}

/// Full or partial push of shared state to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncFrame {
    pub origin: PeerId,
    /// Peer this catch-up sync is addressed to; None means broadcast
    #[serde(default)]
    pub target: Option<PeerId>,
    pub partial: bool,
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub peer_locations: Option<HashMap<PeerId, PeerLocationEntry>>,
    #[serde(default)]
    pub annotations: Option<Vec<Annotation>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFrame {
    pub status: StatusUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckFrame {
    #[serde(default)]
    pub reference: Option<String>,
}

/// Decoded inbound frame
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Handshake(Handshake),
    ConfigFragment(ConfigFragment),
    NodeInfo(NodeInfoFrame),
    Position(PositionFrame),
    Text(TextFrame),
    Annotation(AnnotationFrame),
    AnnotationDelete(AnnotationDeleteFrame),
    StateSync(StateSyncFrame),
    Status(StatusFrame),
    Ack(AckFrame),
    /// Frame type or version this build does not understand; counted, never fatal
    Unknown { version: u8, type_tag: u8 },
}

impl InboundFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundFrame::Handshake(_) => "handshake",
            InboundFrame::ConfigFragment(_) => "config_fragment",
            InboundFrame::NodeInfo(_) => "node_info",
            InboundFrame::Position(_) => "position",
            InboundFrame::Text(_) => "text",
            InboundFrame::Annotation(_) => "annotation",
            InboundFrame::AnnotationDelete(_) => "annotation_delete",
            InboundFrame::StateSync(_) => "state_sync",
            InboundFrame::Status(_) => "status",
            InboundFrame::Ack(_) => "ack",
            InboundFrame::Unknown { .. } => "unknown",
        }
    }

    /// Peer id this frame originates from, when it carries one
    pub fn origin_peer(&self) -> Option<&PeerId> {
        match self {
            InboundFrame::Handshake(f) => Some(&f.node_id),
            InboundFrame::NodeInfo(f) => Some(&f.peer.id),
            InboundFrame::Position(f) => Some(&f.peer_id),
            InboundFrame::Text(f) => Some(&f.sender),
            InboundFrame::Annotation(f) => Some(&f.annotation.origin),
            InboundFrame::AnnotationDelete(f) => Some(&f.origin),
            InboundFrame::StateSync(f) => Some(&f.origin),
            InboundFrame::Status(f) => Some(&f.status.peer_id),
            InboundFrame::ConfigFragment(_) | InboundFrame::Ack(_) | InboundFrame::Unknown { .. } => {
                None
            }
        }
    }
}

/// Outbound frame to be encoded for the wire
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Handshake(Handshake),
    Position(PositionFrame),
    Text(TextFrame),
    Annotation(AnnotationFrame),
    AnnotationDelete(AnnotationDeleteFrame),
    StateSync(StateSyncFrame),
    Status(StatusFrame),
}

impl OutboundFrame {
    fn type_tag(&self) -> u8 {
        match self {
            OutboundFrame::Handshake(_) => TAG_HANDSHAKE,
            OutboundFrame::Position(_) => TAG_POSITION,
            OutboundFrame::Text(_) => TAG_TEXT,
            OutboundFrame::Annotation(_) => TAG_ANNOTATION,
            OutboundFrame::AnnotationDelete(_) => TAG_ANNOTATION_DELETE,
            OutboundFrame::StateSync(_) => TAG_STATE_SYNC,
            OutboundFrame::Status(_) => TAG_STATUS,
        }
    }
}

/// Encode an outbound frame into wire bytes
pub fn encode(frame: &OutboundFrame) -> MeshResult<Vec<u8>> {
    let payload = match frame {
        OutboundFrame::Handshake(f) => serde_json::to_vec(f)?,
        OutboundFrame::Position(f) => serde_json::to_vec(f)?,
        OutboundFrame::Text(f) => serde_json::to_vec(f)?,
        OutboundFrame::Annotation(f) => serde_json::to_vec(f)?,
        OutboundFrame::AnnotationDelete(f) => serde_json::to_vec(f)?,
        OutboundFrame::StateSync(f) => serde_json::to_vec(f)?,
        OutboundFrame::Status(f) => serde_json::to_vec(f)?,
    };

    let mut bytes = Vec::with_capacity(payload.len() + 2);
    bytes.push(WIRE_VERSION);
    bytes.push(frame.type_tag());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Encode an inbound frame into wire bytes
///
/// Used by transports that synthesize frames locally (the Layer-2 adapter has
/// no radio to download config from) and by tests that feed the ingest path.
pub fn encode_inbound(frame: &InboundFrame) -> MeshResult<Vec<u8>> {
    let (tag, payload) = match frame {
        InboundFrame::Handshake(f) => (TAG_HANDSHAKE, serde_json::to_vec(f)?),
        InboundFrame::ConfigFragment(f) => (TAG_CONFIG_FRAGMENT, serde_json::to_vec(f)?),
        InboundFrame::NodeInfo(f) => (TAG_NODE_INFO, serde_json::to_vec(f)?),
        InboundFrame::Position(f) => (TAG_POSITION, serde_json::to_vec(f)?),
        InboundFrame::Text(f) => (TAG_TEXT, serde_json::to_vec(f)?),
        InboundFrame::Annotation(f) => (TAG_ANNOTATION, serde_json::to_vec(f)?),
        InboundFrame::AnnotationDelete(f) => (TAG_ANNOTATION_DELETE, serde_json::to_vec(f)?),
        InboundFrame::StateSync(f) => (TAG_STATE_SYNC, serde_json::to_vec(f)?),
        InboundFrame::Status(f) => (TAG_STATUS, serde_json::to_vec(f)?),
        InboundFrame::Ack(f) => (TAG_ACK, serde_json::to_vec(f)?),
        InboundFrame::Unknown { version, type_tag } => {
            return Ok(vec![*version, *type_tag]);
        }
    };

    let mut bytes = Vec::with_capacity(payload.len() + 2);
    bytes.push(WIRE_VERSION);
    bytes.push(tag);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode wire bytes into an inbound frame
///
/// Returns `Err(MeshError::UnknownPacket)` only for frames too short to carry
/// a header or whose payload is not valid JSON for a known type. Unknown
/// versions and type tags decode successfully to [`InboundFrame::Unknown`].
pub fn decode(bytes: &[u8]) -> MeshResult<InboundFrame> {
    if bytes.len() < 2 {
        return Err(MeshError::UnknownPacket(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }

    let version = bytes[0];
    let type_tag = bytes[1];
    let payload = &bytes[2..];

    if version != WIRE_VERSION {
        debug!("Ignoring frame with unsupported wire version {}", version);
        return Ok(InboundFrame::Unknown { version, type_tag });
    }

    let frame = match type_tag {
        TAG_HANDSHAKE => InboundFrame::Handshake(parse(payload)?),
        TAG_CONFIG_FRAGMENT => InboundFrame::ConfigFragment(parse(payload)?),
        TAG_NODE_INFO => InboundFrame::NodeInfo(parse(payload)?),
        TAG_POSITION => InboundFrame::Position(parse(payload)?),
        TAG_TEXT => InboundFrame::Text(parse(payload)?),
        TAG_ANNOTATION => InboundFrame::Annotation(parse(payload)?),
        TAG_ANNOTATION_DELETE => InboundFrame::AnnotationDelete(parse(payload)?),
        TAG_STATE_SYNC => InboundFrame::StateSync(parse(payload)?),
        TAG_STATUS => InboundFrame::Status(parse(payload)?),
        TAG_ACK => InboundFrame::Ack(parse(payload)?),
        other => {
            debug!("Ignoring frame with unknown type tag 0x{:02x}", other);
            InboundFrame::Unknown { version, type_tag: other }
        }
    };

    Ok(frame)
}

fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> MeshResult<T> {
    serde_json::from_slice(payload)
        .map_err(|e| MeshError::UnknownPacket(format!("malformed payload: {}", e)))
}
