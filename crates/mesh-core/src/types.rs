use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Unique identifier for a mesh peer (stable short id assigned by the radio network)
pub type PeerId = String;

/// Unique identifier for a channel
pub type ChannelId = Uuid;

/// Unique identifier for a shared annotation
pub type AnnotationId = Uuid;

/// Transport family an endpoint is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Bluetooth,
    Companion,
    Layer2,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Bluetooth => write!(f, "Bluetooth"),
            TransportKind::Companion => write!(f, "Companion"),
            TransportKind::Layer2 => write!(f, "Layer2"),
        }
    }
}

/// An addressable endpoint discovered on some transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    pub transport: TransportKind,
}

/// A remote participant on the mesh network
///
/// Created on the first observed packet from an id and refreshed on every
/// observation. Pruning is an external inactivity policy; this layer never
/// actively deletes peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub nickname: String,
    pub long_name: String,
    pub last_seen: DateTime<Utc>,
    pub has_public_key: bool,
    pub public_key: Option<Vec<u8>>,
}

impl Peer {
    /// Create a placeholder peer for an id observed before any node info arrived
    pub fn unknown(id: PeerId) -> Self {
        Self {
            nickname: id.chars().take(4).collect(),
            long_name: format!("Node {}", id),
            id,
            last_seen: Utc::now(),
            has_public_key: false,
            public_key: None,
        }
    }
}

/// A message channel shared between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub members: HashSet<PeerId>,
    pub is_default: bool,
    pub is_direct_message: bool,
}

/// A single message within a channel log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel_id: ChannelId,
    pub sender_id: PeerId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Geometry kind of a shared annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationKind {
    Marker,
    Line,
    Polygon,
    Circle,
}

/// A single geographic coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A shared map annotation, merged across peers by sequence number
///
/// The sequence number (not wall-clock time) decides which version of an
/// annotation wins, so peers with skewed clocks still converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub origin: PeerId,
    pub seq: u64,
    pub kind: AnnotationKind,
    pub color: String,
    pub points: Vec<GeoPoint>,
    pub status: Option<String>,
}

/// Where a location fix originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationSource {
    Radio,
    App,
    Companion,
}

/// Most recent known location for a peer; no history is retained here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLocationEntry {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub source: LocationSource,
    pub seq: u64,
}

/// Connection lifecycle state; exactly one value is authoritative at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(DeviceInfo),
    ServiceConnected(DeviceInfo),
    Error(String),
}

impl ConnectionState {
    /// True when a new connect attempt may be started
    pub fn is_ready_for_new_connection(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected(_) | ConnectionState::ServiceConnected(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::ServiceConnected(_) => "service_connected",
            ConnectionState::Error(_) => "error",
        }
    }
}

/// Step of the post-connect configuration bootstrap
///
/// Advances forward-only except into `Error`, which is terminal until a fresh
/// connect resets the sequencer to `NotStarted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigDownloadStep {
    NotStarted,
    SendingHandshake,
    WaitingForConfig,
    DownloadingConfig,
    DownloadingModuleConfig,
    DownloadingChannel,
    DownloadingNodeInfo,
    DownloadingMyInfo,
    Complete,
    Error(String),
}

impl ConfigDownloadStep {
    /// Position in the forward-only step order; `Error` ranks above everything
    pub fn rank(&self) -> u8 {
        match self {
            ConfigDownloadStep::NotStarted => 0,
            ConfigDownloadStep::SendingHandshake => 1,
            ConfigDownloadStep::WaitingForConfig => 2,
            ConfigDownloadStep::DownloadingConfig => 3,
            ConfigDownloadStep::DownloadingModuleConfig => 4,
            ConfigDownloadStep::DownloadingChannel => 5,
            ConfigDownloadStep::DownloadingNodeInfo => 6,
            ConfigDownloadStep::DownloadingMyInfo => 7,
            ConfigDownloadStep::Complete => 8,
            ConfigDownloadStep::Error(_) => 9,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConfigDownloadStep::Complete | ConfigDownloadStep::Error(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfigDownloadStep::NotStarted => "not_started",
            ConfigDownloadStep::SendingHandshake => "sending_handshake",
            ConfigDownloadStep::WaitingForConfig => "waiting_for_config",
            ConfigDownloadStep::DownloadingConfig => "downloading_config",
            ConfigDownloadStep::DownloadingModuleConfig => "downloading_module_config",
            ConfigDownloadStep::DownloadingChannel => "downloading_channel",
            ConfigDownloadStep::DownloadingNodeInfo => "downloading_node_info",
            ConfigDownloadStep::DownloadingMyInfo => "downloading_my_info",
            ConfigDownloadStep::Complete => "complete",
            ConfigDownloadStep::Error(_) => "error",
        }
    }
}

/// Received-item counters for the downloading bootstrap steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    pub config: u64,
    pub module_config: u64,
    pub channel: u64,
    pub node_info: u64,
    pub my_info: u64,
}

/// Diagnostic record of one inbound packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSummary {
    pub peer_id: PeerId,
    pub peer_nickname: Option<String>,
    pub packet_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Capability flags exposed by each transport adapter
///
/// Callers branch on these rather than on the concrete adapter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    pub requires_app_location_send: bool,
    pub allows_channel_management: bool,
    pub supports_audio: bool,
    pub requires_connection: bool,
}

/// Which substructures a partial state sync carries
///
/// Typed replacement for the field-name string set used by the original
/// firmware contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFields {
    pub channels: bool,
    pub peer_locations: bool,
    pub annotations: bool,
}

impl SyncFields {
    pub fn all() -> Self {
        Self {
            channels: true,
            peer_locations: true,
            annotations: true,
        }
    }

    pub fn none() -> Self {
        Self {
            channels: false,
            peer_locations: false,
            annotations: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.channels && !self.peer_locations && !self.annotations
    }
}

/// Peer status beacon (emergency flag, battery, free-form note)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub peer_id: PeerId,
    pub emergency: bool,
    pub battery_percent: Option<u8>,
    pub message: Option<String>,
}

/// Snapshot of session internals for troubleshooting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    pub transport: TransportKind,
    pub connection_state: String,
    pub bootstrap_step: String,
    pub generation: u64,
    pub peer_count: usize,
    pub channel_count: usize,
    pub unknown_packets: u64,
    pub packet_summaries: usize,
}
