//! Transport-agnostic core of the mesh protocol layer
//!
//! One contract ([`MeshProtocol`]) implemented by interchangeable transport
//! adapters, unifying device discovery, connection lifecycle, the post-connect
//! configuration bootstrap, channel/message exchange, peer-location tracking
//! and eventually-consistent annotation sync across independent peers with no
//! central coordinator.

pub mod annotations;
pub mod bootstrap;
pub mod channels;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod link;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod types;

pub use annotations::{
    AnnotationCallback, AnnotationSyncEngine, PacketTooLargeCallback, PeerLocationCallback,
    UserLocationCallback,
};
pub use bootstrap::ConfigBootstrapSequencer;
pub use channels::{ChannelRegistry, DirectChannelState};
pub use config::MeshConfig;
pub use connection::ConnectionStateMachine;
pub use dispatcher::PacketIngestDispatcher;
pub use error::{ErrorCategory, MeshError, MeshResult};
pub use link::TransportLink;
pub use persistence::{DeviceStore, JsonDeviceStore, MemoryDeviceStore};
pub use protocol::{MeshProtocol, ProtocolProvider};
pub use session::MeshSession;
pub use types::*;
