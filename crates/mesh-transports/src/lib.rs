//! Transport adapters for the mesh protocol layer
//!
//! Each adapter pairs a [`TransportLink`] implementation with the capability
//! profile of its hardware path and wraps both in a [`MeshSession`], so
//! callers only ever hold an `Arc<dyn MeshProtocol>`.

pub mod ble;
pub mod companion;
pub mod layer2;

use mesh_core::error::MeshResult;
use mesh_core::persistence::DeviceStore;
use mesh_core::protocol::MeshProtocol;
use mesh_core::session::MeshSession;
use mesh_core::types::{PeerId, TransportCapabilities, TransportKind};
use mesh_core::MeshConfig;
use std::sync::Arc;

pub use ble::BluetoothLink;
pub use companion::{CompanionLink, DEFAULT_SOCKET_PATH};
pub use layer2::{Layer2Link, DEFAULT_MESH_PORT};

/// Capability profile of the Bluetooth radio path
///
/// The radio has no positioning hardware, so the app feeds it location fixes.
pub const BLUETOOTH_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    requires_app_location_send: true,
    allows_channel_management: true,
    supports_audio: false,
    requires_connection: true,
};

/// Capability profile of the companion-app path
///
/// The companion owns channel configuration and location reporting itself,
/// and its hardware supports audio.
pub const COMPANION_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    requires_app_location_send: false,
    allows_channel_management: false,
    supports_audio: true,
    requires_connection: true,
};

/// Capability profile of the direct Layer-2 path
///
/// Broadcast needs no per-device connection to exchange frames.
pub const LAYER2_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    requires_app_location_send: true,
    allows_channel_management: true,
    supports_audio: false,
    requires_connection: false,
};

/// Build a mesh adapter backed by a BLE radio
pub fn bluetooth_adapter(
    node_id: PeerId,
    device_store: Arc<dyn DeviceStore>,
    config: MeshConfig,
) -> MeshResult<Arc<dyn MeshProtocol>> {
    let link = Arc::new(BluetoothLink::new());
    let session = MeshSession::new(
        node_id,
        TransportKind::Bluetooth,
        BLUETOOTH_CAPABILITIES,
        link,
        device_store,
        config,
    );
    Ok(Arc::new(session))
}

/// Build a mesh adapter backed by the companion app's IPC socket
pub fn companion_adapter(
    node_id: PeerId,
    socket_path: Option<std::path::PathBuf>,
    device_store: Arc<dyn DeviceStore>,
    config: MeshConfig,
) -> MeshResult<Arc<dyn MeshProtocol>> {
    let link = match socket_path {
        Some(path) => Arc::new(CompanionLink::new(path)),
        None => Arc::new(CompanionLink::new(DEFAULT_SOCKET_PATH)),
    };
    let session = MeshSession::new(
        node_id,
        TransportKind::Companion,
        COMPANION_CAPABILITIES,
        link,
        device_store,
        config,
    );
    Ok(Arc::new(session))
}

/// Build a mesh adapter that broadcasts directly on the local segment
pub fn layer2_adapter(
    node_id: PeerId,
    port: Option<u16>,
    device_store: Arc<dyn DeviceStore>,
    config: MeshConfig,
) -> MeshResult<Arc<dyn MeshProtocol>> {
    let link = Arc::new(Layer2Link::new(
        node_id.clone(),
        port.unwrap_or(DEFAULT_MESH_PORT),
    ));
    let session = MeshSession::new(
        node_id,
        TransportKind::Layer2,
        LAYER2_CAPABILITIES,
        link,
        device_store,
        config,
    );
    Ok(Arc::new(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_profiles_differ_where_hardware_differs() {
        assert!(BLUETOOTH_CAPABILITIES.requires_app_location_send);
        assert!(!COMPANION_CAPABILITIES.requires_app_location_send);
        assert!(!COMPANION_CAPABILITIES.allows_channel_management);
        assert!(COMPANION_CAPABILITIES.supports_audio);
        assert!(!LAYER2_CAPABILITIES.requires_connection);
        assert!(BLUETOOTH_CAPABILITIES.requires_connection);
    }
}
