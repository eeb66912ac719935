//! The opaque transport consumed by a session

use crate::error::MeshResult;
use crate::types::DeviceInfo;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Trait for transport-agnostic link operations
///
/// Each transport (BLE radio, companion IPC, Layer-2 broadcast) provides its
/// own implementation. All methods are non-blocking from the caller's point
/// of view; inbound bytes arrive through the channel handed out by
/// [`TransportLink::subscribe`]. That channel closing signals link loss.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Start a device scan, delivering results through `results`
    ///
    /// The scan runs until [`TransportLink::stop_scan`] is called; dropping
    /// the sender ends the result stream. Starting an already running scan is
    /// a no-op.
    async fn start_scan(&self, results: mpsc::Sender<DeviceInfo>) -> MeshResult<()>;

    /// Stop a running scan; stopping an idle scanner is a no-op
    async fn stop_scan(&self) -> MeshResult<()>;

    /// Bring the link up towards a device
    async fn connect(&self, device: &DeviceInfo) -> MeshResult<()>;

    /// Tear the link down
    async fn disconnect(&self) -> MeshResult<()>;

    /// Write one encoded frame
    async fn write(&self, data: &[u8]) -> MeshResult<()>;

    /// Subscribe to inbound frames for the current link
    ///
    /// Must be called after [`TransportLink::connect`]; the receiver closes
    /// when the link drops.
    async fn subscribe(&self) -> MeshResult<mpsc::Receiver<Vec<u8>>>;

    /// Largest frame this transport carries in one write
    fn max_payload(&self) -> usize;
}
