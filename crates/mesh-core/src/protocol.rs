//! Protocol facade: one interface, many transport adapters

use crate::annotations::{
    AnnotationCallback, PacketTooLargeCallback, PeerLocationCallback, UserLocationCallback,
};
use crate::error::MeshResult;
use crate::types::{
    Annotation, AnnotationId, Channel, ChannelId, ChannelMessage, ConfigDownloadStep,
    ConnectionState, DeviceInfo, DiagnosticInfo, PacketSummary, Peer, PeerId, PeerLocationEntry,
    StatusUpdate, StepCounters, SyncFields, TransportCapabilities, TransportKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::info;

/// The single contract every transport adapter implements
///
/// Callers branch on [`MeshProtocol::capabilities`] rather than on the
/// concrete adapter type. Long-running operations never block; completion is
/// observed through the returned channels and watch subscriptions.
#[async_trait]
pub trait MeshProtocol: Send + Sync {
    fn transport_kind(&self) -> TransportKind;
    fn capabilities(&self) -> TransportCapabilities;

    /// Start a device scan; the receiver closing marks the end of the window
    async fn scan_for_devices(&self) -> MeshResult<mpsc::Receiver<DeviceInfo>>;
    async fn stop_scan(&self) -> MeshResult<()>;
    async fn connect_to_device(&self, device: DeviceInfo) -> MeshResult<()>;
    async fn disconnect_from_device(&self) -> MeshResult<()>;
    fn is_ready_for_new_connection(&self) -> bool;
    async fn force_reset(&self);

    async fn create_channel(&self, name: &str) -> MeshResult<Channel>;
    async fn delete_channel(&self, id: ChannelId) -> MeshResult<()>;
    async fn select_channel(&self, id: ChannelId) -> MeshResult<()>;
    async fn get_or_create_direct_message_channel(&self, peer_id: &PeerId) -> MeshResult<Channel>;

    async fn send_text_message(&self, channel_id: ChannelId, content: &str) -> MeshResult<()>;
    async fn send_direct_message(&self, peer_id: &PeerId, content: &str) -> MeshResult<()>;
    async fn send_annotation(&self, annotation: Annotation) -> MeshResult<()>;
    async fn send_bulk_annotation_deletions(&self, ids: &[AnnotationId]) -> MeshResult<()>;
    async fn send_location_update(&self, latitude: f64, longitude: f64) -> MeshResult<()>;
    async fn send_status_update(&self, status: StatusUpdate) -> MeshResult<()>;
    async fn send_state_sync(
        &self,
        target: Option<PeerId>,
        fields: SyncFields,
        partial: bool,
    ) -> MeshResult<()>;

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;
    fn config_download_step(&self) -> watch::Receiver<ConfigDownloadStep>;
    fn config_step_counters(&self) -> watch::Receiver<StepCounters>;
    async fn peers(&self) -> Vec<Peer>;
    async fn channels(&self) -> Vec<Channel>;
    async fn channel_messages(&self, channel_id: ChannelId) -> Vec<ChannelMessage>;
    async fn packet_summaries(&self) -> Vec<PacketSummary>;
    async fn annotations(&self) -> Vec<Annotation>;
    async fn peer_locations(&self) -> HashMap<PeerId, PeerLocationEntry>;
    fn subscribe_messages(&self) -> broadcast::Receiver<ChannelMessage>;
    fn subscribe_status_updates(&self) -> broadcast::Receiver<StatusUpdate>;

    async fn set_annotation_callback(&self, cb: AnnotationCallback);
    async fn set_peer_location_callback(&self, cb: PeerLocationCallback);
    async fn set_user_location_callback(&self, cb: UserLocationCallback);
    async fn set_packet_too_large_callback(&self, cb: PacketTooLargeCallback);

    async fn diagnostic_info(&self) -> DiagnosticInfo;

    /// Tear down everything: pending timers, the ingest loop, the link
    async fn shutdown(&self);
}

/// Explicitly injected holder of the single active transport adapter
///
/// Replaces the original's global "current protocol" singleton. Activating a
/// replacement fully shuts the previous adapter down first, so two adapters
/// can never race to mutate shared state.
pub struct ProtocolProvider {
    active: RwLock<Option<Arc<dyn MeshProtocol>>>,
    kind_tx: watch::Sender<Option<TransportKind>>,
}

impl ProtocolProvider {
    pub fn new() -> Self {
        let (kind_tx, _) = watch::channel(None);
        Self {
            active: RwLock::new(None),
            kind_tx,
        }
    }

    /// Install `adapter` as the active transport, tearing down the previous one
    pub async fn activate(&self, adapter: Arc<dyn MeshProtocol>) {
        let mut slot = self.active.write().await;
        if let Some(previous) = slot.take() {
            info!(
                "Switching active transport {} -> {}",
                previous.transport_kind(),
                adapter.transport_kind()
            );
            previous.shutdown().await;
        } else {
            info!("Activating transport {}", adapter.transport_kind());
        }

        self.kind_tx.send_replace(Some(adapter.transport_kind()));
        *slot = Some(adapter);
    }

    /// Shut down and remove the active adapter, if any
    pub async fn deactivate(&self) {
        let mut slot = self.active.write().await;
        if let Some(previous) = slot.take() {
            info!("Deactivating transport {}", previous.transport_kind());
            previous.shutdown().await;
        }
        self.kind_tx.send_replace(None);
    }

    /// The currently active adapter
    pub async fn active(&self) -> Option<Arc<dyn MeshProtocol>> {
        self.active.read().await.clone()
    }

    /// Observe which transport kind is active
    pub fn active_kind(&self) -> watch::Receiver<Option<TransportKind>> {
        self.kind_tx.subscribe()
    }
}

impl Default for ProtocolProvider {
    fn default() -> Self {
        Self::new()
    }
}
