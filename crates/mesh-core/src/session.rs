//! Shared session composition backing every transport adapter
//!
//! A `MeshSession` wires the connection state machine, bootstrap sequencer,
//! channel registry, annotation sync engine and packet dispatcher around one
//! [`TransportLink`]. Adapters differ only in the link they provide and the
//! capability flags they report.

use crate::annotations::{
    AnnotationCallback, AnnotationSyncEngine, PacketTooLargeCallback, PeerLocationCallback,
    UserLocationCallback,
};
use crate::bootstrap::ConfigBootstrapSequencer;
use crate::channels::ChannelRegistry;
use crate::codec::{
    self, AnnotationDeleteFrame, AnnotationFrame, Handshake, OutboundFrame, PositionFrame,
    StateSyncFrame, StatusFrame, TextFrame,
};
use crate::config::MeshConfig;
use crate::connection::ConnectionStateMachine;
use crate::dispatcher::PacketIngestDispatcher;
use crate::error::{MeshError, MeshResult};
use crate::link::TransportLink;
use crate::persistence::DeviceStore;
use crate::protocol::MeshProtocol;
use crate::types::{
    Annotation, AnnotationId, Channel, ChannelId, ChannelMessage, ConfigDownloadStep,
    ConnectionState, DeviceInfo, DiagnosticInfo, LocationSource, PacketSummary, Peer, PeerId,
    PeerLocationEntry, StatusUpdate, StepCounters, SyncFields, TransportCapabilities,
    TransportKind,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct MeshSession {
    node_id: PeerId,
    kind: TransportKind,
    capabilities: TransportCapabilities,
    link: Arc<dyn TransportLink>,
    conn: Arc<ConnectionStateMachine>,
    sequencer: ConfigBootstrapSequencer,
    registry: Arc<ChannelRegistry>,
    engine: Arc<AnnotationSyncEngine>,
    dispatcher: Arc<PacketIngestDispatcher>,
    ingest_task: StdMutex<Option<JoinHandle<()>>>,
    location_seq: AtomicU64,
}

impl MeshSession {
    pub fn new(
        node_id: PeerId,
        kind: TransportKind,
        capabilities: TransportCapabilities,
        link: Arc<dyn TransportLink>,
        device_store: Arc<dyn DeviceStore>,
        config: MeshConfig,
    ) -> Self {
        let conn = Arc::new(ConnectionStateMachine::new(
            Arc::clone(&link),
            device_store,
            config.scan_window(),
            config.connect_timeout(),
        ));
        let sequencer = ConfigBootstrapSequencer::new(config.step_timeout());
        let registry = Arc::new(ChannelRegistry::new());
        let engine = Arc::new(AnnotationSyncEngine::new());
        let dispatcher = Arc::new(PacketIngestDispatcher::new(
            node_id.clone(),
            Arc::clone(&registry),
            Arc::clone(&engine),
            sequencer.clone(),
            config.diagnostics.packet_ring_capacity,
        ));

        Self {
            node_id,
            kind,
            capabilities,
            link,
            conn,
            sequencer,
            registry,
            engine,
            dispatcher,
            ingest_task: StdMutex::new(None),
            location_seq: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &PeerId {
        &self.node_id
    }

    /// The device the user last connected to, if one was persisted
    pub async fn last_device(&self) -> MeshResult<Option<DeviceInfo>> {
        self.conn.last_device().await
    }

    fn ensure_sendable(&self) -> MeshResult<()> {
        if self.capabilities.requires_connection && !self.conn.current_state().is_connected() {
            return Err(MeshError::Transport(
                "not connected to a device".to_string(),
            ));
        }
        Ok(())
    }

    /// Encode and write one frame, enforcing the transport payload limit
    async fn write_frame(&self, frame: &OutboundFrame) -> MeshResult<usize> {
        let bytes = codec::encode(frame)?;
        let max = self.link.max_payload();
        if bytes.len() > max {
            return Err(MeshError::OversizedPayload {
                actual: bytes.len(),
                max,
            });
        }
        self.link.write(&bytes).await?;
        Ok(bytes.len())
    }

    fn abort_ingest(&self) {
        if let Some(handle) = self.ingest_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn connect_inner(&self, device: DeviceInfo) -> MeshResult<()> {
        self.abort_ingest();
        // Tombstones are scoped to a sync session; a new connect starts fresh.
        self.engine.begin_session().await;

        let generation = self.conn.connect_to_device(device).await?;
        self.sequencer.start(generation);

        let rx = match self.link.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                self.sequencer.fail(generation, e.user_message());
                return Err(e);
            }
        };

        let handshake = OutboundFrame::Handshake(Handshake {
            node_id: self.node_id.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            want_config_id: generation as u32,
        });
        if let Err(e) = self.write_frame(&handshake).await {
            self.sequencer.fail(generation, e.user_message());
            return Err(e);
        }
        self.sequencer.handshake_sent(generation);

        self.spawn_ingest(generation, rx);
        Ok(())
    }

    fn spawn_ingest(&self, generation: u64, mut rx: mpsc::Receiver<Vec<u8>>) {
        let conn = Arc::clone(&self.conn);
        let sequencer = self.sequencer.clone();
        let dispatcher = Arc::clone(&self.dispatcher);

        let handle = tokio::spawn(async move {
            debug!("Ingest loop started for generation {}", generation);
            let mut service_marked = false;

            while let Some(bytes) = rx.recv().await {
                match codec::decode(&bytes) {
                    Ok(frame) => {
                        let completed = dispatcher.dispatch(generation, frame).await;
                        if completed && !service_marked {
                            conn.mark_service_connected(generation);
                            service_marked = true;
                        }
                    }
                    Err(e) => dispatcher.note_malformed(&e.to_string()),
                }
            }

            // The inbound channel closing means the link dropped underneath us.
            if conn.is_current(generation) {
                conn.on_link_lost(generation);
                sequencer.reset();
            }
            debug!("Ingest loop ended for generation {}", generation);
        });

        *self.ingest_task.lock().unwrap() = Some(handle);
    }

    async fn disconnect_inner(&self) -> MeshResult<()> {
        self.abort_ingest();
        self.sequencer.reset();
        self.conn.disconnect_from_device().await
    }
}

#[async_trait]
impl MeshProtocol for MeshSession {
    fn transport_kind(&self) -> TransportKind {
        self.kind
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn scan_for_devices(&self) -> MeshResult<mpsc::Receiver<DeviceInfo>> {
        self.conn.scan_for_devices().await
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        self.conn.stop_scan().await
    }

    async fn connect_to_device(&self, device: DeviceInfo) -> MeshResult<()> {
        self.connect_inner(device).await
    }

    async fn disconnect_from_device(&self) -> MeshResult<()> {
        self.disconnect_inner().await
    }

    fn is_ready_for_new_connection(&self) -> bool {
        self.conn.is_ready_for_new_connection()
    }

    async fn force_reset(&self) {
        self.abort_ingest();
        self.sequencer.reset();
        self.conn.force_reset().await;
    }

    async fn create_channel(&self, name: &str) -> MeshResult<Channel> {
        if !self.capabilities.allows_channel_management {
            return Err(MeshError::InvalidChannelOperation(format!(
                "the {} transport does not allow channel management",
                self.kind
            )));
        }
        self.registry.create_channel(name).await
    }

    async fn delete_channel(&self, id: ChannelId) -> MeshResult<()> {
        if !self.capabilities.allows_channel_management {
            return Err(MeshError::InvalidChannelOperation(format!(
                "the {} transport does not allow channel management",
                self.kind
            )));
        }
        self.registry.delete_channel(id).await
    }

    async fn select_channel(&self, id: ChannelId) -> MeshResult<()> {
        self.registry.select_channel(id).await
    }

    async fn get_or_create_direct_message_channel(&self, peer_id: &PeerId) -> MeshResult<Channel> {
        Ok(self
            .registry
            .get_or_create_direct_message_channel(peer_id)
            .await)
    }

    async fn send_text_message(&self, channel_id: ChannelId, content: &str) -> MeshResult<()> {
        self.ensure_sendable()?;

        let channel = self
            .registry
            .channel(channel_id)
            .await
            .ok_or(MeshError::ChannelNotFound(channel_id))?;

        if channel.is_direct_message {
            let state = self
                .registry
                .direct_channel_state(channel_id)
                .await
                .ok_or(MeshError::ChannelNotFound(channel_id))?;
            return self.send_direct_message(&state.peer_id, content).await;
        }

        let timestamp = Utc::now();
        self.write_frame(&OutboundFrame::Text(TextFrame {
            channel_id: Some(channel_id),
            recipient: None,
            sender: self.node_id.clone(),
            content: content.to_string(),
            timestamp,
            pki_encrypted: false,
            recipient_key: None,
        }))
        .await?;

        self.registry
            .append_message(ChannelMessage {
                channel_id,
                sender_id: self.node_id.clone(),
                content: content.to_string(),
                timestamp,
            })
            .await;
        Ok(())
    }

    async fn send_direct_message(&self, peer_id: &PeerId, content: &str) -> MeshResult<()> {
        self.ensure_sendable()?;

        let channel = self
            .registry
            .get_or_create_direct_message_channel(peer_id)
            .await;
        let state = self
            .registry
            .direct_channel_state(channel.id)
            .await
            .ok_or_else(|| MeshError::PkiNotReady(peer_id.clone()))?;

        // Never fall back to plaintext: without a resolved key the send fails.
        if !state.ready {
            return Err(MeshError::PkiNotReady(peer_id.clone()));
        }

        let timestamp = Utc::now();
        self.write_frame(&OutboundFrame::Text(TextFrame {
            channel_id: None,
            recipient: Some(peer_id.clone()),
            sender: self.node_id.clone(),
            content: content.to_string(),
            timestamp,
            pki_encrypted: true,
            recipient_key: state.public_key,
        }))
        .await?;

        self.registry
            .append_message(ChannelMessage {
                channel_id: channel.id,
                sender_id: self.node_id.clone(),
                content: content.to_string(),
                timestamp,
            })
            .await;
        Ok(())
    }

    async fn send_annotation(&self, mut annotation: Annotation) -> MeshResult<()> {
        self.ensure_sendable()?;

        annotation.origin = self.node_id.clone();
        annotation.seq = match self.engine.annotation(annotation.id).await {
            Some(existing) => existing.seq + 1,
            None => annotation.seq.max(1),
        };

        // Size is checked before any state mutation: an oversized annotation
        // is reported and leaves both local and remote state untouched.
        let frame = OutboundFrame::Annotation(AnnotationFrame {
            annotation: annotation.clone(),
        });
        let bytes = codec::encode(&frame)?;
        let max = self.link.max_payload();
        if bytes.len() > max {
            self.engine.report_oversize(bytes.len(), max).await;
            return Err(MeshError::OversizedPayload {
                actual: bytes.len(),
                max,
            });
        }

        // Local mutation goes through the same merge path as inbound sync.
        // A refused merge means the id is tombstoned: nothing changed locally,
        // so nothing goes on the wire either.
        let id = annotation.id;
        if !self.engine.merge_annotation(annotation).await {
            debug!("Annotation {} is tombstoned, not broadcasting", id);
            return Ok(());
        }
        self.link.write(&bytes).await?;
        Ok(())
    }

    async fn send_bulk_annotation_deletions(&self, ids: &[AnnotationId]) -> MeshResult<()> {
        self.ensure_sendable()?;

        self.engine.apply_deletions(ids).await;
        self.write_frame(&OutboundFrame::AnnotationDelete(AnnotationDeleteFrame {
            ids: ids.to_vec(),
            origin: self.node_id.clone(),
        }))
        .await?;
        Ok(())
    }

    async fn send_location_update(&self, latitude: f64, longitude: f64) -> MeshResult<()> {
        if !self.capabilities.requires_app_location_send {
            debug!("Transport {} sources its own location, skipping app send", self.kind);
            return Ok(());
        }
        self.ensure_sendable()?;

        let seq = self.location_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_frame(&OutboundFrame::Position(PositionFrame {
            peer_id: self.node_id.clone(),
            latitude,
            longitude,
            seq,
            timestamp: Utc::now(),
            source: LocationSource::App,
        }))
        .await?;
        Ok(())
    }

    async fn send_status_update(&self, mut status: StatusUpdate) -> MeshResult<()> {
        self.ensure_sendable()?;

        status.peer_id = self.node_id.clone();
        self.write_frame(&OutboundFrame::Status(StatusFrame { status }))
            .await?;
        Ok(())
    }

    async fn send_state_sync(
        &self,
        target: Option<PeerId>,
        fields: SyncFields,
        partial: bool,
    ) -> MeshResult<()> {
        self.ensure_sendable()?;

        let fields = if partial { fields } else { SyncFields::all() };
        if fields.is_empty() {
            return Err(MeshError::Serialization(
                "partial state sync selects no fields".to_string(),
            ));
        }

        let frame = StateSyncFrame {
            origin: self.node_id.clone(),
            target,
            partial,
            channels: if fields.channels {
                Some(self.registry.channels().await)
            } else {
                None
            },
            peer_locations: if fields.peer_locations {
                Some(self.engine.peer_locations().await)
            } else {
                None
            },
            annotations: if fields.annotations {
                Some(self.engine.annotations().await)
            } else {
                None
            },
        };

        info!(
            "Sending {} state sync to {}",
            if partial { "partial" } else { "full" },
            frame.target.as_deref().unwrap_or("all peers")
        );
        self.write_frame(&OutboundFrame::StateSync(frame)).await?;
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.state()
    }

    fn config_download_step(&self) -> watch::Receiver<ConfigDownloadStep> {
        self.sequencer.step()
    }

    fn config_step_counters(&self) -> watch::Receiver<StepCounters> {
        self.sequencer.counters()
    }

    async fn peers(&self) -> Vec<Peer> {
        self.dispatcher.peers().await
    }

    async fn channels(&self) -> Vec<Channel> {
        self.registry.channels().await
    }

    async fn channel_messages(&self, channel_id: ChannelId) -> Vec<ChannelMessage> {
        self.registry.messages(channel_id).await
    }

    async fn packet_summaries(&self) -> Vec<PacketSummary> {
        self.dispatcher.packet_summaries().await
    }

    async fn annotations(&self) -> Vec<Annotation> {
        self.engine.annotations().await
    }

    async fn peer_locations(&self) -> HashMap<PeerId, PeerLocationEntry> {
        self.engine.peer_locations().await
    }

    fn subscribe_messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.registry.subscribe_messages()
    }

    fn subscribe_status_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.dispatcher.subscribe_status()
    }

    async fn set_annotation_callback(&self, cb: AnnotationCallback) {
        self.engine.set_annotation_callback(cb).await;
    }

    async fn set_peer_location_callback(&self, cb: PeerLocationCallback) {
        self.engine.set_peer_location_callback(cb).await;
    }

    async fn set_user_location_callback(&self, cb: UserLocationCallback) {
        self.engine.set_user_location_callback(cb).await;
    }

    async fn set_packet_too_large_callback(&self, cb: PacketTooLargeCallback) {
        self.engine.set_packet_too_large_callback(cb).await;
    }

    async fn diagnostic_info(&self) -> DiagnosticInfo {
        DiagnosticInfo {
            transport: self.kind,
            connection_state: self.conn.current_state().label().to_string(),
            bootstrap_step: self.sequencer.current_step().label().to_string(),
            generation: self.conn.current_generation(),
            peer_count: self.dispatcher.peer_count().await,
            channel_count: self.registry.channel_count().await,
            unknown_packets: self.dispatcher.unknown_packet_count(),
            packet_summaries: self.dispatcher.summary_count().await,
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down {} session", self.kind);
        self.abort_ingest();
        self.sequencer.reset();
        if let Err(e) = self.conn.stop_scan().await {
            warn!("Scan stop during shutdown failed: {}", e);
        }
        self.conn.force_reset().await;
    }
}
