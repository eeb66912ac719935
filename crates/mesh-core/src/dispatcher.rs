//! Inbound packet demultiplexer
//!
//! Classifies every decoded inbound frame into exactly one update class
//! (peer/location, channel/message, annotation, status, diagnostic) and
//! routes it to the owning component. Frames are consumed one at a time from
//! a single ingest task, which preserves per-peer order; there is no global
//! cross-peer ordering guarantee. Unknown and malformed frames are counted
//! and dropped, never fatal to the pipeline.

use crate::annotations::AnnotationSyncEngine;
use crate::bootstrap::ConfigBootstrapSequencer;
use crate::channels::ChannelRegistry;
use crate::codec::{self, InboundFrame, StateSyncFrame, TextFrame};
use crate::error::MeshError;
use crate::types::{ChannelMessage, PacketSummary, Peer, PeerId, PeerLocationEntry, StatusUpdate};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const STATUS_BROADCAST_CAPACITY: usize = 64;

/// Peer id used in packet summaries for frames that carry no origin
const RADIO_PEER: &str = "radio";

pub struct PacketIngestDispatcher {
    node_id: PeerId,
    registry: Arc<ChannelRegistry>,
    engine: Arc<AnnotationSyncEngine>,
    sequencer: ConfigBootstrapSequencer,
    peers: RwLock<HashMap<PeerId, Peer>>,
    summaries: RwLock<VecDeque<PacketSummary>>,
    ring_capacity: usize,
    unknown_count: AtomicU64,
    status_tx: broadcast::Sender<StatusUpdate>,
}

impl PacketIngestDispatcher {
    pub fn new(
        node_id: PeerId,
        registry: Arc<ChannelRegistry>,
        engine: Arc<AnnotationSyncEngine>,
        sequencer: ConfigBootstrapSequencer,
        ring_capacity: usize,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_CAPACITY);
        Self {
            node_id,
            registry,
            engine,
            sequencer,
            peers: RwLock::new(HashMap::new()),
            summaries: RwLock::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            unknown_count: AtomicU64::new(0),
            status_tx,
        }
    }

    /// Route one decoded frame; returns true when it completed the bootstrap
    pub async fn dispatch(&self, generation: u64, frame: InboundFrame) -> bool {
        self.record_summary(&frame).await;

        match frame {
            InboundFrame::Unknown { version, type_tag } => {
                self.unknown_count.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Dropped unknown frame (version {}, tag 0x{:02x})",
                    version, type_tag
                );
                if version != codec::WIRE_VERSION {
                    // An unknown tag is harmless; a foreign wire version means
                    // the bootstrap can never finish, so fail it early. fail()
                    // no-ops once the bootstrap is terminal or superseded.
                    self.sequencer.fail(
                        generation,
                        MeshError::VersionMismatch {
                            device: version,
                            supported: codec::WIRE_VERSION,
                        }
                        .user_message(),
                    );
                }
                false
            }
            InboundFrame::ConfigFragment(f) => {
                self.sequencer
                    .on_config_fragment(generation, f.section, f.complete)
            }
            InboundFrame::Handshake(f) => {
                self.touch_peer(&f.node_id).await;
                false
            }
            InboundFrame::Ack(_) => false,
            InboundFrame::NodeInfo(f) => {
                self.upsert_peer(f.peer).await;
                false
            }
            InboundFrame::Position(f) => {
                let entry = PeerLocationEntry {
                    latitude: f.latitude,
                    longitude: f.longitude,
                    timestamp: f.timestamp,
                    source: f.source,
                    seq: f.seq,
                };
                if f.peer_id == self.node_id {
                    self.engine.note_user_location(entry).await;
                } else {
                    self.touch_peer(&f.peer_id).await;
                    self.engine.merge_peer_location(f.peer_id, entry).await;
                }
                false
            }
            InboundFrame::Text(f) => {
                self.touch_peer(&f.sender).await;
                self.ingest_text(f).await;
                false
            }
            InboundFrame::Annotation(f) => {
                self.touch_peer(&f.annotation.origin).await;
                self.engine.merge_annotation(f.annotation).await;
                false
            }
            InboundFrame::AnnotationDelete(f) => {
                self.touch_peer(&f.origin).await;
                self.engine.apply_deletions(&f.ids).await;
                false
            }
            InboundFrame::StateSync(f) => {
                self.touch_peer(&f.origin).await;
                self.ingest_state_sync(f).await;
                false
            }
            InboundFrame::Status(f) => {
                self.touch_peer(&f.status.peer_id).await;
                // Nobody listening is fine.
                let _ = self.status_tx.send(f.status);
                false
            }
        }
    }

    /// Count a frame that failed to decode at all
    pub fn note_malformed(&self, reason: &str) {
        self.unknown_count.fetch_add(1, Ordering::SeqCst);
        debug!("Dropped malformed frame: {}", reason);
    }

    async fn ingest_text(&self, frame: TextFrame) {
        let channel_id = if frame.recipient.as_deref() == Some(self.node_id.as_str()) {
            // Direct message to us: derive the DM channel for the sender.
            self.registry
                .get_or_create_direct_message_channel(&frame.sender)
                .await
                .id
        } else {
            match frame.channel_id {
                Some(id) => id,
                None => self.registry.default_channel_id(),
            }
        };

        self.registry
            .append_message(ChannelMessage {
                channel_id,
                sender_id: frame.sender,
                content: frame.content,
                timestamp: frame.timestamp,
            })
            .await;
    }

    async fn ingest_state_sync(&self, frame: StateSyncFrame) {
        if let Some(target) = &frame.target {
            if target != &self.node_id {
                debug!("Ignoring state sync addressed to {}", target);
                return;
            }
        }

        if let Some(channels) = frame.channels {
            for channel in channels {
                self.registry.ensure_channel(channel).await;
            }
        }
        if let Some(locations) = frame.peer_locations {
            for (peer_id, entry) in locations {
                if peer_id == self.node_id {
                    continue;
                }
                self.touch_peer(&peer_id).await;
                self.engine.merge_peer_location(peer_id, entry).await;
            }
        }
        if let Some(annotations) = frame.annotations {
            for annotation in annotations {
                self.engine.merge_annotation(annotation).await;
            }
        }
    }

    async fn record_summary(&self, frame: &InboundFrame) {
        let peer_id = frame
            .origin_peer()
            .cloned()
            .unwrap_or_else(|| RADIO_PEER.to_string());
        let peer_nickname = self
            .peers
            .read()
            .await
            .get(&peer_id)
            .map(|p| p.nickname.clone());

        let mut summaries = self.summaries.write().await;
        if summaries.len() >= self.ring_capacity {
            summaries.pop_front();
        }
        summaries.push_back(PacketSummary {
            peer_id,
            peer_nickname,
            packet_type: frame.type_name().to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Refresh a peer's last_seen, creating it on first observation
    async fn touch_peer(&self, peer_id: &PeerId) {
        let mut peers = self.peers.write().await;
        peers
            .entry(peer_id.clone())
            .and_modify(|p| p.last_seen = Utc::now())
            .or_insert_with(|| {
                debug!("First observation of peer {}", peer_id);
                Peer::unknown(peer_id.clone())
            });
    }

    /// Merge a full node-info record for a peer
    async fn upsert_peer(&self, incoming: Peer) {
        if incoming.has_public_key {
            match &incoming.public_key {
                Some(key) => {
                    self.registry
                        .resolve_peer_key(&incoming.id, key.clone())
                        .await;
                }
                None => warn!(
                    "Peer {} claims public-key capability but sent no key",
                    incoming.id
                ),
            }
        }

        let mut peers = self.peers.write().await;
        peers
            .entry(incoming.id.clone())
            .and_modify(|existing| {
                existing.nickname = incoming.nickname.clone();
                existing.long_name = incoming.long_name.clone();
                existing.has_public_key = incoming.has_public_key;
                if incoming.public_key.is_some() {
                    existing.public_key = incoming.public_key.clone();
                }
                existing.last_seen = Utc::now();
            })
            .or_insert_with(|| {
                let mut peer = incoming;
                peer.last_seen = Utc::now();
                peer
            });
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn packet_summaries(&self) -> Vec<PacketSummary> {
        self.summaries.read().await.iter().cloned().collect()
    }

    pub async fn summary_count(&self) -> usize {
        self.summaries.read().await.len()
    }

    pub fn unknown_packet_count(&self) -> u64 {
        self.unknown_count.load(Ordering::SeqCst)
    }

    /// Subscribe to peer status beacons
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }
}
