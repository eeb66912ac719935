//! Annotation and peer-location sync engine
//!
//! Holds the authoritative local copy of the shared annotation set and the
//! most recent location per peer, merged with peer updates by sequence number
//! rather than wall-clock time so clock skew between peers cannot reorder
//! state. Deletions are session-scoped tombstones that beat any update for
//! the same id.

use crate::types::{Annotation, AnnotationId, PeerId, PeerLocationEntry};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub type AnnotationCallback = Box<dyn Fn(&Annotation) + Send + Sync>;
pub type PeerLocationCallback = Box<dyn Fn(&PeerId, &PeerLocationEntry) + Send + Sync>;
pub type UserLocationCallback = Box<dyn Fn(&PeerLocationEntry) + Send + Sync>;
pub type PacketTooLargeCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Merges and stores shared annotation/location state
///
/// All mutation goes through the merge methods here; inbound sync packets and
/// local send operations take the same path, so the merge rules hold no
/// matter where an update came from.
pub struct AnnotationSyncEngine {
    annotations: RwLock<HashMap<AnnotationId, Annotation>>,
    /// Deleted ids for the current sync session; a tombstoned id never
    /// resurrects, whatever sequence number an update carries
    tombstones: RwLock<HashSet<AnnotationId>>,
    peer_locations: RwLock<HashMap<PeerId, PeerLocationEntry>>,
    annotation_cb: RwLock<Option<AnnotationCallback>>,
    peer_location_cb: RwLock<Option<PeerLocationCallback>>,
    user_location_cb: RwLock<Option<UserLocationCallback>>,
    packet_too_large_cb: RwLock<Option<PacketTooLargeCallback>>,
}

impl AnnotationSyncEngine {
    pub fn new() -> Self {
        Self {
            annotations: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashSet::new()),
            peer_locations: RwLock::new(HashMap::new()),
            annotation_cb: RwLock::new(None),
            peer_location_cb: RwLock::new(None),
            user_location_cb: RwLock::new(None),
            packet_too_large_cb: RwLock::new(None),
        }
    }

    /// Start a fresh sync session, clearing the previous session's tombstones
    pub async fn begin_session(&self) {
        let mut tombstones = self.tombstones.write().await;
        if !tombstones.is_empty() {
            debug!("Clearing {} tombstones from previous session", tombstones.len());
            tombstones.clear();
        }
    }

    /// Merge an annotation update; returns true if it was applied
    ///
    /// Higher sequence number wins per id. Equal sequence numbers from
    /// different peers are broken deterministically: the lexically greater
    /// origin peer id wins, so every node converges to the same version
    /// regardless of arrival order.
    pub async fn merge_annotation(&self, incoming: Annotation) -> bool {
        if self.tombstones.read().await.contains(&incoming.id) {
            debug!(
                "Dropping update for tombstoned annotation {} (seq {})",
                incoming.id, incoming.seq
            );
            return false;
        }

        let applied = {
            let mut annotations = self.annotations.write().await;
            match annotations.get(&incoming.id) {
                Some(existing)
                    if existing.seq > incoming.seq
                        || (existing.seq == incoming.seq
                            && existing.origin >= incoming.origin) =>
                {
                    debug!(
                        "Keeping annotation {} at seq {} over incoming seq {}",
                        incoming.id, existing.seq, incoming.seq
                    );
                    None
                }
                _ => {
                    annotations.insert(incoming.id, incoming.clone());
                    Some(incoming)
                }
            }
        };

        match applied {
            Some(annotation) => {
                if let Some(cb) = self.annotation_cb.read().await.as_ref() {
                    cb(&annotation);
                }
                true
            }
            None => false,
        }
    }

    /// Remove matching ids unconditionally and tombstone them for this session
    pub async fn apply_deletions(&self, ids: &[AnnotationId]) {
        let mut annotations = self.annotations.write().await;
        let mut tombstones = self.tombstones.write().await;
        for id in ids {
            annotations.remove(id);
            tombstones.insert(*id);
        }
        info!("Applied {} annotation deletions", ids.len());
    }

    /// Merge a peer location; last writer by sequence number wins
    pub async fn merge_peer_location(&self, peer_id: PeerId, entry: PeerLocationEntry) -> bool {
        let applied = {
            let mut locations = self.peer_locations.write().await;
            match locations.get(&peer_id) {
                Some(existing) if existing.seq >= entry.seq => {
                    debug!(
                        "Keeping location for {} at seq {} over incoming seq {}",
                        peer_id, existing.seq, entry.seq
                    );
                    None
                }
                _ => {
                    locations.insert(peer_id.clone(), entry.clone());
                    Some(entry)
                }
            }
        };

        match applied {
            Some(entry) => {
                if let Some(cb) = self.peer_location_cb.read().await.as_ref() {
                    cb(&peer_id, &entry);
                }
                true
            }
            None => false,
        }
    }

    /// Surface our own position echoed back by the transport
    pub async fn note_user_location(&self, entry: PeerLocationEntry) {
        if let Some(cb) = self.user_location_cb.read().await.as_ref() {
            cb(&entry);
        }
    }

    /// Report an outbound payload that exceeds the transport maximum
    pub async fn report_oversize(&self, actual: usize, max: usize) {
        warn!(
            "Rejecting oversized payload: {} bytes against a {} byte maximum",
            actual, max
        );
        if let Some(cb) = self.packet_too_large_cb.read().await.as_ref() {
            cb(actual, max);
        }
    }

    pub async fn annotations(&self) -> Vec<Annotation> {
        self.annotations.read().await.values().cloned().collect()
    }

    pub async fn annotation(&self, id: AnnotationId) -> Option<Annotation> {
        self.annotations.read().await.get(&id).cloned()
    }

    pub async fn peer_locations(&self) -> HashMap<PeerId, PeerLocationEntry> {
        self.peer_locations.read().await.clone()
    }

    pub async fn peer_location(&self, peer_id: &PeerId) -> Option<PeerLocationEntry> {
        self.peer_locations.read().await.get(peer_id).cloned()
    }

    pub async fn set_annotation_callback(&self, cb: AnnotationCallback) {
        *self.annotation_cb.write().await = Some(cb);
    }

    pub async fn set_peer_location_callback(&self, cb: PeerLocationCallback) {
        *self.peer_location_cb.write().await = Some(cb);
    }

    pub async fn set_user_location_callback(&self, cb: UserLocationCallback) {
        *self.user_location_cb.write().await = Some(cb);
    }

    pub async fn set_packet_too_large_callback(&self, cb: PacketTooLargeCallback) {
        *self.packet_too_large_cb.write().await = Some(cb);
    }
}

impl Default for AnnotationSyncEngine {
    fn default() -> Self {
        Self::new()
    }
}
