//! Channel registry and message store

use crate::error::{MeshError, MeshResult};
use crate::types::{Channel, ChannelId, ChannelMessage, PeerId};
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace for deriving deterministic channel ids
const CHANNEL_NAMESPACE: Uuid = Uuid::from_u128(0x8f3c_d2a1_7b44_4e19_9c60_5d10_fa2e_81b7);

const MESSAGE_BROADCAST_CAPACITY: usize = 256;

/// State tracked for a direct-message channel
#[derive(Debug, Clone)]
pub struct DirectChannelState {
    pub peer_id: PeerId,
    pub public_key: Option<Vec<u8>>,
    /// True once the peer's public key has been resolved
    pub ready: bool,
}

/// Holds channels and their append-only message logs
///
/// The default channel always exists, cannot be deleted or renamed, and is
/// the fallback for messages addressed to a channel we do not know. Message
/// appends are pushed to subscribers through a broadcast channel.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Channel>>,
    messages: RwLock<HashMap<ChannelId, Vec<ChannelMessage>>>,
    dm_state: RwLock<HashMap<ChannelId, DirectChannelState>>,
    selected: RwLock<ChannelId>,
    message_tx: broadcast::Sender<ChannelMessage>,
    default_id: ChannelId,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let default_id = Uuid::new_v5(&CHANNEL_NAMESPACE, b"primary");
        let default_channel = Channel {
            id: default_id,
            name: "Primary".to_string(),
            members: HashSet::new(),
            is_default: true,
            is_direct_message: false,
        };

        let mut channels = HashMap::new();
        channels.insert(default_id, default_channel);

        let (message_tx, _) = broadcast::channel(MESSAGE_BROADCAST_CAPACITY);

        Self {
            channels: RwLock::new(channels),
            messages: RwLock::new(HashMap::new()),
            dm_state: RwLock::new(HashMap::new()),
            selected: RwLock::new(default_id),
            message_tx,
            default_id,
        }
    }

    pub fn default_channel_id(&self) -> ChannelId {
        self.default_id
    }

    /// Deterministic id of the direct-message channel for a peer
    pub fn direct_channel_id(peer_id: &PeerId) -> ChannelId {
        Uuid::new_v5(&CHANNEL_NAMESPACE, format!("dm:{}", peer_id).as_bytes())
    }

    /// Create a new named channel
    pub async fn create_channel(&self, name: &str) -> MeshResult<Channel> {
        if name.trim().is_empty() {
            return Err(MeshError::InvalidChannelOperation(
                "channel name must not be empty".to_string(),
            ));
        }

        let channel = Channel {
            id: Uuid::new_v4(),
            name: name.to_string(),
            members: HashSet::new(),
            is_default: false,
            is_direct_message: false,
        };

        self.channels.write().await.insert(channel.id, channel.clone());
        info!("Created channel '{}' ({})", channel.name, channel.id);
        Ok(channel)
    }

    /// Delete a channel; the default and direct-message channels are protected
    pub async fn delete_channel(&self, id: ChannelId) -> MeshResult<()> {
        let mut channels = self.channels.write().await;
        let channel = channels
            .get(&id)
            .ok_or(MeshError::ChannelNotFound(id))?;

        if channel.is_default {
            return Err(MeshError::InvalidChannelOperation(
                "the default channel cannot be deleted".to_string(),
            ));
        }
        if channel.is_direct_message {
            return Err(MeshError::InvalidChannelOperation(
                "direct-message channels cannot be deleted".to_string(),
            ));
        }

        let name = channel.name.clone();
        channels.remove(&id);
        drop(channels);

        self.messages.write().await.remove(&id);

        let mut selected = self.selected.write().await;
        if *selected == id {
            *selected = self.default_id;
        }

        info!("Deleted channel '{}' ({})", name, id);
        Ok(())
    }

    /// Select the channel subsequent sends default to
    pub async fn select_channel(&self, id: ChannelId) -> MeshResult<()> {
        if !self.channels.read().await.contains_key(&id) {
            return Err(MeshError::ChannelNotFound(id));
        }
        *self.selected.write().await = id;
        debug!("Selected channel {}", id);
        Ok(())
    }

    pub async fn selected_channel(&self) -> ChannelId {
        *self.selected.read().await
    }

    /// Get or lazily create the direct-message channel for a peer
    ///
    /// Idempotent: the channel id is derived from the peer id, so repeated
    /// calls return the same channel.
    pub async fn get_or_create_direct_message_channel(&self, peer_id: &PeerId) -> Channel {
        let id = Self::direct_channel_id(peer_id);

        if let Some(existing) = self.channels.read().await.get(&id) {
            return existing.clone();
        }

        let mut members = HashSet::new();
        members.insert(peer_id.clone());
        let channel = Channel {
            id,
            name: format!("DM {}", peer_id),
            members,
            is_default: false,
            is_direct_message: true,
        };

        self.channels.write().await.insert(id, channel.clone());
        self.dm_state.write().await.insert(
            id,
            DirectChannelState {
                peer_id: peer_id.clone(),
                public_key: None,
                ready: false,
            },
        );
        info!("Created direct-message channel for peer {}", peer_id);
        channel
    }

    /// Record a peer's resolved public key, marking their DM channel ready
    pub async fn resolve_peer_key(&self, peer_id: &PeerId, public_key: Vec<u8>) {
        let id = Self::direct_channel_id(peer_id);
        let mut dm_state = self.dm_state.write().await;
        if let Some(state) = dm_state.get_mut(&id) {
            state.public_key = Some(public_key);
            state.ready = true;
            debug!("Direct-message channel for {} is now PKI-ready", peer_id);
        }
    }

    /// State of a direct-message channel, if `id` is one
    pub async fn direct_channel_state(&self, id: ChannelId) -> Option<DirectChannelState> {
        self.dm_state.read().await.get(&id).cloned()
    }

    /// Insert a channel learned from a state sync, keeping existing ones
    pub async fn ensure_channel(&self, channel: Channel) {
        let mut channels = self.channels.write().await;
        channels.entry(channel.id).or_insert_with(|| {
            debug!("Learned channel '{}' from sync", channel.name);
            channel
        });
    }

    /// Append a message to its channel log and push it to subscribers
    ///
    /// Logs are ordered by timestamp; messages with equal timestamps keep
    /// arrival order. A message for an unknown channel lands in the default
    /// channel rather than being dropped.
    pub async fn append_message(&self, mut message: ChannelMessage) {
        if !self.channels.read().await.contains_key(&message.channel_id) {
            warn!(
                "Message for unknown channel {}, routing to default",
                message.channel_id
            );
            message.channel_id = self.default_id;
        }

        {
            let mut channels = self.channels.write().await;
            if let Some(channel) = channels.get_mut(&message.channel_id) {
                if !channel.is_direct_message {
                    channel.members.insert(message.sender_id.clone());
                }
            }
        }

        let mut messages = self.messages.write().await;
        let log = messages.entry(message.channel_id).or_default();
        let position = log
            .iter()
            .rposition(|existing| existing.timestamp <= message.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        log.insert(position, message.clone());
        drop(messages);

        // Nobody listening is fine.
        let _ = self.message_tx.send(message);
    }

    /// Snapshot of a channel's message log
    pub async fn messages(&self, channel_id: ChannelId) -> Vec<ChannelMessage> {
        self.messages
            .read()
            .await
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe to the message push stream
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.message_tx.subscribe()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.read().await.get(&id).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn message(channel_id: ChannelId, sender: &str, content: &str) -> ChannelMessage {
        ChannelMessage {
            channel_id,
            sender_id: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn default_channel_always_exists() {
        let registry = ChannelRegistry::new();
        let channels = registry.channels().await;
        assert_eq!(channels.len(), 1);
        assert!(channels[0].is_default);
        assert_eq!(channels[0].id, registry.default_channel_id());
    }

    #[tokio::test]
    async fn direct_channel_id_is_deterministic() {
        let alice = "alice".to_string();
        let bob = "bob".to_string();
        assert_eq!(
            ChannelRegistry::direct_channel_id(&alice),
            ChannelRegistry::direct_channel_id(&alice)
        );
        assert_ne!(
            ChannelRegistry::direct_channel_id(&alice),
            ChannelRegistry::direct_channel_id(&bob)
        );
    }

    #[tokio::test]
    async fn messages_order_by_timestamp_with_arrival_tiebreak() {
        let registry = ChannelRegistry::new();
        let channel = registry.default_channel_id();
        let base = Utc::now();

        let mut late = message(channel, "alice", "late");
        late.timestamp = base + Duration::seconds(10);
        let mut early = message(channel, "bob", "early");
        early.timestamp = base;
        let mut tied_first = message(channel, "carol", "tied-first");
        tied_first.timestamp = base + Duration::seconds(5);
        let mut tied_second = message(channel, "dave", "tied-second");
        tied_second.timestamp = base + Duration::seconds(5);

        registry.append_message(late).await;
        registry.append_message(early).await;
        registry.append_message(tied_first).await;
        registry.append_message(tied_second).await;

        let log = registry.messages(channel).await;
        let contents: Vec<&str> = log.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["early", "tied-first", "tied-second", "late"]);
    }

    #[tokio::test]
    async fn deleting_selected_channel_falls_back_to_default() {
        let registry = ChannelRegistry::new();
        let ops = registry.create_channel("Ops").await.unwrap();
        registry.select_channel(ops.id).await.unwrap();
        registry.delete_channel(ops.id).await.unwrap();
        assert_eq!(registry.selected_channel().await, registry.default_channel_id());
    }

    #[tokio::test]
    async fn deleting_default_channel_is_rejected() {
        let registry = ChannelRegistry::new();
        let result = registry.delete_channel(registry.default_channel_id()).await;
        assert!(matches!(result, Err(MeshError::InvalidChannelOperation(_))));
        assert_eq!(registry.channels().await.len(), 1);
    }

    #[tokio::test]
    async fn deleting_direct_message_channel_is_rejected() {
        let registry = ChannelRegistry::new();
        let dm = registry
            .get_or_create_direct_message_channel(&"alice".to_string())
            .await;

        let result = registry.delete_channel(dm.id).await;
        assert!(matches!(result, Err(MeshError::InvalidChannelOperation(_))));
        assert!(registry.channel(dm.id).await.is_some());
        assert_eq!(registry.channel_count().await, 2);
    }

    #[tokio::test]
    async fn unknown_channel_message_routes_to_default() {
        let registry = ChannelRegistry::new();
        let ghost = Uuid::new_v4();
        registry.append_message(message(ghost, "alice", "hello")).await;

        let log = registry.messages(registry.default_channel_id()).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].content, "hello");
    }
}
