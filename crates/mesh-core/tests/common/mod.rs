#![allow(dead_code)]

use async_trait::async_trait;
use mesh_core::codec::{self, ConfigFragment, ConfigSection, InboundFrame};
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::link::TransportLink;
use mesh_core::persistence::MemoryDeviceStore;
use mesh_core::session::MeshSession;
use mesh_core::types::{DeviceInfo, TransportCapabilities, TransportKind};
use mesh_core::MeshConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

pub const NODE_ID: &str = "node-under-test";

pub const RADIO_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    requires_app_location_send: true,
    allows_channel_management: true,
    supports_audio: false,
    requires_connection: true,
};

pub const RESTRICTED_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    requires_app_location_send: false,
    allows_channel_management: false,
    supports_audio: true,
    requires_connection: true,
};

pub const CONNECTIONLESS_CAPABILITIES: TransportCapabilities = TransportCapabilities {
    requires_app_location_send: true,
    allows_channel_management: true,
    supports_audio: false,
    requires_connection: false,
};

/// In-memory link: captures outbound frames and lets tests inject inbound ones
pub struct MockLink {
    outbound: StdMutex<Vec<Vec<u8>>>,
    inbound_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
    fail_connect: AtomicBool,
    max_payload: AtomicUsize,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outbound: StdMutex::new(Vec::new()),
            inbound_tx: StdMutex::new(None),
            inbound_rx: StdMutex::new(None),
            fail_connect: AtomicBool::new(false),
            max_payload: AtomicUsize::new(512),
        })
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_max_payload(&self, max: usize) {
        self.max_payload.store(max, Ordering::SeqCst);
    }

    /// Feed one frame to the session's ingest loop
    pub async fn inject(&self, frame: InboundFrame) {
        let bytes = codec::encode_inbound(&frame).expect("encodable frame");
        self.inject_raw(bytes).await;
    }

    pub async fn inject_raw(&self, bytes: Vec<u8>) {
        let tx = self
            .inbound_tx
            .lock()
            .unwrap()
            .clone()
            .expect("link not connected");
        tx.send(bytes).await.expect("ingest loop gone");
    }

    /// Simulate the link dropping underneath the session
    pub fn drop_link(&self) {
        *self.inbound_tx.lock().unwrap() = None;
        *self.inbound_rx.lock().unwrap() = None;
    }

    /// Everything the session wrote, decoded back into frames
    pub fn outbound_frames(&self) -> Vec<InboundFrame> {
        self.outbound
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| codec::decode(bytes).expect("decodable outbound frame"))
            .collect()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportLink for MockLink {
    async fn start_scan(&self, results: mpsc::Sender<DeviceInfo>) -> MeshResult<()> {
        let _ = results.send(test_device()).await;
        Ok(())
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn connect(&self, _device: &DeviceInfo) -> MeshResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MeshError::Transport("mock connect refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.inbound_tx.lock().unwrap() = Some(tx);
        *self.inbound_rx.lock().unwrap() = Some(rx);
        Ok(())
    }

    async fn disconnect(&self) -> MeshResult<()> {
        self.drop_link();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> MeshResult<()> {
        self.outbound.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn subscribe(&self) -> MeshResult<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| MeshError::Transport("mock link not connected".to_string()))
    }

    fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::SeqCst)
    }
}

pub fn test_device() -> DeviceInfo {
    DeviceInfo {
        id: "mock-radio".to_string(),
        name: "Mock radio".to_string(),
        address: "00:11:22:33:44:55".to_string(),
        transport: TransportKind::Bluetooth,
    }
}

pub fn session_with(link: Arc<MockLink>, capabilities: TransportCapabilities) -> MeshSession {
    MeshSession::new(
        NODE_ID.to_string(),
        TransportKind::Bluetooth,
        capabilities,
        link,
        Arc::new(MemoryDeviceStore::new()),
        MeshConfig::default(),
    )
}

/// Stream the five config sections the bootstrap expects, in order
pub async fn complete_bootstrap(link: &MockLink) {
    let sections = [
        ConfigSection::Device,
        ConfigSection::Module,
        ConfigSection::Channel,
        ConfigSection::NodeInfo,
        ConfigSection::MyInfo,
    ];
    for section in sections {
        link.inject(InboundFrame::ConfigFragment(ConfigFragment {
            section,
            payload: serde_json::Value::Null,
            complete: section == ConfigSection::MyInfo,
        }))
        .await;
    }
}
