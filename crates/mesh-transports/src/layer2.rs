//! Direct Layer-2 link over UDP broadcast
//!
//! No radio is involved: every node on the local segment broadcasts frames
//! and listens on a shared port. Because there is no firmware to stream a
//! configuration download, this link synthesizes the bootstrap fragments
//! itself so the session reaches readiness through the same sequence as the
//! radio transports.

use async_trait::async_trait;
use mesh_core::codec::{self, ConfigFragment, ConfigSection, InboundFrame};
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::link::TransportLink;
use mesh_core::types::{DeviceInfo, PeerId, TransportKind};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default port the mesh broadcasts on
pub const DEFAULT_MESH_PORT: u16 = 17371;

/// Keep datagrams under a typical Ethernet MTU minus headers
const LAYER2_MAX_PAYLOAD: usize = 1400;

const INBOUND_BUFFER: usize = 100;

/// Broadcast mesh link for nodes sharing a network segment
pub struct Layer2Link {
    node_id: PeerId,
    port: u16,
    socket: Arc<RwLock<Option<Arc<UdpSocket>>>>,
    inbound_rx: Arc<RwLock<Option<mpsc::Receiver<Vec<u8>>>>>,
    recv_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Layer2Link {
    pub fn new(node_id: PeerId, port: u16) -> Self {
        Self {
            node_id,
            port,
            socket: Arc::new(RwLock::new(None)),
            inbound_rx: Arc::new(RwLock::new(None)),
            recv_task: StdMutex::new(None),
        }
    }

    /// Fragments a radio would stream during bootstrap, produced locally
    fn synthesized_bootstrap(&self) -> Vec<ConfigFragment> {
        let sections = [
            ConfigSection::Device,
            ConfigSection::Module,
            ConfigSection::Channel,
            ConfigSection::NodeInfo,
            ConfigSection::MyInfo,
        ];
        sections
            .iter()
            .map(|&section| ConfigFragment {
                section,
                payload: serde_json::json!({ "node_id": self.node_id }),
                complete: section == ConfigSection::MyInfo,
            })
            .collect()
    }
}

#[async_trait]
impl TransportLink for Layer2Link {
    async fn start_scan(&self, results: mpsc::Sender<DeviceInfo>) -> MeshResult<()> {
        // The segment itself is the only "device" to connect to.
        let device = DeviceInfo {
            id: "layer2-broadcast".to_string(),
            name: "Local network mesh".to_string(),
            address: format!("255.255.255.255:{}", self.port),
            transport: TransportKind::Layer2,
        };
        let _ = results.send(device).await;
        Ok(())
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn connect(&self, _device: &DeviceInfo) -> MeshResult<()> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(|e| MeshError::Transport(format!("failed to bind mesh port: {}", e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| MeshError::Transport(format!("failed to enable broadcast: {}", e)))?;
        let socket = Arc::new(socket);
        info!("Joined Layer-2 mesh on port {}", self.port);

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

        // Queue the synthesized config download ahead of any network traffic;
        // the session drains it after it has sent its handshake.
        for fragment in self.synthesized_bootstrap() {
            let bytes = codec::encode_inbound(&InboundFrame::ConfigFragment(fragment))?;
            tx.send(bytes)
                .await
                .map_err(|_| MeshError::Transport("inbound channel closed".to_string()))?;
        }

        let recv_socket = Arc::clone(&socket);
        let own_id = self.node_id.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Mesh socket receive failed: {}", e);
                        break;
                    }
                };
                let bytes = buf[..len].to_vec();

                // Broadcast sockets hear their own datagrams; drop those.
                if let Ok(frame) = codec::decode(&bytes) {
                    if frame.origin_peer() == Some(&own_id) {
                        continue;
                    }
                }

                debug!("Received {} mesh bytes from {}", len, from);
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });
        *self.recv_task.lock().unwrap() = Some(handle);
        *self.inbound_rx.write().await = Some(rx);
        *self.socket.write().await = Some(socket);
        Ok(())
    }

    async fn disconnect(&self) -> MeshResult<()> {
        if let Some(handle) = self.recv_task.lock().unwrap().take() {
            handle.abort();
        }
        *self.inbound_rx.write().await = None;
        if self.socket.write().await.take().is_some() {
            info!("Left Layer-2 mesh");
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> MeshResult<()> {
        let socket = self.socket.read().await;
        let socket = socket
            .as_ref()
            .ok_or_else(|| MeshError::Transport("not joined to the mesh".to_string()))?;

        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port);
        socket.send_to(data, target).await?;
        Ok(())
    }

    async fn subscribe(&self) -> MeshResult<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx
            .write()
            .await
            .take()
            .ok_or_else(|| MeshError::Transport("not joined to the mesh".to_string()))
    }

    fn max_payload(&self) -> usize {
        LAYER2_MAX_PAYLOAD
    }
}
