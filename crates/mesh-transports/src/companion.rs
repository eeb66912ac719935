//! Companion-app link over a local IPC socket
//!
//! The companion app owns the actual radio hardware; this link speaks to it
//! through a Unix domain socket using length-prefixed frames. Discovery is
//! trivial: the socket either exists or it does not.

use async_trait::async_trait;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::link::TransportLink;
use mesh_core::types::{DeviceInfo, TransportKind};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default socket path used by the companion service
pub const DEFAULT_SOCKET_PATH: &str = "/run/fieldmesh/companion.sock";

/// IPC frames are not radio-constrained; cap them at 64 KiB anyway
const COMPANION_MAX_PAYLOAD: usize = 64 * 1024;

const INBOUND_BUFFER: usize = 100;

/// Link to the companion app's mesh service
pub struct CompanionLink {
    socket_path: PathBuf,
    writer: Arc<Mutex<Option<tokio::net::unix::OwnedWriteHalf>>>,
    inbound_rx: Arc<RwLock<Option<mpsc::Receiver<Vec<u8>>>>>,
    read_task: StdMutex<Option<JoinHandle<()>>>,
}

impl CompanionLink {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            writer: Arc::new(Mutex::new(None)),
            inbound_rx: Arc::new(RwLock::new(None)),
            read_task: StdMutex::new(None),
        }
    }

    fn map_connect_error(&self, e: std::io::Error) -> MeshError {
        match e.kind() {
            ErrorKind::NotFound => {
                MeshError::NotInstalled(format!("no socket at {}", self.socket_path.display()))
            }
            ErrorKind::ConnectionRefused => MeshError::ServiceNotRunning(e.to_string()),
            _ => MeshError::Transport(format!("companion socket error: {}", e)),
        }
    }
}

impl Default for CompanionLink {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

#[async_trait]
impl TransportLink for CompanionLink {
    async fn start_scan(&self, results: mpsc::Sender<DeviceInfo>) -> MeshResult<()> {
        // There is exactly one companion service; report it if the socket exists.
        if !self.socket_path.exists() {
            debug!("Companion socket {} not present", self.socket_path.display());
            return Err(MeshError::NotInstalled(format!(
                "no socket at {}",
                self.socket_path.display()
            )));
        }

        let device = DeviceInfo {
            id: "companion".to_string(),
            name: "Companion app".to_string(),
            address: self.socket_path.display().to_string(),
            transport: TransportKind::Companion,
        };
        let _ = results.send(device).await;
        Ok(())
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn connect(&self, _device: &DeviceInfo) -> MeshResult<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| self.map_connect_error(e))?;
        info!("Connected to companion service at {}", self.socket_path.display());

        let (mut read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let handle = tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if read_half.read_exact(&mut len_buf).await.is_err() {
                    debug!("Companion socket closed");
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > COMPANION_MAX_PAYLOAD {
                    warn!("Companion frame of {} bytes exceeds limit, closing", len);
                    break;
                }
                let mut frame = vec![0u8; len];
                if read_half.read_exact(&mut frame).await.is_err() {
                    debug!("Companion socket closed mid-frame");
                    break;
                }
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            // Dropping tx closes the inbound channel, signalling link loss.
        });
        *self.read_task.lock().unwrap() = Some(handle);
        *self.inbound_rx.write().await = Some(rx);
        Ok(())
    }

    async fn disconnect(&self) -> MeshResult<()> {
        if let Some(handle) = self.read_task.lock().unwrap().take() {
            handle.abort();
        }
        *self.inbound_rx.write().await = None;

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
            info!("Disconnected from companion service");
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> MeshResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| {
            MeshError::ServiceNotRunning("no active companion connection".to_string())
        })?;

        let len = (data.len() as u32).to_be_bytes();
        writer.write_all(&len).await?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn subscribe(&self) -> MeshResult<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx
            .write()
            .await
            .take()
            .ok_or_else(|| {
                MeshError::ServiceNotRunning("no active companion connection".to_string())
            })
    }

    fn max_payload(&self) -> usize {
        COMPANION_MAX_PAYLOAD
    }
}
