//! Bluetooth radio link over btleplug

use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::StreamExt;
use mesh_core::error::{MeshError, MeshResult};
use mesh_core::link::TransportLink;
use mesh_core::types::{DeviceInfo, TransportKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest frame the radio accepts in one characteristic write
const BLE_MAX_PAYLOAD: usize = 512;

/// Maximum connect attempts before giving up
const MAX_CONNECT_RETRIES: u32 = 5;

const SCAN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const INBOUND_BUFFER: usize = 100;

/// Bluetooth-linked radio transport
///
/// Scans as a BLE central, connects to one radio at a time, writes frames to
/// the radio's write characteristic and forwards notification values as
/// inbound frames.
pub struct BluetoothLink {
    adapter: Arc<RwLock<Option<Adapter>>>,
    /// Peripherals seen during the current/most recent scan, keyed by device id
    discovered: Arc<DashMap<String, Peripheral>>,
    connected: Arc<RwLock<Option<Connected>>>,
    inbound_rx: Arc<RwLock<Option<mpsc::Receiver<Vec<u8>>>>>,
    scan_task: StdMutex<Option<JoinHandle<()>>>,
    notify_task: StdMutex<Option<JoinHandle<()>>>,
}

struct Connected {
    peripheral: Peripheral,
    write_char: Characteristic,
}

impl BluetoothLink {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(RwLock::new(None)),
            discovered: Arc::new(DashMap::new()),
            connected: Arc::new(RwLock::new(None)),
            inbound_rx: Arc::new(RwLock::new(None)),
            scan_task: StdMutex::new(None),
            notify_task: StdMutex::new(None),
        }
    }

    async fn ensure_adapter(&self) -> MeshResult<()> {
        let mut adapter_lock = self.adapter.write().await;
        if adapter_lock.is_none() {
            debug!("Creating BLE manager and adapter");
            let manager = Manager::new()
                .await
                .map_err(|e| MeshError::Transport(format!("failed to create BLE manager: {}", e)))?;
            let adapters = manager
                .adapters()
                .await
                .map_err(|e| MeshError::Transport(format!("failed to list BLE adapters: {}", e)))?;
            let adapter = adapters
                .into_iter()
                .next()
                .ok_or_else(|| MeshError::Transport("no BLE adapter found".to_string()))?;
            info!("BLE adapter initialized");
            *adapter_lock = Some(adapter);
        }
        Ok(())
    }

    async fn adapter(&self) -> MeshResult<Adapter> {
        self.ensure_adapter().await?;
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| MeshError::Transport("BLE adapter not initialized".to_string()))
    }

    async fn find_peripheral(&self, device: &DeviceInfo) -> MeshResult<Peripheral> {
        if let Some(entry) = self.discovered.get(&device.id) {
            return Ok(entry.clone());
        }

        // Not in the scan cache; ask the adapter directly.
        let adapter = self.adapter().await?;
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| MeshError::Transport(format!("failed to list peripherals: {}", e)))?;
        peripherals
            .into_iter()
            .find(|p| peripheral_id(p) == device.id)
            .ok_or_else(|| MeshError::PeerNotFound(device.id.clone()))
    }
}

fn peripheral_id(peripheral: &Peripheral) -> String {
    format!("{:?}", peripheral.id())
}

impl Default for BluetoothLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportLink for BluetoothLink {
    async fn start_scan(&self, results: mpsc::Sender<DeviceInfo>) -> MeshResult<()> {
        if self.scan_task.lock().unwrap().is_some() {
            debug!("BLE scan already running");
            return Ok(());
        }

        // Each scan reports from a clean slate; a device seen in an earlier
        // window must be reported again to the new receiver.
        self.discovered.clear();

        let adapter = self.adapter().await?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| MeshError::Transport(format!("failed to start BLE scan: {}", e)))?;
        info!("BLE scan started");

        let discovered = Arc::clone(&self.discovered);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
                let peripherals = match adapter.peripherals().await {
                    Ok(list) => list,
                    Err(e) => {
                        warn!("BLE peripheral poll failed: {}", e);
                        continue;
                    }
                };

                for peripheral in peripherals {
                    let id = peripheral_id(&peripheral);
                    if discovered.contains_key(&id) {
                        continue;
                    }

                    let properties = peripheral.properties().await.ok().flatten();
                    let name = properties
                        .as_ref()
                        .and_then(|p| p.local_name.clone())
                        .unwrap_or_else(|| "Unknown radio".to_string());
                    let address = properties
                        .as_ref()
                        .map(|p| p.address.to_string())
                        .unwrap_or_default();

                    discovered.insert(id.clone(), peripheral);
                    let device = DeviceInfo {
                        id,
                        name,
                        address,
                        transport: TransportKind::Bluetooth,
                    };
                    debug!("Discovered BLE device {} ({})", device.name, device.id);
                    if results.send(device).await.is_err() {
                        // Receiver gone; the scan window ended on the caller side.
                        return;
                    }
                }
            }
        });

        *self.scan_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn stop_scan(&self) -> MeshResult<()> {
        let handle = self.scan_task.lock().unwrap().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        handle.abort();

        let adapter = self.adapter().await?;
        adapter
            .stop_scan()
            .await
            .map_err(|e| MeshError::Transport(format!("failed to stop BLE scan: {}", e)))?;
        info!("BLE scan stopped");
        Ok(())
    }

    async fn connect(&self, device: &DeviceInfo) -> MeshResult<()> {
        let peripheral = self.find_peripheral(device).await?;

        let mut retries = 0;
        loop {
            match peripheral.connect().await {
                Ok(()) => break,
                Err(e) => {
                    retries += 1;
                    if retries >= MAX_CONNECT_RETRIES {
                        return Err(MeshError::Transport(format!(
                            "failed to connect after {} attempts: {}",
                            retries, e
                        )));
                    }
                    warn!("BLE connect attempt {} failed, retrying: {}", retries, e);
                    let delay = Duration::from_millis(100 * (1 << (retries - 1)));
                    tokio::time::sleep(delay).await;
                }
            }
        }

        peripheral
            .discover_services()
            .await
            .map_err(|e| MeshError::Transport(format!("service discovery failed: {}", e)))?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| {
                c.properties.contains(CharPropFlags::WRITE)
                    || c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
            .cloned()
            .ok_or_else(|| {
                MeshError::Transport("no writable characteristic on device".to_string())
            })?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.properties.contains(CharPropFlags::NOTIFY))
            .cloned()
            .ok_or_else(|| {
                MeshError::Transport("no notify characteristic on device".to_string())
            })?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| MeshError::Transport(format!("notification subscribe failed: {}", e)))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| MeshError::Transport(format!("notification stream failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            // Stream ending drops tx, which signals link loss upstream.
            debug!("BLE notification stream ended");
        });
        *self.notify_task.lock().unwrap() = Some(handle);

        *self.inbound_rx.write().await = Some(rx);
        *self.connected.write().await = Some(Connected {
            peripheral,
            write_char,
        });

        info!("Connected to BLE device {}", device.id);
        Ok(())
    }

    async fn disconnect(&self) -> MeshResult<()> {
        if let Some(handle) = self.notify_task.lock().unwrap().take() {
            handle.abort();
        }
        *self.inbound_rx.write().await = None;

        let connected = self.connected.write().await.take();
        if let Some(connected) = connected {
            connected
                .peripheral
                .disconnect()
                .await
                .map_err(|e| MeshError::Transport(format!("disconnect failed: {}", e)))?;
            info!("Disconnected from BLE device");
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> MeshResult<()> {
        let connected = self.connected.read().await;
        let connected = connected
            .as_ref()
            .ok_or_else(|| MeshError::Transport("not connected to a BLE device".to_string()))?;

        connected
            .peripheral
            .write(&connected.write_char, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| MeshError::Transport(format!("BLE write failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self) -> MeshResult<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx
            .write()
            .await
            .take()
            .ok_or_else(|| MeshError::Transport("no active BLE link to subscribe to".to_string()))
    }

    fn max_payload(&self) -> usize {
        BLE_MAX_PAYLOAD
    }
}
