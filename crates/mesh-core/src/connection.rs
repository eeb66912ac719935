//! Connection state machine governing the connect/disconnect lifecycle

use crate::error::{MeshError, MeshResult};
use crate::link::TransportLink;
use crate::persistence::DeviceStore;
use crate::types::{ConnectionState, DeviceInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SCAN_RESULT_BUFFER: usize = 32;

/// Drives the per-transport connection lifecycle
///
/// Publishes exactly one authoritative [`ConnectionState`] at a time through a
/// watch channel. Every connect attempt gets a fresh generation number; any
/// timer or callback that outlives its attempt checks the generation and
/// no-ops instead of mutating stale state.
pub struct ConnectionStateMachine {
    link: Arc<dyn TransportLink>,
    device_store: Arc<dyn DeviceStore>,
    state_tx: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    connect_lock: Mutex<()>,
    scan_window_task: StdMutex<Option<JoinHandle<()>>>,
    scan_window: Duration,
    connect_timeout: Duration,
}

impl ConnectionStateMachine {
    pub fn new(
        link: Arc<dyn TransportLink>,
        device_store: Arc<dyn DeviceStore>,
        scan_window: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            device_store,
            state_tx,
            generation: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
            scan_window_task: StdMutex::new(None),
            scan_window,
            connect_timeout,
        }
    }

    /// Subscribe to connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the current connection state
    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// True when a new connect attempt may be started
    pub fn is_ready_for_new_connection(&self) -> bool {
        self.state_tx.borrow().is_ready_for_new_connection()
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    /// Start a device scan
    ///
    /// Results stream through the returned receiver; the receiver closing
    /// marks the end of the scan window. Starting a scan while one is already
    /// running restarts it.
    pub async fn scan_for_devices(&self) -> MeshResult<mpsc::Receiver<DeviceInfo>> {
        self.stop_scan().await?;

        info!("Starting device scan ({}s window)", self.scan_window.as_secs());
        let (tx, rx) = mpsc::channel(SCAN_RESULT_BUFFER);
        self.link.start_scan(tx).await?;

        // The window timer ends the scan on its own; an explicit stop_scan
        // cancels the timer instead.
        let link = Arc::clone(&self.link);
        let window = self.scan_window;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            debug!("Scan window elapsed, stopping scan");
            if let Err(e) = link.stop_scan().await {
                warn!("Failed to stop scan after window elapsed: {}", e);
            }
        });
        *self.scan_window_task.lock().unwrap() = Some(handle);

        Ok(rx)
    }

    /// Stop a running scan; stopping an idle scanner is a no-op
    pub async fn stop_scan(&self) -> MeshResult<()> {
        if let Some(handle) = self.scan_window_task.lock().unwrap().take() {
            handle.abort();
        }
        self.link.stop_scan().await
    }

    /// Connect to a device, returning the generation of the new attempt
    ///
    /// Rejected with [`MeshError::NotReady`] unless the current state is
    /// `Disconnected` or `Error`. At most one attempt is in flight at a time.
    pub async fn connect_to_device(&self, device: DeviceInfo) -> MeshResult<u64> {
        let _guard = self.connect_lock.lock().await;

        {
            let state = self.state_tx.borrow();
            if !state.is_ready_for_new_connection() {
                return Err(MeshError::NotReady(format!(
                    "connection is currently {}",
                    state.label()
                )));
            }
        }

        // A scan competing with a connect attempt confuses most radios.
        if let Err(e) = self.stop_scan().await {
            debug!("Scan stop before connect failed: {}", e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Connecting to device {} via {} (generation {})",
            device.id, device.transport, generation
        );
        self.state_tx.send_replace(ConnectionState::Connecting);

        // A link whose connect never returns must not pin the machine in
        // Connecting; only bounded attempts may hold the Connecting state.
        let connect_result =
            match tokio::time::timeout(self.connect_timeout, self.link.connect(&device)).await {
                Ok(result) => result,
                Err(_) => Err(MeshError::Transport(format!(
                    "connect attempt gave up after {:?}",
                    self.connect_timeout
                ))),
            };

        match connect_result {
            Ok(()) => {
                if !self.is_current(generation) {
                    // A force_reset superseded this attempt mid-flight.
                    warn!("Connect attempt {} superseded, tearing link back down", generation);
                    if let Err(e) = self.link.disconnect().await {
                        debug!("Teardown of superseded link failed: {}", e);
                    }
                    return Err(MeshError::Transport(
                        "connection attempt superseded by reset".to_string(),
                    ));
                }

                info!("Link established to device {}", device.id);
                self.state_tx
                    .send_replace(ConnectionState::Connected(device.clone()));

                if let Err(e) = self.device_store.store_last_device(&device).await {
                    warn!("Failed to persist last connected device: {}", e);
                }

                Ok(generation)
            }
            Err(e) => {
                if self.is_current(generation) {
                    self.state_tx
                        .send_replace(ConnectionState::Error(e.user_message()));
                }
                Err(e)
            }
        }
    }

    /// Disconnect and return to `Disconnected`
    pub async fn disconnect_from_device(&self) -> MeshResult<()> {
        info!("Disconnecting from device");
        // Bumping the generation first invalidates any pending timers.
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.link.disconnect().await {
            debug!("Link disconnect reported: {}", e);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    /// Force the machine back to `Disconnected` from any state
    pub async fn force_reset(&self) {
        warn!("Force reset requested");
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self.stop_scan().await {
            debug!("Scan stop during force reset failed: {}", e);
        }
        if let Err(e) = self.link.disconnect().await {
            debug!("Link disconnect during force reset failed: {}", e);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Record link loss observed by the ingest loop of attempt `generation`
    pub fn on_link_lost(&self, generation: u64) {
        if !self.is_current(generation) {
            debug!("Ignoring link loss from stale generation {}", generation);
            return;
        }
        if self.state_tx.borrow().is_connected() {
            warn!("Link lost, returning to Disconnected");
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Promote `Connected` to `ServiceConnected` once the bootstrap completes
    pub fn mark_service_connected(&self, generation: u64) {
        if !self.is_current(generation) {
            debug!(
                "Ignoring service-connected mark from stale generation {}",
                generation
            );
            return;
        }
        let device = match &*self.state_tx.borrow() {
            ConnectionState::Connected(device) => device.clone(),
            _ => return,
        };
        info!("Session fully configured for device {}", device.id);
        self.state_tx
            .send_replace(ConnectionState::ServiceConnected(device));
    }

    /// Load the device the user last connected to, if any
    pub async fn last_device(&self) -> MeshResult<Option<DeviceInfo>> {
        self.device_store.load_last_device().await
    }
}
