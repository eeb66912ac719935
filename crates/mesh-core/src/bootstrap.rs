//! Ordered post-connect configuration bootstrap

use crate::codec::ConfigSection;
use crate::error::MeshError;
use crate::types::{ConfigDownloadStep, StepCounters};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drives the strict step order of the config download after a connect
///
/// Steps advance forward-only as fragments stream in; a step that sees no
/// advancing packet within the timeout fails to `Error`, which is terminal
/// until a fresh connect calls [`ConfigBootstrapSequencer::start`] again.
/// Every mutation is gated on the connection generation so fragments or
/// timers from a dead connection cannot touch the current one. A disconnect
/// resets the sequencer to `NotStarted`; partial progress is never resumed
/// because radio-side fragment state does not survive a link drop.
#[derive(Clone)]
pub struct ConfigBootstrapSequencer {
    inner: Arc<Inner>,
}

struct Inner {
    step_tx: watch::Sender<ConfigDownloadStep>,
    counters_tx: watch::Sender<StepCounters>,
    step_timeout: Duration,
    /// Generation this sequencer currently serves; 0 means inactive
    active_generation: AtomicU64,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
}

impl ConfigBootstrapSequencer {
    pub fn new(step_timeout: Duration) -> Self {
        let (step_tx, _) = watch::channel(ConfigDownloadStep::NotStarted);
        let (counters_tx, _) = watch::channel(StepCounters::default());
        Self {
            inner: Arc::new(Inner {
                step_tx,
                counters_tx,
                step_timeout,
                active_generation: AtomicU64::new(0),
                watchdog: StdMutex::new(None),
            }),
        }
    }

    /// Subscribe to bootstrap step changes
    pub fn step(&self) -> watch::Receiver<ConfigDownloadStep> {
        self.inner.step_tx.subscribe()
    }

    /// Subscribe to per-step received-item counters
    pub fn counters(&self) -> watch::Receiver<StepCounters> {
        self.inner.counters_tx.subscribe()
    }

    pub fn current_step(&self) -> ConfigDownloadStep {
        self.inner.step_tx.borrow().clone()
    }

    /// Begin a fresh bootstrap for connection attempt `generation`
    ///
    /// Always restarts at `SendingHandshake`; any previous progress is
    /// discarded.
    pub fn start(&self, generation: u64) {
        info!("Starting config bootstrap for generation {}", generation);
        self.inner
            .active_generation
            .store(generation, Ordering::SeqCst);
        self.inner.counters_tx.send_replace(StepCounters::default());
        self.inner
            .step_tx
            .send_replace(ConfigDownloadStep::SendingHandshake);
        self.arm_watchdog(generation);
    }

    /// Record that the handshake frame went out on the wire
    pub fn handshake_sent(&self, generation: u64) {
        if !self.is_active(generation) {
            return;
        }
        self.advance(generation, ConfigDownloadStep::WaitingForConfig);
    }

    /// Feed one inbound config fragment; returns true when the bootstrap completed
    pub fn on_config_fragment(
        &self,
        generation: u64,
        section: ConfigSection,
        complete: bool,
    ) -> bool {
        if !self.is_active(generation) {
            debug!(
                "Dropping config fragment from stale generation {} (section {:?})",
                generation, section
            );
            return false;
        }

        let current = self.current_step();
        if current.is_terminal() {
            debug!("Dropping config fragment after terminal step (section {:?})", section);
            return false;
        }

        let target = step_for_section(section);
        if target.rank() > current.rank() {
            self.advance(generation, target);
        } else if target.rank() < current.rank() {
            // Leftover fragment from a section we already moved past.
            debug!(
                "Out-of-order fragment for section {:?} while at {}",
                section,
                current.label()
            );
        }

        self.inner.counters_tx.send_modify(|counters| {
            let slot = match section {
                ConfigSection::Device => &mut counters.config,
                ConfigSection::Module => &mut counters.module_config,
                ConfigSection::Channel => &mut counters.channel,
                ConfigSection::NodeInfo => &mut counters.node_info,
                ConfigSection::MyInfo => &mut counters.my_info,
            };
            *slot += 1;
        });

        if section == ConfigSection::MyInfo && complete {
            info!("Config bootstrap complete for generation {}", generation);
            self.disarm_watchdog();
            self.inner.step_tx.send_replace(ConfigDownloadStep::Complete);
            return true;
        }

        // Every counted fragment is an advancing packet: a section that keeps
        // streaming must never time out mid-stream.
        self.arm_watchdog(generation);
        false
    }

    /// Fail the bootstrap for `generation` with a human-readable cause
    pub fn fail(&self, generation: u64, message: impl Into<String>) {
        if !self.is_active(generation) {
            return;
        }
        let message = message.into();
        if self.current_step().is_terminal() {
            return;
        }
        warn!("Config bootstrap failed: {}", message);
        self.disarm_watchdog();
        self.inner
            .step_tx
            .send_replace(ConfigDownloadStep::Error(message));
    }

    /// Reset to `NotStarted`, suppressing all further updates for old generations
    pub fn reset(&self) {
        debug!("Resetting config bootstrap");
        self.inner.active_generation.store(0, Ordering::SeqCst);
        self.disarm_watchdog();
        self.inner.step_tx.send_replace(ConfigDownloadStep::NotStarted);
        self.inner.counters_tx.send_replace(StepCounters::default());
    }

    fn is_active(&self, generation: u64) -> bool {
        generation != 0 && self.inner.active_generation.load(Ordering::SeqCst) == generation
    }

    fn advance(&self, generation: u64, target: ConfigDownloadStep) {
        let current = self.current_step();
        if target.rank() <= current.rank() {
            return;
        }
        debug!("Bootstrap step {} -> {}", current.label(), target.label());
        self.inner.step_tx.send_replace(target);
        self.arm_watchdog(generation);
    }

    fn arm_watchdog(&self, generation: u64) {
        self.disarm_watchdog();

        let inner = Arc::clone(&self.inner);
        let armed_rank = self.current_step().rank();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.step_timeout).await;

            if inner.active_generation.load(Ordering::SeqCst) != generation {
                debug!("Watchdog fired for stale generation {}, ignoring", generation);
                return;
            }
            let current = inner.step_tx.borrow().clone();
            if current.is_terminal() || current.rank() != armed_rank {
                return;
            }
            warn!("Bootstrap step {} timed out", current.label());
            let cause = MeshError::BootstrapTimeout(format!(
                "no advancing packet during {} within {:?}",
                current.label(),
                inner.step_timeout
            ));
            inner
                .step_tx
                .send_replace(ConfigDownloadStep::Error(cause.user_message()));
        });

        *self.inner.watchdog.lock().unwrap() = Some(handle);
    }

    fn disarm_watchdog(&self) {
        if let Some(handle) = self.inner.watchdog.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn step_for_section(section: ConfigSection) -> ConfigDownloadStep {
    match section {
        ConfigSection::Device => ConfigDownloadStep::DownloadingConfig,
        ConfigSection::Module => ConfigDownloadStep::DownloadingModuleConfig,
        ConfigSection::Channel => ConfigDownloadStep::DownloadingChannel,
        ConfigSection::NodeInfo => ConfigDownloadStep::DownloadingNodeInfo,
        ConfigSection::MyInfo => ConfigDownloadStep::DownloadingMyInfo,
    }
}
