use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Tunables for a mesh protocol session
#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    pub bootstrap: BootstrapConfig,
    pub connection: ConnectionConfig,
    pub scan: ScanConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Seconds a bootstrap step may go without an advancing packet
    pub step_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Seconds a connect attempt may spend bringing the link up
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Seconds a device scan stays open before finishing on its own
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    /// Fixed capacity of the packet summary ring
    pub packet_ring_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapConfig { step_timeout_secs: 30 },
            connection: ConnectionConfig { connect_timeout_secs: 30 },
            scan: ScanConfig { window_secs: 15 },
            diagnostics: DiagnosticsConfig { packet_ring_capacity: 100 },
        }
    }
}

impl MeshConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64("MESH_STEP_TIMEOUT_SECS") {
            config.bootstrap.step_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("MESH_CONNECT_TIMEOUT_SECS") {
            config.connection.connect_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("MESH_SCAN_WINDOW_SECS") {
            config.scan.window_secs = secs;
        }
        if let Some(capacity) = env_u64("MESH_PACKET_RING_CAPACITY") {
            config.diagnostics.packet_ring_capacity = capacity as usize;
        }

        config
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap.step_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan.window_secs)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MeshConfig::default();
        assert!(config.bootstrap.step_timeout_secs > 0);
        assert!(config.connection.connect_timeout_secs > 0);
        assert!(config.scan.window_secs > 0);
        assert!(config.diagnostics.packet_ring_capacity > 0);
    }
}
