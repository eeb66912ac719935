//! Error types for the mesh protocol layer

use crate::types::ChannelId;
use thiserror::Error;

/// Result type for mesh protocol operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur in the mesh protocol layer
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Not ready for a new connection: {0}")]
    NotReady(String),

    #[error("Config bootstrap timed out: {0}")]
    BootstrapTimeout(String),

    #[error("Payload of {actual} bytes exceeds transport maximum of {max} bytes")]
    OversizedPayload { actual: usize, max: usize },

    #[error("Unknown or malformed packet: {0}")]
    UnknownPacket(String),

    #[error("Invalid channel operation: {0}")]
    InvalidChannelOperation(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Direct-message channel not PKI-ready: {0}")]
    PkiNotReady(String),

    #[error("Companion app not installed: {0}")]
    NotInstalled(String),

    #[error("Companion service not running: {0}")]
    ServiceNotRunning(String),

    #[error("Protocol version mismatch: device speaks v{device}, supported v{supported}")]
    VersionMismatch { device: u8, supported: u8 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl MeshError {
    /// Get user-friendly error message with a targeted remedy
    pub fn user_message(&self) -> String {
        match self {
            MeshError::Transport(details) => {
                format!("Lost contact with the radio: {}. Check the link and reconnect.", details)
            }
            MeshError::NotReady(details) => {
                format!("A connection attempt is already in progress: {}. Wait for it to finish or reset first.", details)
            }
            MeshError::BootstrapTimeout(step) => {
                format!("The radio stopped responding during setup ({}). Reconnect to start over.", step)
            }
            MeshError::OversizedPayload { actual, max } => {
                format!("This item is {} bytes but the transport only carries {} bytes. Simplify it and try again.", actual, max)
            }
            MeshError::UnknownPacket(details) => {
                format!("Received a packet this version does not understand: {}.", details)
            }
            MeshError::InvalidChannelOperation(details) => {
                format!("That channel operation is not allowed: {}.", details)
            }
            MeshError::ChannelNotFound(id) => {
                format!("Channel '{}' no longer exists.", id)
            }
            MeshError::PeerNotFound(peer) => {
                format!("Peer '{}' could not be found. They may have left the mesh.", peer)
            }
            MeshError::PkiNotReady(peer) => {
                format!("No public key known for '{}' yet. Wait for their node info before sending a direct message.", peer)
            }
            MeshError::NotInstalled(details) => {
                format!("The companion app is not installed: {}. Install it to use this transport.", details)
            }
            MeshError::ServiceNotRunning(details) => {
                format!("The companion service is not running: {}. Start the app and try again.", details)
            }
            MeshError::VersionMismatch { device, supported } => {
                format!("The device firmware speaks protocol v{} but this build supports v{}. Update one side.", device, supported)
            }
            MeshError::Serialization(details) => {
                format!("Data processing error: {}.", details)
            }
            MeshError::Other(err) => {
                format!("Unexpected error: {}.", err)
            }
        }
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            MeshError::Transport(_) => ErrorCategory::Transport,
            MeshError::NotReady(_) => ErrorCategory::Transport,
            MeshError::BootstrapTimeout(_) => ErrorCategory::Bootstrap,
            MeshError::OversizedPayload { .. } => ErrorCategory::Payload,
            MeshError::UnknownPacket(_) => ErrorCategory::Packet,
            MeshError::InvalidChannelOperation(_) => ErrorCategory::Validation,
            MeshError::ChannelNotFound(_) => ErrorCategory::Validation,
            MeshError::PeerNotFound(_) => ErrorCategory::Validation,
            MeshError::PkiNotReady(_) => ErrorCategory::Validation,
            MeshError::NotInstalled(_) => ErrorCategory::Transport,
            MeshError::ServiceNotRunning(_) => ErrorCategory::Transport,
            MeshError::VersionMismatch { .. } => ErrorCategory::Transport,
            MeshError::Serialization(_) => ErrorCategory::Internal,
            MeshError::Other(_) => ErrorCategory::Internal,
        }
    }
}

/// Error categories for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Bootstrap,
    Payload,
    Packet,
    Validation,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Bootstrap => write!(f, "bootstrap"),
            ErrorCategory::Payload => write!(f, "payload"),
            ErrorCategory::Packet => write!(f, "packet"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_name_the_remedy() {
        let not_installed = MeshError::NotInstalled("no socket at /run/companion.sock".into());
        assert!(not_installed.user_message().contains("Install"));

        let not_running = MeshError::ServiceNotRunning("connection refused".into());
        assert!(not_running.user_message().contains("Start the app"));

        let mismatch = MeshError::VersionMismatch { device: 2, supported: 1 };
        assert!(mismatch.user_message().contains("v2"));
        assert!(mismatch.user_message().contains("v1"));
    }

    #[test]
    fn oversized_payload_reports_both_sizes() {
        let err = MeshError::OversizedPayload { actual: 900, max: 512 };
        let message = err.to_string();
        assert!(message.contains("900"));
        assert!(message.contains("512"));
        assert_eq!(err.category(), ErrorCategory::Payload);
    }
}
