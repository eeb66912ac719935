//! Last-connected-device persistence seam
//!
//! The only thing this layer persists is the device the user last connected
//! to, so the UI can offer it for reconnection. The store is a trait so hosts
//! can plug in their own key-value backend.

use crate::error::{MeshError, MeshResult};
use crate::types::DeviceInfo;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Key-value seam for remembering the last connected device
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn load_last_device(&self) -> MeshResult<Option<DeviceInfo>>;
    async fn store_last_device(&self, device: &DeviceInfo) -> MeshResult<()>;
}

/// JSON file-backed device store
pub struct JsonDeviceStore {
    path: PathBuf,
}

impl JsonDeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn load_last_device(&self) -> MeshResult<Option<DeviceInfo>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let device: DeviceInfo = serde_json::from_slice(&bytes)?;
                debug!("Loaded last device {} from {:?}", device.id, self.path);
                Ok(Some(device))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MeshError::from(e)),
        }
    }

    async fn store_last_device(&self, device: &DeviceInfo) -> MeshResult<()> {
        let bytes = serde_json::to_vec_pretty(device)?;
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Could not create device store directory: {}", e);
            }
        }
        tokio::fs::write(&self.path, bytes).await?;
        debug!("Stored last device {} to {:?}", device.id, self.path);
        Ok(())
    }
}

/// In-memory device store for tests and transient hosts
#[derive(Default)]
pub struct MemoryDeviceStore {
    inner: RwLock<Option<DeviceInfo>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn load_last_device(&self) -> MeshResult<Option<DeviceInfo>> {
        Ok(self.inner.read().await.clone())
    }

    async fn store_last_device(&self, device: &DeviceInfo) -> MeshResult<()> {
        *self.inner.write().await = Some(device.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransportKind;
    use uuid::Uuid;

    fn sample_device() -> DeviceInfo {
        DeviceInfo {
            id: "radio-1".into(),
            name: "Field Radio".into(),
            address: "aa:bb:cc:dd:ee:ff".into(),
            transport: TransportKind::Bluetooth,
        }
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryDeviceStore::new();
        assert!(store.load_last_device().await.unwrap().is_none());

        let device = sample_device();
        store.store_last_device(&device).await.unwrap();
        assert_eq!(store.load_last_device().await.unwrap(), Some(device));
    }

    #[tokio::test]
    async fn json_store_round_trips() {
        let path = std::env::temp_dir().join(format!("mesh-device-{}.json", Uuid::new_v4()));
        let store = JsonDeviceStore::new(&path);
        assert!(store.load_last_device().await.unwrap().is_none());

        let device = sample_device();
        store.store_last_device(&device).await.unwrap();
        assert_eq!(store.load_last_device().await.unwrap(), Some(device));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
