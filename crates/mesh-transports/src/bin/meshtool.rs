use anyhow::Result;
use mesh_core::persistence::JsonDeviceStore;
use mesh_core::protocol::MeshProtocol;
use mesh_core::MeshConfig;
use mesh_transports::{bluetooth_adapter, companion_adapter, layer2_adapter};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Connects over the selected transport and follows the session to readiness.
///
/// Environment:
///   MESH_NODE_ID    - our peer id on the mesh (default "meshtool")
///   MESH_TRANSPORT  - bluetooth | companion | layer2 (default "layer2")
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mesh_core=debug,mesh_transports=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let node_id = std::env::var("MESH_NODE_ID").unwrap_or_else(|_| "meshtool".to_string());
    let transport = std::env::var("MESH_TRANSPORT").unwrap_or_else(|_| "layer2".to_string());
    let config = MeshConfig::from_env();
    let store = Arc::new(JsonDeviceStore::new("last-device.json"));

    let adapter = match transport.as_str() {
        "bluetooth" => bluetooth_adapter(node_id, store, config)?,
        "companion" => companion_adapter(node_id, None, store, config)?,
        "layer2" => layer2_adapter(node_id, None, store, config)?,
        other => anyhow::bail!("unknown transport '{}'", other),
    };
    tracing::info!("Using {} transport", adapter.transport_kind());

    let mut scan = adapter.scan_for_devices().await?;
    let device = timeout(Duration::from_secs(20), scan.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no device discovered within the scan window"))?
        .ok_or_else(|| anyhow::anyhow!("scan ended without finding a device"))?;
    tracing::info!("Connecting to {} ({})", device.name, device.address);
    adapter.stop_scan().await?;

    adapter.connect_to_device(device).await?;

    let mut step = adapter.config_download_step();
    timeout(Duration::from_secs(60), step.wait_for(|s| s.is_terminal()))
        .await
        .map_err(|_| anyhow::anyhow!("configuration download stalled"))??;
    tracing::info!("Bootstrap finished at step '{}'", step.borrow().label());

    let info = adapter.diagnostic_info().await;
    tracing::info!(
        "Session ready: {} peers, {} channels, generation {}",
        info.peer_count,
        info.channel_count,
        info.generation
    );

    tracing::info!("Running until Ctrl-C");
    tokio::signal::ctrl_c().await?;
    adapter.shutdown().await;
    Ok(())
}
