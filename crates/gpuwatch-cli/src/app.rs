//! Process wiring: provider selection, the poll loop, the broadcast task
//! and the listener.

use std::sync::Arc;

use gpuwatch_broadcast::{BroadcastGate, PublishOutcome};
use gpuwatch_server::{GpuWatchServer, ServiceInfo};
use gpuwatch_telemetry::{Poller, ProviderSelector, SourceOptions};
use gpuwatch_types::{GpuWatchError, TelemetrySnapshot};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Run the service until `shutdown` flips.
///
/// # Errors
///
/// Fails before any client is served when no provider can be constructed,
/// the chosen source refuses to start, or the listener cannot bind.
pub async fn run(
    cfg: &Config,
    selector: &ProviderSelector,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GpuWatchError> {
    let options = SourceOptions::default().with_system_metrics(cfg.enable_system_metrics);
    let source = selector.select(cfg.preferred_provider()?, &options)?;
    let provider = source.kind();
    let addr = cfg.listen_addr().await?;

    let (poller, snapshots) = Poller::new(source, cfg.poll_interval_ms).spawn().await?;
    let gate = Arc::new(BroadcastGate::new(cfg.max_broadcast_hz));
    let broadcaster = spawn_broadcast(Arc::clone(&gate), snapshots);

    let info = ServiceInfo {
        poll_interval_ms: cfg.poll_interval_ms,
        max_broadcast_hz: cfg.max_broadcast_hz,
        provider,
        enable_system_metrics: cfg.enable_system_metrics,
    };
    let served = GpuWatchServer::new(gate, info).with_addr(addr).run(shutdown).await;

    broadcaster.abort();
    poller.shutdown().await;
    info!("gpuwatch stopped");
    served
}

/// Forward every snapshot from the poller into `gate`.
///
/// Ends when the poller's sender is dropped.
pub fn spawn_broadcast(
    gate: Arc<BroadcastGate>,
    mut snapshots: mpsc::Receiver<TelemetrySnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(snapshot) = snapshots.recv().await {
            match gate.publish(&snapshot).await {
                Ok(PublishOutcome::Sent { delivered, pruned }) => {
                    debug!(delivered, pruned, "snapshot broadcast");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to broadcast snapshot");
                    if let Err(e) = gate.publish_error(e.to_string()).await {
                        warn!(error = %e, "failed to broadcast error notice");
                    }
                }
            }
        }
        debug!("snapshot stream closed");
    })
}
