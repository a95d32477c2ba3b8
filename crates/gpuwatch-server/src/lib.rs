//! `gpuwatch-server` – HTTP + WebSocket front door.
//!
//! Boots a single TCP listener (default `0.0.0.0:5000`) that:
//!
//! 1. **Streams** telemetry: a WebSocket upgrade on `/ws/gpu` becomes a
//!    [`WsSubscriber`] registered with the shared [`BroadcastGate`].  Frames
//!    sent by the client are read only to notice when it goes away.
//!
//! 2. **Reports** the resolved service settings as JSON on `/api/health`
//!    and `/api/config`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gpuwatch_broadcast::BroadcastGate;
//! use gpuwatch_server::{GpuWatchServer, ServiceInfo};
//! use gpuwatch_types::ProviderKind;
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate = Arc::new(BroadcastGate::new(5));
//!     let info = ServiceInfo {
//!         poll_interval_ms: 1000,
//!         max_broadcast_hz: 5,
//!         provider: ProviderKind::NvidiaSmi,
//!         enable_system_metrics: true,
//!     };
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     GpuWatchServer::new(gate, info)
//!         .run(shutdown)
//!         .await
//!         .expect("server failed");
//! }
//! ```
//!
//! [`BroadcastGate`]: gpuwatch_broadcast::BroadcastGate

pub mod server;
pub mod ws;

pub use server::{DEFAULT_PORT, GpuWatchServer, ServiceInfo, WS_PATH};
pub use ws::WsSubscriber;
