//! The output channel abstraction.

use std::fmt;

use async_trait::async_trait;
use gpuwatch_types::GpuWatchError;
use uuid::Uuid;

/// Identity issued to a subscriber when it joins the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A client connection that can receive text payloads.
///
/// # Contract
///
/// * `accept` – completes the connection handshake.  Called exactly once,
///   before the subscriber is registered; a failure means it is never added.
/// * `send_text` – delivers one payload.  Any error marks the subscriber as
///   gone and it is pruned.
/// * `close` – best-effort teardown.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn accept(&self) -> Result<(), GpuWatchError>;

    async fn send_text(&self, payload: &str) -> Result<(), GpuWatchError>;

    async fn close(&self) {}
}
