//! [`BroadcastGate`] – rate-limited, de-duplicated fan-out.
//!
//! All subscribers share one logical channel.  Every published payload is
//! serialized once, compared with the last payload actually sent, held back
//! until the minimum inter-send interval has elapsed, and then written to
//! every registered subscriber.  Subscribers whose send fails are pruned
//! after the traversal.
//!
//! # Locking
//!
//! The registry and the [`BroadcastState`] live behind one
//! [`tokio::sync::Mutex`].  `publish` takes it briefly to inspect state, drops
//! it for the rate-limit wait, and re-takes it for the send-and-prune phase.
//!
//! Concurrent `publish` calls queue on a second, fair mutex held for the whole
//! call, so they go out one at a time in arrival order.  Membership changes
//! only need the first lock and are never held up by a rate-limit wait.

use std::sync::Arc;
use std::time::Duration;

use gpuwatch_types::{GpuWatchError, Notice};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::registry::SubscriberRegistry;
use crate::subscriber::{Subscriber, SubscriberId};

/// Upper bound on the broadcast rate.
pub const MAX_BROADCAST_HZ: u32 = 30;

/// What a call to [`BroadcastGate::publish`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nobody is connected; nothing was serialized or recorded.
    NoSubscribers,
    /// Byte-identical to the last payload sent; nothing was sent.
    Duplicate,
    /// The payload went out.
    Sent { delivered: usize, pruned: usize },
}

/// Last payload sent and when, shared by every subscriber.
#[derive(Debug, Default)]
struct BroadcastState {
    last_payload: Option<String>,
    last_sent_at: Option<Instant>,
}

impl BroadcastState {
    fn is_duplicate(&self, message: &str) -> bool {
        self.last_payload.as_deref() == Some(message)
    }

    /// How long to hold a payload back at `now`, if at all.
    fn remaining_wait(&self, min_interval: Duration, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_sent_at?);
        min_interval.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

#[derive(Default)]
struct Shared {
    registry: SubscriberRegistry,
    state: BroadcastState,
}

/// Shared fan-out point for every connected subscriber.
pub struct BroadcastGate {
    shared: Mutex<Shared>,
    publish_queue: Mutex<()>,
    min_interval: Duration,
}

impl BroadcastGate {
    /// Create a gate sending at most `max_broadcast_hz` payloads per second.
    ///
    /// The rate is clamped to `1..=`[`MAX_BROADCAST_HZ`].
    pub fn new(max_broadcast_hz: u32) -> Self {
        let hz = max_broadcast_hz.clamp(1, MAX_BROADCAST_HZ);
        Self {
            shared: Mutex::new(Shared::default()),
            publish_queue: Mutex::new(()),
            min_interval: Duration::from_secs_f64(1.0 / f64::from(hz)),
        }
    }

    /// Minimum time between two sends.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Complete `subscriber`'s handshake and register it.
    ///
    /// # Errors
    ///
    /// Propagates the handshake failure; the subscriber is not registered.
    pub async fn add(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriberId, GpuWatchError> {
        subscriber.accept().await?;
        let mut shared = self.shared.lock().await;
        let id = shared.registry.insert(subscriber);
        info!(subscriber = %id, active = shared.registry.len(), "subscriber connected");
        Ok(id)
    }

    /// Unregister `id`.  Removing an absent subscriber is a no-op.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut shared = self.shared.lock().await;
        let removed = shared.registry.remove(id);
        if removed {
            info!(subscriber = %id, active = shared.registry.len(), "subscriber disconnected");
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.shared.lock().await.registry.len()
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.shared.lock().await.registry.contains(id)
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish `payload` to every subscriber.
    ///
    /// A payload whose JSON is byte-identical to the last one sent is dropped.
    /// A unique payload arriving sooner than [`min_interval`] after the last
    /// send is delayed, never discarded.  With no subscribers the call returns
    /// immediately and leaves the broadcast state untouched.
    ///
    /// [`min_interval`]: Self::min_interval
    ///
    /// # Errors
    ///
    /// Returns [`GpuWatchError::Serialization`] if `payload` cannot be encoded.
    pub async fn publish<T>(&self, payload: &T) -> Result<PublishOutcome, GpuWatchError>
    where
        T: Serialize + ?Sized,
    {
        let _turn = self.publish_queue.lock().await;
        if self.shared.lock().await.registry.is_empty() {
            return Ok(PublishOutcome::NoSubscribers);
        }

        let message = serde_json::to_string(payload)?;

        let wait = {
            let shared = self.shared.lock().await;
            if shared.state.is_duplicate(&message) {
                return Ok(PublishOutcome::Duplicate);
            }
            shared.state.remaining_wait(self.min_interval, Instant::now())
        };
        if let Some(wait) = wait {
            sleep(wait).await;
        }

        let mut shared = self.shared.lock().await;
        // Everyone may have left during the wait.
        if shared.registry.is_empty() {
            return Ok(PublishOutcome::NoSubscribers);
        }
        let sent_at = Instant::now();
        let (delivered, pruned) = fan_out(&mut shared.registry, &message).await;
        shared.state.last_payload = Some(message);
        shared.state.last_sent_at = Some(sent_at);

        Ok(PublishOutcome::Sent { delivered, pruned })
    }

    /// Send an error notice to every subscriber immediately.
    ///
    /// Bypasses de-duplication and rate limiting and does not touch the
    /// broadcast state.  Failing subscribers are pruned as in [`publish`].
    ///
    /// [`publish`]: Self::publish
    pub async fn publish_error(&self, message: impl Into<String>) -> Result<PublishOutcome, GpuWatchError> {
        let notice = serde_json::to_string(&Notice::Error {
            message: message.into(),
        })?;

        let mut shared = self.shared.lock().await;
        if shared.registry.is_empty() {
            return Ok(PublishOutcome::NoSubscribers);
        }
        let (delivered, pruned) = fan_out(&mut shared.registry, &notice).await;
        Ok(PublishOutcome::Sent { delivered, pruned })
    }
}

/// Send `message` to every member, then prune those that failed.
async fn fan_out(registry: &mut SubscriberRegistry, message: &str) -> (usize, usize) {
    let mut failed = Vec::new();
    let mut delivered = 0;

    for (id, subscriber) in registry.iter() {
        match subscriber.send_text(message).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                debug!(subscriber = %id, error = %e, "send failed; dropping subscriber");
                failed.push(id);
            }
        }
    }

    let pruned = registry.prune(&failed);
    if pruned > 0 {
        info!(pruned, active = registry.len(), "pruned unreachable subscribers");
    }
    (delivered, pruned)
}
