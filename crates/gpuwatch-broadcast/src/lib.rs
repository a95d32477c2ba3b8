//! `gpuwatch-broadcast` – subscriber fan-out.
//!
//! Pushes serialized telemetry to every connected client as one shared
//! channel, without caring what the clients are.
//!
//! # Modules
//!
//! - [`subscriber`] – the [`Subscriber`] trait an output channel implements.
//! - [`registry`] – the set of active subscribers.
//! - [`gate`] – [`BroadcastGate`]: de-duplication, rate limiting, and
//!   prune-on-failure fan-out behind a single lock.

pub mod gate;
pub mod registry;
pub mod subscriber;

pub use gate::{BroadcastGate, PublishOutcome, MAX_BROADCAST_HZ};
pub use registry::SubscriberRegistry;
pub use subscriber::{Subscriber, SubscriberId};
