//! [`SubscriberRegistry`] – the set of active subscribers.
//!
//! A plain keyed collection with no locking of its own: the
//! [`BroadcastGate`](crate::gate::BroadcastGate) owns it behind the same
//! mutex that guards the broadcast state, so every membership change and
//! every fan-out sees a consistent view.

use std::collections::HashMap;
use std::sync::Arc;

use crate::subscriber::{Subscriber, SubscriberId};

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: HashMap<SubscriberId, Arc<dyn Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `subscriber` under a freshly issued id.
    pub fn insert(&mut self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId::new();
        self.subscribers.insert(id, subscriber);
        id
    }

    /// Remove `id`.  Returns `false` if it was not present; that is not an
    /// error.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Remove every id in `ids`, returning how many were present.
    pub fn prune(&mut self, ids: &[SubscriberId]) -> usize {
        ids.iter().filter(|id| self.remove(**id)).count()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Iterate members in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (SubscriberId, &Arc<dyn Subscriber>)> {
        self.subscribers.iter().map(|(id, sub)| (*id, sub))
    }
}
