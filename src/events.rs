// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Notifications
//!
//! Each component publishes its lifecycle notifications on its own tokio
//! broadcast channel. Emission never waits for observers and never fails
//! when nobody listens.

use tokio::sync::broadcast;
use tracing::trace;

/// Channel capacity for broadcast; slow observers lag rather than block.
const CHANNEL_CAPACITY: usize = 1024;

/// Fire-and-continue broadcaster for one notification category.
#[derive(Debug, Clone)]
pub struct Emitter<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> Default for Emitter<T> {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Emitter { sender }
    }
}

impl<T: Clone> Emitter<T> {
    pub fn emit(&self, event: T) {
        if self.sender.send(event).is_err() {
            trace!("notification dropped, no observers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}

/// Stage reported by a connection or channel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

/// Connection or channel lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Name of the context the notification is about.
    pub name: String,
    pub stage: Lifecycle,
    pub reason: Option<String>,
}

impl LifecycleEvent {
    pub fn new(name: &str, stage: Lifecycle) -> Self {
        LifecycleEvent {
            name: name.to_owned(),
            stage,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

/// Orchestrator level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Published { route_key: String, transaction_id: String },
    Sent { queue: String, transaction_id: String },
    Subscribed { queue: String },
    Unsubscribed { queue: String },
    Recovering { queue: String },
    Recovered { queue: String },
    RecoveryFailed { queue: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_to_every_observer() {
        let emitter = Emitter::<BusEvent>::default();
        emitter.emit(BusEvent::Subscribed { queue: "dropped".into() });

        let mut first = emitter.subscribe();
        let mut second = emitter.subscribe();
        emitter.emit(BusEvent::Recovered { queue: "q".into() });

        assert_eq!(first.recv().await.unwrap(), BusEvent::Recovered { queue: "q".into() });
        assert_eq!(second.recv().await.unwrap(), BusEvent::Recovered { queue: "q".into() });
    }
}
