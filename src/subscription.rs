// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Manager
//!
//! In-memory record of what *should* be consumed: queue → ordered topic
//! handlers, subscription options and, while consumption is live, the
//! consumer tag. Blocked queues are tracked independently of entries. The
//! manager never touches the transport; it is the intent the orchestrator
//! re-asserts after the transport recovers.

use crate::{consumer::Incoming, errors::Result, events::Emitter, queue::QueueOptions};
use futures_util::future::BoxFuture;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;
use tracing::debug;

/// Callback invoked for every delivery whose route key matches its pattern.
pub type Handler = Arc<dyn Fn(Incoming) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Boxes an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |incoming| Box::pin(f(incoming)))
}

/// Topic patterns and their handlers, kept in registration order.
#[derive(Clone, Default)]
pub struct Handlers {
    entries: Vec<(String, Handler)>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `pattern`, replacing an earlier registration in place.
    pub fn on(mut self, pattern: &str, handler: Handler) -> Self {
        match self.entries.iter_mut().find(|(p, _)| p == pattern) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((pattern.to_owned(), handler)),
        }
        self
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Handler)> {
        self.entries.iter().map(|(p, h)| (p.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.patterns()).finish()
    }
}

/// Per-subscription overrides of the client configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Deliver metadata (headers and delivery fields) to handlers.
    pub meta: bool,
    pub validate_publisher: Option<bool>,
    pub validate_version: Option<bool>,
    pub max_retry_count: Option<u32>,
    /// Dead letter queue for this subscription's rejections.
    pub error_queue: Option<String>,
    /// Options used to assert the consumed queue.
    pub queue: Option<QueueOptions>,
    /// Skip binding the handler patterns to the global exchange.
    pub disable_queue_bind: bool,
}

/// Snapshot of a registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub queue: String,
    pub handlers: Handlers,
    pub options: SubscribeOptions,
    pub consumer_tag: Option<String>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.consumer_tag.is_some()
    }
}

/// Subscription lifecycle notifications.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Created(Subscription),
    Tagged(Subscription),
    Cleared(Subscription),
    Removed(Subscription),
    Blocked(String),
    Unblocked(String),
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<String, Subscription>,
    blocked: HashSet<String>,
}

/// Registry of desired subscriptions and blocked queues.
#[derive(Default)]
pub struct SubscriptionManager {
    state: Mutex<State>,
    events: Emitter<SubscriptionEvent>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    /// Whether `queue` has an entry; with `require_tag`, only an actively consuming one counts.
    pub fn contains(&self, queue: &str, require_tag: bool) -> bool {
        self.state()
            .subscriptions
            .get(queue)
            .is_some_and(|s| !require_tag || s.is_active())
    }

    /// Registers the desired subscription without starting consumption.
    ///
    /// Fails (returns false) only while an active subscription holds the queue;
    /// an inactive entry is replaced.
    pub fn create(&self, queue: &str, handlers: Handlers, options: SubscribeOptions) -> bool {
        let snapshot = {
            let mut state = self.state();
            if state.subscriptions.get(queue).is_some_and(Subscription::is_active) {
                return false;
            }

            let subscription = Subscription {
                queue: queue.to_owned(),
                handlers,
                options,
                consumer_tag: None,
            };
            state
                .subscriptions
                .insert(queue.to_owned(), subscription.clone());
            subscription
        };

        debug!(queue, "subscription created");
        self.events.emit(SubscriptionEvent::Created(snapshot));
        true
    }

    /// Records the consumer tag of a live consumer; false if nothing is registered.
    pub fn tag(&self, queue: &str, consumer_tag: &str) -> bool {
        let snapshot = {
            let mut state = self.state();
            let Some(subscription) = state.subscriptions.get_mut(queue) else {
                return false;
            };
            subscription.consumer_tag = Some(consumer_tag.to_owned());
            subscription.clone()
        };

        debug!(queue, consumer_tag, "subscription tagged");
        self.events.emit(SubscriptionEvent::Tagged(snapshot));
        true
    }

    pub fn get(&self, queue: &str) -> Option<Subscription> {
        self.state().subscriptions.get(queue).cloned()
    }

    /// Drops the consumer tag and keeps the entry.
    pub fn clear(&self, queue: &str) -> bool {
        let snapshot = {
            let mut state = self.state();
            let Some(subscription) = state.subscriptions.get_mut(queue) else {
                return false;
            };
            subscription.consumer_tag = None;
            subscription.clone()
        };

        debug!(queue, "subscription cleared");
        self.events.emit(SubscriptionEvent::Cleared(snapshot));
        true
    }

    /// Drops the consumer tag only if it still equals `consumer_tag`.
    pub fn clear_if_tagged(&self, queue: &str, consumer_tag: &str) -> bool {
        let tagged = self
            .state()
            .subscriptions
            .get(queue)
            .is_some_and(|s| s.consumer_tag.as_deref() == Some(consumer_tag));
        tagged && self.clear(queue)
    }

    /// Deletes the entry entirely.
    pub fn remove(&self, queue: &str) -> bool {
        let Some(snapshot) = self.state().subscriptions.remove(queue) else {
            return false;
        };

        debug!(queue, "subscription removed");
        self.events.emit(SubscriptionEvent::Removed(snapshot));
        true
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.state().subscriptions.values().cloned().collect()
    }

    pub fn block(&self, queue: &str) {
        if self.state().blocked.insert(queue.to_owned()) {
            debug!(queue, "queue blocked");
            self.events.emit(SubscriptionEvent::Blocked(queue.to_owned()));
        }
    }

    pub fn unblock(&self, queue: &str) {
        if self.state().blocked.remove(queue) {
            debug!(queue, "queue unblocked");
            self.events
                .emit(SubscriptionEvent::Unblocked(queue.to_owned()));
        }
    }

    pub fn is_blocked(&self, queue: &str) -> bool {
        self.state().blocked.contains(queue)
    }
}
