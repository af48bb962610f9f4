// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! [`MemoryBroker`] implements the transport traits without a network. It
//! keeps exchanges, bindings and queues in memory and behaves like a broker
//! where it matters to the client:
//!
//! - topic exchanges route with [`RouteMatcher`], direct exchanges by exact
//!   key, fanout exchanges to every bound queue, and the empty exchange by
//!   queue name;
//! - consumers on the same queue receive deliveries round-robin;
//! - unacknowledged deliveries go back to the head of their queue when the
//!   channel that received them closes;
//! - a passive check or publish against a missing resource fails with
//!   [`TransportError::NotFound`] and closes the channel;
//! - re-declaring a queue with other options, or an exchange with another
//!   kind, fails with [`TransportError::PreconditionFailed`] and closes the
//!   channel.
//!
//! [`MemoryBroker::drop_connections`] simulates the broker going away.

use crate::{
    errors::TransportError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
    routing::RouteMatcher,
    transport::{
        CloseCallback, ConnectionOptions, Connector, Consumer, DeliveryFields, Message,
        MessageProperties, QueueInfo, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

type Result<T> = std::result::Result<T, TransportError>;
type DeliverySender = mpsc::UnboundedSender<Result<Message>>;

const DROPPED_REASON: &str = "connection dropped by broker";

struct ExchangeState {
    kind: ExchangeKind,
    /// `(queue, pattern)` pairs.
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            queue: name.to_owned(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers.len() as u32,
        }
    }
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: DeliverySender,
}

#[derive(Default)]
struct ConnectionState {
    channels: Vec<u64>,
    on_close: Vec<CloseCallback>,
}

#[derive(Default)]
struct ChannelState {
    next_tag: u64,
    /// delivery tag -> (queue, message)
    unacked: HashMap<u64, (String, Message)>,
    on_close: Vec<CloseCallback>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| TransportError::NotFound(format!("queue '{name}'")))
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState> {
        self.channels.get_mut(&id).ok_or(TransportError::Closed)
    }

    fn route(&self, matcher: &RouteMatcher, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound(format!("exchange '{exchange}'")))?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, pattern) in &state.bindings {
            let hit = match state.kind {
                ExchangeKind::Topic => matcher.matches(pattern, routing_key),
                ExchangeKind::Direct | ExchangeKind::XMessageDelayed => pattern == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    /// Hands ready messages of `queue` to its consumers until one side runs out.
    fn deliver(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.consumers.is_empty() || state.ready.is_empty() {
                return;
            }

            let index = state.cursor % state.consumers.len();
            state.cursor = state.cursor.wrapping_add(1);
            let Some(mut message) = state.ready.pop_front() else {
                return;
            };

            let slot = &state.consumers[index];
            let tag = slot.tag.clone();
            let no_ack = slot.no_ack;
            let channel_id = slot.channel;
            let sender = slot.sender.clone();

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                state.consumers.remove(index);
                state.ready.push_front(message);
                continue;
            };

            channel.next_tag += 1;
            let delivery_tag = channel.next_tag;
            message.fields.delivery_tag = delivery_tag;
            message.fields.consumer_tag = Some(tag.clone());
            if !no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue.to_owned(), message.clone()));
            }

            if sender.send(Ok(message.clone())).is_err() {
                debug!(queue, consumer_tag = tag, "consumer went away, returning message");
                channel.unacked.remove(&delivery_tag);
                state.consumers.retain(|c| c.tag != tag);
                state.ready.push_front(message);
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut message: Message) {
        if let Some(state) = self.queues.get_mut(queue) {
            message.fields.redelivered = true;
            state.ready.push_front(message);
        }
    }

    /// Closes a channel, returning its unacked messages to their queues.
    fn close_channel(&mut self, id: u64) -> Vec<CloseCallback> {
        let Some(mut channel) = self.channels.remove(&id) else {
            return Vec::new();
        };

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != id);
        }

        let mut pending: Vec<_> = channel.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);

        let mut touched: Vec<String> = Vec::new();
        for (_, (queue, message)) in pending.into_iter().rev() {
            self.requeue(&queue, message);
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        for queue in touched {
            self.deliver(&queue);
        }

        std::mem::take(&mut channel.on_close)
    }

    fn close_connection(&mut self, id: u64) -> Vec<CloseCallback> {
        let Some(mut connection) = self.connections.remove(&id) else {
            return Vec::new();
        };

        let mut callbacks = Vec::new();
        for channel in std::mem::take(&mut connection.channels) {
            callbacks.extend(self.close_channel(channel));
        }
        callbacks.extend(connection.on_close);
        callbacks
    }
}

fn fire(callbacks: Vec<CloseCallback>, reason: Option<String>) {
    for callback in callbacks {
        callback(reason.clone());
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    matcher: RouteMatcher,
    connects: AtomicUsize,
    refusals: AtomicUsize,
}

/// An in-memory broker; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a connection without going through [`Connector::connect`].
    pub fn open_connection(&self) -> Arc<dyn TransportConnection> {
        let id = {
            let mut state = self.state();
            let id = state.next_id();
            state.connections.insert(id, ConnectionState::default());
            id
        };
        Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }

    /// Successful connects served through [`Connector::connect`].
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Makes the next `count` connect attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.shared.refusals.store(count, Ordering::SeqCst);
    }

    /// Closes every open connection as if the broker had gone away.
    pub fn drop_connections(&self) {
        let callbacks = {
            let mut state = self.state();
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            ids.into_iter()
                .flat_map(|id| state.close_connection(id))
                .collect::<Vec<_>>()
        };
        warn!("memory broker dropping all connections");
        fire(callbacks, Some(DROPPED_REASON.to_owned()));
    }

    pub fn open_connections(&self) -> usize {
        self.state().connections.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.state().exchanges.contains_key(name)
    }

    /// Ready (undelivered) messages of `queue`, `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.consumers.len())
    }

    /// Deliveries awaiting an ack across every channel.
    pub fn unacked_count(&self) -> usize {
        self.state().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Snapshot of the ready messages of `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn TransportConnection>> {
        let refused = self
            .shared
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            warn!(connection = options.connection_name, "memory broker refused connection");
            return Err(TransportError::Connect("connection refused".to_owned()));
        }

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        debug!(connection = options.connection_name, "memory broker accepted connection");
        Ok(self.open_connection())
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let mut state = self.broker.state();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }

        let channel = state.next_id();
        state.channels.insert(channel, ChannelState::default());
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(channel);
        }

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id: channel,
        }))
    }

    fn is_open(&self) -> bool {
        self.broker.state().connections.contains_key(&self.id)
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut state = self.broker.state();
        match state.connections.get_mut(&self.id) {
            Some(connection) => connection.on_close.push(callback),
            None => {
                drop(state);
                callback(None);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let callbacks = self.broker.state().close_connection(self.id);
        fire(callbacks, None);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    /// Runs `op` against the broker state on behalf of this channel.
    ///
    /// A not-found failure closes the channel, as a broker does.
    fn with_state<T>(&self, op: impl FnOnce(&mut BrokerState, &RouteMatcher) -> Result<T>) -> Result<T> {
        let (result, callbacks) = {
            let mut state = self.broker.state();
            if !state.channels.contains_key(&self.id) {
                return Err(TransportError::Closed);
            }

            let result = op(&mut state, &self.broker.shared.matcher);
            let callbacks = match &result {
                Err(TransportError::NotFound(_) | TransportError::PreconditionFailed(_)) => {
                    state.close_channel(self.id)
                }
                _ => Vec::new(),
            };
            (result, callbacks)
        };

        if let Err(err) = &result {
            fire(callbacks, Some(err.to_string()));
        }
        result
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn prefetch(&self, _count: u16) -> Result<()> {
        self.with_state(|_, _| Ok(()))
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<()> {
        self.with_state(|state, _| match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::PreconditionFailed(format!(
                "exchange '{name}' already declared as {:?}",
                existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_owned(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn check_exchange(&self, name: &str) -> Result<()> {
        self.with_state(|state, _| {
            if state.exchanges.contains_key(name) {
                Ok(())
            } else {
                Err(TransportError::NotFound(format!("exchange '{name}'")))
            }
        })
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.with_state(|state, _| {
            state.exchanges.remove(name);
            Ok(())
        })
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        self.with_state(|state, _| {
            if let Some(existing) = state.queues.get(name) {
                if existing.options != *options {
                    return Err(TransportError::PreconditionFailed(format!(
                        "queue '{name}' already declared with {:?}",
                        existing.options
                    )));
                }
                return Ok(existing.info(name));
            }

            let queue = QueueState {
                options: options.clone(),
                ..Default::default()
            };
            let info = queue.info(name);
            state.queues.insert(name.to_owned(), queue);
            Ok(info)
        })
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo> {
        self.with_state(|state, _| Ok(state.queue(name)?.info(name)))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        self.with_state(|state, _| {
            let removed = state.queues.remove(name);
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
            Ok(removed.map_or(0, |q| q.ready.len() as u32))
        })
    }

    async fn purge_queue(&self, name: &str) -> Result<u32> {
        self.with_state(|state, _| {
            let queue = state.queue(name)?;
            let purged = queue.ready.len() as u32;
            queue.ready.clear();
            Ok(purged)
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.with_state(|state, _| {
            state.queue(queue)?;
            let target = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| TransportError::NotFound(format!("exchange '{exchange}'")))?;

            let binding = (queue.to_owned(), pattern.to_owned());
            if !target.bindings.contains(&binding) {
                target.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.with_state(|state, _| {
            if let Some(target) = state.exchanges.get_mut(exchange) {
                target
                    .bindings
                    .retain(|(q, p)| !(q == queue && p == pattern));
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.with_state(|state, matcher| {
            let targets = state.route(matcher, exchange, routing_key)?;
            if targets.is_empty() {
                debug!(exchange, routing_key, "unroutable message dropped");
            }

            for queue in targets {
                let message = Message {
                    content: content.to_vec(),
                    properties: properties.clone(),
                    fields: DeliveryFields {
                        exchange: exchange.to_owned(),
                        routing_key: routing_key.to_owned(),
                        ..Default::default()
                    },
                };
                if let Some(target) = state.queues.get_mut(&queue) {
                    target.ready.push_back(message);
                }
                state.deliver(&queue);
            }
            Ok(())
        })
    }

    async fn get(&self, queue: &str) -> Result<Option<Message>> {
        let id = self.id;
        self.with_state(|state, _| {
            let Some(mut message) = state.queue(queue)?.ready.pop_front() else {
                return Ok(None);
            };

            let channel = state.channel(id)?;
            channel.next_tag += 1;
            message.fields.delivery_tag = channel.next_tag;
            message.fields.consumer_tag = None;
            channel
                .unacked
                .insert(channel.next_tag, (queue.to_owned(), message.clone()));
            Ok(Some(message))
        })
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer> {
        let id = self.id;
        let tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        let (sender, receiver) = mpsc::unbounded_channel();

        self.with_state(|state, _| {
            state.queue(queue)?.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                channel: id,
                no_ack,
                sender,
            });
            state.deliver(queue);
            Ok(())
        })?;

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_state(|state, _| {
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|c| c.tag != consumer_tag);
            }
            Ok(())
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let id = self.id;
        self.with_state(|state, _| {
            state
                .channel(id)?
                .unacked
                .remove(&delivery_tag)
                .map(|_| ())
                .ok_or_else(|| TransportError::Protocol(format!("unknown delivery tag {delivery_tag}")))
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let id = self.id;
        self.with_state(|state, _| {
            let (queue, message) = state
                .channel(id)?
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| TransportError::Protocol(format!("unknown delivery tag {delivery_tag}")))?;

            if requeue {
                state.requeue(&queue, message);
                state.deliver(&queue);
            }
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.broker.state().channels.contains_key(&self.id)
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut state = self.broker.state();
        match state.channels.get_mut(&self.id) {
            Some(channel) => channel.on_close.push(callback),
            None => {
                drop(state);
                callback(None);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let callbacks = self.broker.state().close_channel(self.id);
        fire(callbacks, None);
        Ok(())
    }
}
