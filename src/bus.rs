// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # BunnyBus Orchestrator
//!
//! [`BunnyBus`] is the entry point applications use. Every operation first
//! obtains a live channel through
//! [`auto_build_channel_context`](BunnyBus::auto_build_channel_context),
//! which transparently (re)builds the connection and the channel, then
//! performs its transport action:
//!
//! - passive checks report a missing queue or exchange as a negative result;
//! - connectivity failures surface as typed errors;
//! - envelope problems are handled per message and never reach the caller.
//!
//! Subscriptions are recorded in the [`SubscriptionManager`] before any
//! transport call. When a consumer stream ends while its subscription is
//! still tagged, the transport went away: the tag is cleared and the
//! subscription is re-driven with exponential backoff.

use crate::{
    amqp::AmqpConnector,
    channel::{
        listen_channel_name, ChannelContext, ChannelManager, ChannelOptions, DEFAULT_CHANNEL_NAME,
        MANAGEMENT_CHANNEL_NAME,
    },
    config::BunnyConfig,
    connection::{ConnectionManager, DEFAULT_CONNECTION_NAME},
    consumer::{DeliveryRoute, Forwarder, Incoming, Processor},
    dispatcher::Dispatcher,
    envelope::{
        self, resolve_route_key, timestamp, Envelope, EnvelopeDraft, EnvelopeHeaders, Payload,
        RouteKeySources,
    },
    errors::{BunnyError, Result, TransportError},
    events::{BusEvent, Emitter, LifecycleEvent},
    exchange::{ExchangeKind, ExchangeOptions},
    logger::{LogEvent, Logger, SharedLogger, TracingLogger},
    otel,
    queue::QueueOptions,
    retry::{exponential_backoff, retry},
    routing::RouteMatcher,
    subscription::{Handler, Handlers, SubscribeOptions, SubscriptionEvent, SubscriptionManager},
    transport::{Connector, Consumer, Headers, Message, QueueInfo, TransportChannel},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Options of [`BunnyBus::publish`] and [`BunnyBus::send`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Route key that wins over every other source.
    pub force_route_key: Option<String>,
    /// Route key used when neither the override nor a forwarded message provides one.
    pub route_key: Option<String>,
    /// Reuse this transaction id instead of generating one.
    pub transaction_id: Option<String>,
    /// Free-form label of the producer.
    pub source: Option<String>,
    /// Additional headers carried with the envelope.
    pub headers: Headers,
    /// Publish to this exchange instead of the configured global exchange.
    pub exchange: Option<String>,
    /// A previously received message being forwarded; its envelope identity is kept.
    pub forward: Option<Message>,
}

/// Options of [`BunnyBus::get_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAllOptions {
    /// Deliver metadata (headers and delivery fields) to the handler.
    pub meta: bool,
}

struct Inner {
    config: BunnyConfig,
    connections: ConnectionManager,
    channels: ChannelManager,
    subscriptions: SubscriptionManager,
    dispatcher: Arc<dyn Dispatcher>,
    matcher: RouteMatcher,
    default_logger: Arc<TracingLogger>,
    logger: SharedLogger,
    events: Emitter<BusEvent>,
    /// Serializes subscription state changes that touch the transport.
    subscribing: tokio::sync::Mutex<()>,
}

/// Resilient publish/subscribe client.
#[derive(Clone)]
pub struct BunnyBus {
    inner: Arc<Inner>,
}

impl BunnyBus {
    /// Client talking AMQP through lapin.
    pub fn new(config: BunnyConfig) -> Self {
        Self::with_connector(config, Arc::new(AmqpConnector))
    }

    /// Creates a client opening its connections through `connector`.
    ///
    /// No connection is made here; the first operation needing a channel
    /// builds one on demand.
    ///
    /// # Parameters
    /// * `config` - Connection, exchange, queue and retry settings
    /// * `connector` - Transport factory, e.g. [`AmqpConnector`] or a [`MemoryBroker`](crate::MemoryBroker)
    ///
    /// # Returns
    /// A client with empty connection, channel and subscription registries
    pub fn with_connector(config: BunnyConfig, connector: Arc<dyn Connector>) -> Self {
        let timeout = config.timeout();
        let default_logger = Arc::new(TracingLogger::new());

        let inner = Inner {
            connections: ConnectionManager::new(
                connector,
                timeout,
                config.max_connection_retry_count as usize,
            ),
            channels: ChannelManager::new(timeout),
            subscriptions: SubscriptionManager::new(),
            dispatcher: config.dispatch_type.dispatcher(),
            matcher: RouteMatcher::new(),
            logger: SharedLogger::new(default_logger.clone()),
            default_logger,
            events: Emitter::default(),
            subscribing: tokio::sync::Mutex::new(()),
            config,
        };

        BunnyBus {
            inner: Arc::new(inner),
        }
    }

    /// Version stamped into every envelope this client produces.
    pub fn version() -> &'static str {
        envelope::VERSION
    }

    pub fn config(&self) -> &BunnyConfig {
        &self.inner.config
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.inner.logger()
    }

    /// Replaces the logger the orchestrator reports through.
    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.inner.logger.set(logger);
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.connections.events()
    }

    pub fn channel_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.channels.events()
    }

    pub fn subscription_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.inner.subscriptions.events()
    }

    /// Entries written by the default logger.
    pub fn log_events(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.default_logger.events()
    }

    /// Returns the live channel context for `name`, (re)building the
    /// connection and the channel when either is missing or closed.
    ///
    /// # Parameters
    /// * `name` - Channel name, e.g. `"default"` or `"listen-channel-<queue>"`
    ///
    /// # Returns
    /// The channel context, or an error once the connection retries are exhausted
    pub async fn auto_build_channel_context(&self, name: &str) -> Result<Arc<ChannelContext>> {
        self.inner.auto_build_channel_context(name).await
    }

    /// Asserts an exchange on the broker.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    /// * `kind` - Routing behaviour of the exchange
    /// * `options` - Declaration flags, the configured exchange options when `None`
    ///
    /// # Returns
    /// `Ok(())` once the broker confirmed the declaration
    pub async fn create_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: Option<ExchangeOptions>,
    ) -> Result<()> {
        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        let options = options.unwrap_or_else(|| self.inner.config.exchange.clone());
        channel.assert_exchange(name, kind, &options).await?;
        self.logger().debug(&format!("exchange {name} asserted"));
        Ok(())
    }

    pub async fn delete_exchange(&self, name: &str) -> Result<()> {
        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        channel.delete_exchange(name).await?;
        self.logger().debug(&format!("exchange {name} deleted"));
        Ok(())
    }

    /// Whether the exchange exists; a missing exchange is not an error.
    pub async fn check_exchange(&self, name: &str) -> Result<bool> {
        let channel = self.inner.transport(MANAGEMENT_CHANNEL_NAME).await?;
        match channel.check_exchange(name).await {
            Ok(()) => Ok(true),
            Err(TransportError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Asserts a queue on the broker.
    ///
    /// Re-declaring an existing queue with different options fails with a
    /// precondition error and closes the default channel.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    /// * `options` - Declaration flags and arguments, the configured queue options when `None`
    ///
    /// # Returns
    /// The message and consumer counters of the queue
    pub async fn create_queue(&self, name: &str, options: Option<QueueOptions>) -> Result<QueueInfo> {
        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        let options = options.unwrap_or_else(|| self.inner.config.queue.clone());
        let info = channel.assert_queue(name, &options).await?;
        self.logger().debug(&format!("queue {name} asserted"));
        Ok(info)
    }

    /// Deletes the queue, returning the number of messages it held.
    pub async fn delete_queue(&self, name: &str) -> Result<u32> {
        if self.check_queue(name).await?.is_none() {
            return Ok(0);
        }
        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        let deleted = channel.delete_queue(name).await?;
        self.logger().debug(&format!("queue {name} deleted"));
        Ok(deleted)
    }

    /// Looks the queue up passively on the management channel.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// The queue counters, or `None` if it does not exist
    pub async fn check_queue(&self, name: &str) -> Result<Option<QueueInfo>> {
        self.inner.check_queue(name).await
    }

    /// Drops every ready message of the queue, returning how many were purged.
    pub async fn purge_queue(&self, name: &str) -> Result<u32> {
        if self.check_queue(name).await?.is_none() {
            return Ok(0);
        }
        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        Ok(channel.purge_queue(name).await?)
    }

    /// Publishes `message` to the global (or given) exchange.
    ///
    /// The route key is taken, in order, from `force_route_key`, the
    /// forwarded message, `route_key`, then the payload's `event` field.
    ///
    /// # Parameters
    /// * `message` - JSON value or raw bytes to publish
    /// * `options` - Route key, exchange, identity and extra headers
    ///
    /// # Returns
    /// `Ok(())` once published, or [`BunnyError::NoRouteKey`] when no route key resolves
    pub async fn publish(&self, message: impl Into<Payload>, options: PublishOptions) -> Result<()> {
        let payload = message.into();
        let route_key = resolve_route_key(&RouteKeySources {
            override_key: options.force_route_key.as_deref(),
            received: options.forward.as_ref(),
            option_key: options.route_key.as_deref(),
            payload: Some(&payload),
        })
        .ok_or(BunnyError::NoRouteKey)?;

        let envelope = build_envelope(&payload, &options, Some(route_key.clone()))?;
        let exchange = options
            .exchange
            .as_deref()
            .unwrap_or(&self.inner.config.global_exchange);

        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        channel
            .assert_exchange(exchange, ExchangeKind::Topic, &self.inner.config.exchange)
            .await?;
        channel
            .publish(exchange, &route_key, &envelope.content, &envelope.properties())
            .await?;

        let transaction_id = envelope.headers.transaction_id.unwrap_or_default();
        self.logger()
            .debug(&format!("published {route_key} ({transaction_id}) to {exchange}"));
        self.inner.events.emit(BusEvent::Published {
            route_key,
            transaction_id,
        });
        Ok(())
    }

    /// Sends `message` directly to `queue`, asserting the queue first.
    ///
    /// Unlike [`publish`](Self::publish) a missing route key is allowed.
    ///
    /// # Parameters
    /// * `message` - JSON value or raw bytes to send
    /// * `queue` - The destination queue
    /// * `options` - Route key, identity and extra headers; `exchange` is ignored
    pub async fn send(&self, message: impl Into<Payload>, queue: &str, options: PublishOptions) -> Result<()> {
        let payload = message.into();
        let route_key = resolve_route_key(&RouteKeySources {
            override_key: options.force_route_key.as_deref(),
            received: options.forward.as_ref(),
            option_key: options.route_key.as_deref(),
            payload: Some(&payload),
        });

        let envelope = build_envelope(&payload, &options, route_key)?;
        self.inner
            .send_envelope(queue, &envelope, Some(&self.inner.config.queue))
            .await
    }

    /// Fetches one message without consuming; `None` when the queue is empty
    /// or does not exist. The message stays unacknowledged on the default
    /// channel until passed to [`ack`](Self::ack), [`reject`](Self::reject)
    /// or [`requeue`](Self::requeue).
    pub async fn get(&self, queue: &str) -> Result<Option<Message>> {
        if self.check_queue(queue).await?.is_none() {
            return Ok(None);
        }
        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        Ok(channel.get(queue).await?)
    }

    /// Drains every message currently in `queue` through `handler`.
    ///
    /// Malformed messages are rejected without reaching the handler. A
    /// failing handler is logged and draining continues.
    ///
    /// # Parameters
    /// * `queue` - The queue to drain
    /// * `handler` - Called once per decoded message
    /// * `options` - Whether the handler receives the payload with its metadata
    ///
    /// # Returns
    /// How many messages were handed to `handler`, 0 for a missing queue
    pub async fn get_all(&self, queue: &str, handler: Handler, options: GetAllOptions) -> Result<usize> {
        if self.check_queue(queue).await?.is_none() {
            return Ok(0);
        }

        let channel = self.inner.transport(DEFAULT_CHANNEL_NAME).await?;
        let route = Arc::new(DeliveryRoute {
            queue: queue.to_owned(),
            channel: channel.clone(),
            error_queue: None,
            max_retry_count: self.inner.config.max_retry_count,
            auto_ack: false,
            forwarder: self.inner.clone(),
        });

        let mut handled = 0;
        while let Some(raw) = channel.get(queue).await? {
            let Some(decoded) = envelope::decode(&raw) else {
                self.logger()
                    .warn(&format!("malformed message on queue {queue}, rejecting"));
                route.discard(&raw).await;
                continue;
            };

            let incoming = Incoming::new(decoded, options.meta, raw, route.clone());
            if let Err(err) = handler(incoming).await {
                self.logger()
                    .error(&format!("get_all handler failed on queue {queue}: {err}"));
            }
            handled += 1;
        }

        Ok(handled)
    }

    /// Registers `handlers` for `queue` and starts consuming it.
    ///
    /// The queue is asserted and, unless `disable_queue_bind` is set, bound
    /// to the global exchange for every handler pattern before consumption
    /// starts on its own listen channel.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume
    /// * `handlers` - Route key patterns and the handler each dispatches to
    /// * `options` - Queue, retry, validation and dead letter overrides for this subscription
    ///
    /// # Returns
    /// `Ok(())` once consuming, or an error if the queue is already
    /// subscribed or blocked
    pub async fn subscribe(&self, queue: &str, handlers: Handlers, options: SubscribeOptions) -> Result<()> {
        let _guard = self.inner.subscribing.lock().await;
        let subscriptions = &self.inner.subscriptions;

        if subscriptions.contains(queue, true) {
            return Err(BunnyError::SubscriptionExists(queue.to_owned()));
        }
        if subscriptions.is_blocked(queue) {
            return Err(BunnyError::SubscriptionBlocked(queue.to_owned()));
        }
        if !subscriptions.create(queue, handlers, options) {
            return Err(BunnyError::SubscriptionExists(queue.to_owned()));
        }

        self.inner.start(queue).await?;
        self.logger().info(&format!("subscribed to {queue}"));
        self.inner.events.emit(BusEvent::Subscribed {
            queue: queue.to_owned(),
        });
        Ok(())
    }

    /// Stops consuming `queue`. The registered subscription is kept unless
    /// `remove` is set. Returns false when nothing was registered.
    pub async fn unsubscribe(&self, queue: &str, remove: bool) -> Result<bool> {
        let _guard = self.inner.subscribing.lock().await;
        self.inner.unsubscribe(queue, remove).await
    }

    /// Blocks `queue` from being subscribed and stops any active consumption of it.
    pub async fn block_queue(&self, queue: &str) -> Result<()> {
        let _guard = self.inner.subscribing.lock().await;
        self.inner.subscriptions.block(queue);
        if self.inner.subscriptions.contains(queue, true) {
            self.inner.unsubscribe(queue, false).await?;
        }
        self.logger().info(&format!("queue {queue} blocked"));
        Ok(())
    }

    /// Lifts a block and resumes a registered subscription of `queue`.
    pub async fn unblock_queue(&self, queue: &str) -> Result<()> {
        let _guard = self.inner.subscribing.lock().await;
        self.inner.subscriptions.unblock(queue);
        self.logger().info(&format!("queue {queue} unblocked"));

        let subscriptions = &self.inner.subscriptions;
        if subscriptions.contains(queue, false) && !subscriptions.contains(queue, true) {
            self.inner.start(queue).await?;
            self.inner.events.emit(BusEvent::Subscribed {
                queue: queue.to_owned(),
            });
        }
        Ok(())
    }

    /// Acknowledges a message obtained on `channel` (the default channel when `None`).
    pub async fn ack(&self, message: &Message, channel: Option<&str>) -> Result<()> {
        let channel = self.inner.settlement_channel(channel).await?;
        Ok(channel.ack(message.fields.delivery_tag).await?)
    }

    /// Moves a message to `error_queue` (or the configured one) and acknowledges it.
    pub async fn reject(&self, message: &Message, channel: Option<&str>, error_queue: Option<&str>) -> Result<()> {
        let channel = self.inner.settlement_channel(channel).await?;
        self.inner.dead_letter(message, error_queue).await?;
        Ok(channel.ack(message.fields.delivery_tag).await?)
    }

    /// Sends a message back to `queue` with its retry count incremented and
    /// acknowledges it; at the retry ceiling it is rejected instead.
    ///
    /// # Parameters
    /// * `message` - A message obtained through [`get`](Self::get) or a subscription
    /// * `channel` - Channel the message was delivered on, the default channel when `None`
    /// * `queue` - Queue to requeue the message to
    pub async fn requeue(&self, message: &Message, channel: Option<&str>, queue: &str) -> Result<()> {
        let retries = EnvelopeHeaders::from_headers(&message.properties.headers)
            .retry_count
            .unwrap_or(0);
        if retries >= i64::from(self.inner.config.max_retry_count) {
            return self.reject(message, channel, None).await;
        }

        let channel = self.inner.settlement_channel(channel).await?;
        self.inner.redeliver(message, queue).await?;
        Ok(channel.ack(message.fields.delivery_tag).await?)
    }

    /// Unsubscribes everything and closes every channel and the connection.
    pub async fn stop(&self) -> Result<()> {
        {
            let _guard = self.inner.subscribing.lock().await;
            for subscription in self.inner.subscriptions.list() {
                if subscription.is_active() {
                    self.inner.unsubscribe(&subscription.queue, false).await?;
                }
            }
        }

        for name in self.inner.channels.names() {
            self.inner.channels.close(&name).await?;
        }
        self.inner.connections.close(DEFAULT_CONNECTION_NAME).await?;
        self.logger().info("bunnybus stopped");
        Ok(())
    }
}

fn build_envelope(payload: &Payload, options: &PublishOptions, route_key: Option<String>) -> Result<Envelope> {
    let (content, is_buffer) = envelope::encode(payload)?;

    let mut draft = match &options.forward {
        Some(received) => EnvelopeDraft::redelivery(&EnvelopeHeaders::from_headers(
            &received.properties.headers,
        )),
        None => EnvelopeDraft::default(),
    };
    if options.transaction_id.is_some() {
        draft.transaction_id = options.transaction_id.clone();
    }
    if options.source.is_some() {
        draft.source = options.source.clone();
    }
    draft.route_key = route_key;
    draft.extra.extend(options.headers.clone());
    otel::inject(&mut draft.extra);

    Ok(draft.seal(content, is_buffer))
}

impl Inner {
    fn logger(&self) -> Arc<dyn Logger> {
        self.logger.get()
    }

    async fn auto_build_channel_context(&self, name: &str) -> Result<Arc<ChannelContext>> {
        if let Some(context) = self.channels.get(name) {
            if context.is_live() {
                return Ok(context);
            }
        }

        let connection = self
            .connections
            .create(DEFAULT_CONNECTION_NAME, self.config.connection_options())
            .await?;
        self.channels
            .create(
                name,
                &connection,
                ChannelOptions {
                    prefetch: self.config.prefetch,
                },
            )
            .await
    }

    /// Live transport handle of channel `name`.
    async fn transport(&self, name: &str) -> Result<Arc<dyn TransportChannel>> {
        self.auto_build_channel_context(name)
            .await?
            .channel()
            .ok_or(BunnyError::NoChannel)
    }

    async fn settlement_channel(&self, name: Option<&str>) -> Result<Arc<dyn TransportChannel>> {
        self.transport(name.unwrap_or(DEFAULT_CHANNEL_NAME))
            .await
            .map_err(|err| {
                self.logger()
                    .error(&format!("no channel to settle message: {err}"));
                BunnyError::NoChannel
            })
    }

    async fn check_queue(&self, name: &str) -> Result<Option<QueueInfo>> {
        let channel = self.transport(MANAGEMENT_CHANNEL_NAME).await?;
        match channel.check_queue(name).await {
            Ok(info) => Ok(Some(info)),
            Err(TransportError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Publishes `envelope` to `queue` through the default exchange,
    /// declaring the queue first with `declare` when given.
    async fn send_envelope(&self, queue: &str, envelope: &Envelope, declare: Option<&QueueOptions>) -> Result<()> {
        let channel = self.transport(DEFAULT_CHANNEL_NAME).await?;
        if let Some(options) = declare {
            channel.assert_queue(queue, options).await?;
        }
        channel
            .publish("", queue, &envelope.content, &envelope.properties())
            .await?;

        let transaction_id = envelope.headers.transaction_id.clone().unwrap_or_default();
        self.logger()
            .debug(&format!("sent {transaction_id} to {queue}"));
        self.events.emit(BusEvent::Sent {
            queue: queue.to_owned(),
            transaction_id,
        });
        Ok(())
    }

    fn error_queue(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_owned)
            .or_else(|| self.config.error_queue.clone())
    }

    /// Starts consuming the registered subscription of `queue`.
    async fn start(self: &Arc<Self>, queue: &str) -> Result<()> {
        let Some(subscription) = self.subscriptions.get(queue) else {
            return Ok(());
        };
        if subscription.is_active() {
            return Ok(());
        }
        if self.subscriptions.is_blocked(queue) {
            return Err(BunnyError::SubscriptionBlocked(queue.to_owned()));
        }

        let options = &subscription.options;
        let exchange = &self.config.global_exchange;
        let channel = self.transport(&listen_channel_name(queue)).await?;

        channel
            .assert_exchange(exchange, ExchangeKind::Topic, &self.config.exchange)
            .await?;
        let queue_options = options.queue.clone().unwrap_or_else(|| self.config.queue.clone());
        channel.assert_queue(queue, &queue_options).await?;
        if let Some(error_queue) = self.error_queue(options.error_queue.as_deref()) {
            channel.assert_queue(&error_queue, &self.config.queue).await?;
        }
        if !options.disable_queue_bind {
            for pattern in subscription.handlers.patterns() {
                channel.bind_queue(queue, exchange, pattern).await?;
            }
        }

        let auto_ack = self.config.auto_acknowledgement;
        let consumer = channel.consume(queue, auto_ack).await?;
        self.subscriptions.tag(queue, &consumer.tag);

        let processor = Arc::new(Processor {
            route: Arc::new(DeliveryRoute {
                queue: queue.to_owned(),
                channel: channel.clone(),
                error_queue: options.error_queue.clone(),
                max_retry_count: options
                    .max_retry_count
                    .unwrap_or(self.config.max_retry_count),
                auto_ack,
                forwarder: self.clone(),
            }),
            handlers: subscription.handlers.clone(),
            meta: options.meta,
            validate_publisher: options
                .validate_publisher
                .unwrap_or(self.config.validate_publisher),
            validate_version: options
                .validate_version
                .unwrap_or(self.config.validate_version),
            reject_unrouted: self.config.reject_unrouted_messages,
            matcher: self.matcher.clone(),
            logger: self.logger.clone(),
        });

        debug!(queue, consumer_tag = consumer.tag, "consuming");
        tokio::spawn(self.clone().pump(queue.to_owned(), consumer, processor));
        Ok(())
    }

    /// Feeds deliveries to the dispatcher until the consumer stream ends.
    async fn pump(self: Arc<Self>, queue: String, consumer: Consumer, processor: Arc<Processor>) {
        let Consumer { tag, mut deliveries } = consumer;

        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(message) => {
                    let processor = processor.clone();
                    self.dispatcher
                        .push(&queue, Box::pin(async move { processor.process(message).await }));
                }
                Err(err) => {
                    warn!(error = err.to_string(), queue, "consumer stream failed");
                    break;
                }
            }
        }

        if self.subscriptions.clear_if_tagged(&queue, &tag) {
            self.logger()
                .warn(&format!("consumer of {queue} lost its transport, recovering"));
            self.recover(queue).await;
        } else {
            debug!(queue, consumer_tag = tag, "consumer stopped");
        }
    }

    /// Re-drives a subscription whose transport went away.
    fn recover(self: Arc<Self>, queue: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.events.emit(BusEvent::Recovering {
                queue: queue.clone(),
            });

            let result = retry(
                |_| {
                    let inner = self.clone();
                    let queue = queue.clone();
                    async move {
                        let _guard = inner.subscribing.lock().await;
                        inner.start(&queue).await
                    }
                },
                exponential_backoff,
                self.config.max_connection_retry_count as usize,
                |err| matches!(err, BunnyError::SubscriptionBlocked(_)),
            )
            .await;

            match result {
                Ok(()) if !self.subscriptions.contains(&queue, true) => {
                    self.logger()
                        .info(&format!("subscription {queue} went away while recovering"));
                }
                Ok(()) => {
                    self.logger().info(&format!("subscription {queue} recovered"));
                    self.events.emit(BusEvent::Recovered { queue });
                }
                Err(err) => {
                    self.logger()
                        .error(&format!("failure to recover subscription {queue}: {err}"));
                    self.events.emit(BusEvent::RecoveryFailed { queue });
                }
            }
        })
    }

    async fn unsubscribe(&self, queue: &str, remove: bool) -> Result<bool> {
        let Some(subscription) = self.subscriptions.get(queue) else {
            return Ok(false);
        };

        if let Some(tag) = subscription.consumer_tag {
            self.subscriptions.clear(queue);
            let channel = self
                .channels
                .get(&listen_channel_name(queue))
                .and_then(|context| context.channel());
            if let Some(channel) = channel {
                channel.cancel(&tag).await?;
            }
        }
        if remove {
            self.subscriptions.remove(queue);
        }

        self.logger().info(&format!("unsubscribed from {queue}"));
        self.events.emit(BusEvent::Unsubscribed {
            queue: queue.to_owned(),
        });
        Ok(true)
    }

    fn redelivery_draft(message: &Message) -> (EnvelopeDraft, bool) {
        let received = EnvelopeHeaders::from_headers(&message.properties.headers);
        let mut draft = EnvelopeDraft::redelivery(&received);
        if draft.route_key.is_none() && !message.fields.routing_key.is_empty() {
            draft.route_key = Some(message.fields.routing_key.clone());
        }
        (draft, received.is_buffer)
    }
}

#[async_trait]
impl Forwarder for Inner {
    async fn dead_letter(&self, message: &Message, error_queue: Option<&str>) -> Result<()> {
        let Some(queue) = self.error_queue(error_queue) else {
            self.logger().error("no dead letter queue configured");
            return Err(BunnyError::NoDeadLetterQueue);
        };

        let (mut draft, is_buffer) = Self::redelivery_draft(message);
        draft.errored_at = Some(timestamp());
        let envelope = draft.seal(message.content.clone(), is_buffer);
        self.send_envelope(&queue, &envelope, Some(&self.config.queue)).await
    }

    async fn redeliver(&self, message: &Message, queue: &str) -> Result<()> {
        let (mut draft, is_buffer) = Self::redelivery_draft(message);
        draft.retry_count = Some(draft.retry_count.unwrap_or(0) + 1);
        draft.requeued_at = Some(timestamp());
        let envelope = draft.seal(message.content.clone(), is_buffer);
        // the source queue exists and may carry subscription-specific options
        self.send_envelope(queue, &envelope, None).await
    }
}
