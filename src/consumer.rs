// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Per-delivery protocol applied to everything a subscription receives:
//!
//! 1. decode the envelope; malformed content is rejected
//! 2. validate publisher and version stamps when enabled; failures are rejected
//! 3. reject deliveries whose retry count already reached the ceiling
//! 4. resolve handlers by route key, in registration order; an unrouted
//!    delivery is acked (or rejected when configured to)
//! 5. hand each matching handler an [`Incoming`]; a handler that fails
//!    without settling the message gets it requeued
//!
//! Rejecting publishes a copy to the dead letter queue with `erroredAt` set;
//! requeueing publishes a copy back to the queue with `retryCount`
//! incremented. The original delivery is acked afterwards in both cases.

use crate::{
    envelope::{self, Decoded, EnvelopeHeaders, Metadata, Payload},
    errors::{BunnyError, Result},
    logger::SharedLogger,
    otel,
    routing::RouteMatcher,
    subscription::{Handler, Handlers},
    transport::{Message, TransportChannel},
};
use async_trait::async_trait;
use opentelemetry::trace::{Span, Status};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

/// Publishes copies of received messages on behalf of a consumer.
#[async_trait]
pub(crate) trait Forwarder: Send + Sync {
    /// Copies `message` to `error_queue`, or the configured default, with `erroredAt` stamped.
    async fn dead_letter(&self, message: &Message, error_queue: Option<&str>) -> Result<()>;

    /// Copies `message` back to `queue` with the retry count incremented.
    async fn redeliver(&self, message: &Message, queue: &str) -> Result<()>;
}

/// Where a delivery came from and how it is settled.
pub(crate) struct DeliveryRoute {
    pub queue: String,
    /// The channel the delivery arrived on; acks must go to this exact handle.
    pub channel: Arc<dyn TransportChannel>,
    pub error_queue: Option<String>,
    pub max_retry_count: u32,
    pub auto_ack: bool,
    pub forwarder: Arc<dyn Forwarder>,
}

impl DeliveryRoute {
    async fn ack(&self, raw: &Message) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.channel
            .ack(raw.fields.delivery_tag)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = self.queue, "error whiling ack msg");
                BunnyError::from(err)
            })
    }

    async fn reject(&self, raw: &Message, error_queue: Option<&str>) -> Result<()> {
        let target = error_queue.or(self.error_queue.as_deref());
        self.forwarder.dead_letter(raw, target).await?;
        self.ack(raw).await
    }

    async fn requeue(&self, raw: &Message) -> Result<()> {
        let count = retry_count(raw);
        if count >= i64::from(self.max_retry_count) {
            warn!(queue = self.queue, count, "too many attempts, sending to dlq");
            return self.reject(raw, None).await;
        }

        self.forwarder.redeliver(raw, &self.queue).await?;
        self.ack(raw).await
    }

    /// Rejects a delivery that must not reach handlers; without a usable dead
    /// letter queue it is acked away.
    pub(crate) async fn discard(&self, raw: &Message) {
        if let Err(err) = self.reject(raw, None).await {
            error!(error = err.to_string(), queue = self.queue, "failure to reject message, dropping it");
            if let Err(err) = self.ack(raw).await {
                error!(error = err.to_string(), queue = self.queue, "error whiling ack msg");
            }
        }
    }
}

fn retry_count(raw: &Message) -> i64 {
    raw.properties
        .headers
        .get(envelope::HEADER_RETRY_COUNT)
        .and_then(|v| v.as_int())
        .unwrap_or(0)
}

/// A delivery handed to a subscription handler.
///
/// Exactly one of [`ack`](Self::ack), [`reject`](Self::reject) or
/// [`requeue`](Self::requeue) takes effect per delivery, shared across every
/// handler the delivery was routed to; later calls are no-ops.
pub struct Incoming {
    message: Payload,
    metadata: Option<Metadata>,
    raw: Arc<Message>,
    route: Arc<DeliveryRoute>,
    settled: Arc<AtomicBool>,
}

impl Incoming {
    /// A delivery settled on its own, outside any subscription.
    pub(crate) fn new(decoded: Decoded, meta: bool, raw: Message, route: Arc<DeliveryRoute>) -> Self {
        let Decoded { message, metadata } = decoded;
        Incoming {
            message,
            metadata: meta.then_some(metadata),
            raw: Arc::new(raw),
            route,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn message(&self) -> &Payload {
        &self.message
    }

    /// Headers and delivery fields; only present when the subscription asked for them.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// The message as received from the transport.
    pub fn raw(&self) -> &Message {
        &self.raw
    }

    pub fn queue(&self) -> &str {
        &self.route.queue
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        let first = !self.settled.swap(true, Ordering::SeqCst);
        if !first {
            debug!(queue = self.route.queue, "delivery already settled");
        }
        first
    }

    /// Acknowledges the delivery, removing it from the queue.
    pub async fn ack(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        self.route.ack(&self.raw).await
    }

    /// Moves the delivery to the subscription's dead letter queue.
    pub async fn reject(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        self.route.reject(&self.raw, None).await
    }

    /// Moves the delivery to `error_queue`.
    pub async fn reject_to(&self, error_queue: &str) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        self.route.reject(&self.raw, Some(error_queue)).await
    }

    /// Sends the delivery back to its queue; at the retry ceiling it is rejected instead.
    pub async fn requeue(&self) -> Result<()> {
        if !self.claim() {
            return Ok(());
        }
        self.route.requeue(&self.raw).await
    }
}

/// Applies the delivery protocol for one subscription.
pub(crate) struct Processor {
    pub route: Arc<DeliveryRoute>,
    pub handlers: Handlers,
    pub meta: bool,
    pub validate_publisher: bool,
    pub validate_version: bool,
    pub reject_unrouted: bool,
    pub matcher: RouteMatcher,
    pub logger: SharedLogger,
}

impl Processor {
    pub async fn process(&self, raw: Message) {
        let headers = EnvelopeHeaders::from_headers(&raw.properties.headers);
        let route_key = headers
            .route_key
            .clone()
            .unwrap_or_else(|| raw.fields.routing_key.clone());
        let (_ctx, mut span) = otel::new_span(&raw.properties.headers, &route_key);

        let Some(decoded) = envelope::decode(&raw) else {
            self.logger.get().warn(&format!(
                "malformed message on queue {}, rejecting",
                self.route.queue
            ));
            span.set_status(Status::Error {
                description: Cow::from("malformed message"),
            });
            self.discard(&raw).await;
            return;
        };

        if let Err(err) = envelope::validate(&headers, self.validate_publisher, self.validate_version) {
            self.logger.get().warn(&format!(
                "message on queue {} failed validation: {err}",
                self.route.queue
            ));
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("validation failure"),
            });
            self.discard(&raw).await;
            return;
        }

        if retry_count(&raw) >= i64::from(self.route.max_retry_count) {
            self.logger.get().warn(&format!(
                "message {} on queue {} exceeded {} retries, rejecting",
                headers.transaction_id.as_deref().unwrap_or_default(),
                self.route.queue,
                self.route.max_retry_count
            ));
            self.discard(&raw).await;
            return;
        }

        let matched: Vec<Handler> = self
            .handlers
            .iter()
            .filter(|(pattern, _)| self.matcher.matches(pattern, &route_key))
            .map(|(_, handler)| handler.clone())
            .collect();

        if matched.is_empty() {
            debug!(queue = self.route.queue, route_key, "no handler matched");
            let result = if self.reject_unrouted {
                self.route.reject(&raw, None).await
            } else {
                self.route.ack(&raw).await
            };
            if let Err(err) = result {
                error!(error = err.to_string(), queue = self.route.queue, "failure to settle unrouted message");
            }
            return;
        }

        self.dispatch(decoded, raw, matched, &mut span).await;
    }

    async fn dispatch<S: Span>(&self, decoded: Decoded, raw: Message, matched: Vec<Handler>, span: &mut S) {
        let Decoded { message, metadata } = decoded;
        let raw = Arc::new(raw);
        let settled = Arc::new(AtomicBool::new(false));

        for handler in matched {
            let incoming = Incoming {
                message: message.clone(),
                metadata: self.meta.then(|| metadata.clone()),
                raw: raw.clone(),
                route: self.route.clone(),
                settled: settled.clone(),
            };

            if let Err(err) = handler(incoming).await {
                self.logger.get().error(&format!(
                    "handler failed on queue {}: {err}",
                    self.route.queue
                ));
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                });

                if !settled.swap(true, Ordering::SeqCst) {
                    if let Err(err) = self.route.requeue(&raw).await {
                        error!(error = err.to_string(), queue = self.route.queue, "error whiling requeuing");
                    }
                }
            }
        }

        if !settled.load(Ordering::SeqCst) {
            debug!(queue = self.route.queue, "handlers returned without settling the message");
        } else {
            span.set_status(Status::Ok);
        }
    }

    async fn discard(&self, raw: &Message) {
        self.route.discard(raw).await
    }
}
