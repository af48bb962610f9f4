// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! Implementation of the transport traits over `lapin`. Header tables are
//! converted between [`Headers`] and lapin's `FieldTable`, and AMQP
//! `NOT_FOUND` soft errors surface as [`TransportError::NotFound`] so that
//! passive checks can report a missing resource without failing.

use crate::{
    errors::TransportError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
    transport::{
        CloseCallback, ConnectionOptions, Connector, Consumer, DeliveryFields, HeaderValue,
        Headers, Message, MessageProperties, QueueInfo, TransportChannel, TransportConnection,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
        QueuePurgeOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

type Result<T> = std::result::Result<T, TransportError>;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

fn transport_error(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            TransportError::NotFound(amqp.to_string())
        }
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)) =>
        {
            TransportError::PreconditionFailed(amqp.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed
        }
        _ => TransportError::Protocol(err.to_string()),
    }
}

/// Converts header values to a lapin field table.
pub(crate) fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => match i32::try_from(*v) {
                Ok(small) => AMQPValue::LongInt(small),
                Err(_) => AMQPValue::LongLongInt(*v),
            },
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        };
        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts a lapin field table back to header values; nested tables, arrays
/// and byte arrays are not carried.
pub(crate) fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::Timestamp(v) => HeaderValue::Int(*v as i64),
                AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
                AMQPValue::Double(v) => HeaderValue::Float(*v),
                AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
                AMQPValue::LongString(v) => {
                    HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let message_id = properties
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(message_id))
        .with_headers(field_table(&properties.headers));

    if let Some(content_type) = &properties.content_type {
        props = props.with_content_type(ShortString::from(content_type.as_str()));
    }
    if properties.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    props
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        headers: props.headers().as_ref().map(headers).unwrap_or_default(),
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
    }
}

fn message(delivery: Delivery, consumer_tag: Option<&str>) -> Message {
    Message {
        properties: message_properties(&delivery.properties),
        fields: DeliveryFields {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            consumer_tag: consumer_tag.map(str::to_owned),
        },
        content: delivery.data,
    }
}

/// Close callbacks shared with lapin's error handler.
#[derive(Clone, Default)]
struct Callbacks {
    inner: Arc<Mutex<Vec<CloseCallback>>>,
}

impl Callbacks {
    fn lock(&self) -> MutexGuard<'_, Vec<CloseCallback>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, callback: CloseCallback) {
        self.lock().push(callback);
    }

    fn fire(&self, reason: Option<String>) {
        let callbacks = std::mem::take(&mut *self.lock());
        for callback in callbacks {
            callback(reason.clone());
        }
    }
}

/// Opens lapin connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn TransportConnection>> {
        debug!(connection = options.connection_name, "creating amqp connection...");
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(options.connection_name.as_str()));

        let connection = Connection::connect(&options.uri, properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                TransportError::Connect(err.to_string())
            })?;

        let callbacks = Callbacks::default();
        let on_error = callbacks.clone();
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            on_error.fire(Some(err.to_string()));
        });

        debug!("amqp connected");
        Ok(Arc::new(AmqpConnection {
            inner: connection,
            callbacks,
        }))
    }
}

struct AmqpConnection {
    inner: Connection,
    callbacks: Callbacks,
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let channel = self.inner.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            transport_error(err)
        })?;

        let callbacks = Callbacks::default();
        let on_error = callbacks.clone();
        channel.on_error(move |err| {
            debug!(error = err.to_string(), "amqp channel error");
            on_error.fire(Some(err.to_string()));
        });

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            callbacks,
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.is_open() {
            self.callbacks.push(callback);
        } else {
            callback(None);
        }
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(transport_error);
        self.callbacks.fire(None);
        result
    }
}

struct AmqpChannel {
    inner: Channel,
    callbacks: Callbacks,
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(transport_error)
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                field_table(&options.declare_arguments()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                transport_error(err)
            })
    }

    async fn check_exchange(&self, name: &str) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.inner
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(transport_error)
    }

    async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueInfo> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                transport_error(err)
            })?;

        Ok(QueueInfo {
            queue: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn check_queue(&self, name: &str) -> Result<QueueInfo> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        Ok(QueueInfo {
            queue: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(transport_error)
    }

    async fn purge_queue(&self, name: &str) -> Result<u32> {
        self.inner
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(transport_error)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, exchange, "error to bind the queue");
                transport_error(err)
            })
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.inner
            .queue_unbind(queue, exchange, pattern, FieldTable::default())
            .await
            .map_err(transport_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                content,
                basic_properties(properties),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                transport_error(err)
            })
    }

    async fn get(&self, queue: &str) -> Result<Option<Message>> {
        let fetched = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(transport_error)?;

        Ok(fetched.map(|got| message(got.delivery, None)))
    }

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer> {
        let tag = format!("bunnybus-{}", Uuid::new_v4());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to consume the queue");
                transport_error(err)
            })?;

        let consumer_tag = tag.clone();
        let deliveries = consumer
            .map(move |delivery| {
                delivery
                    .map(|d| message(d, Some(&consumer_tag)))
                    .map_err(transport_error)
            })
            .boxed();

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(transport_error)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                transport_error(err)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                transport_error(err)
            })
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.is_open() {
            self.callbacks.push(callback);
        } else {
            callback(None);
        }
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(transport_error);
        self.callbacks.fire(None);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_survive_field_table_conversion() {
        let mut original = Headers::new();
        original.insert("transactionId".into(), HeaderValue::from("abc"));
        original.insert("retryCount".into(), HeaderValue::Int(3));
        original.insert("big".into(), HeaderValue::Int(i64::MAX));
        original.insert("isBuffer".into(), HeaderValue::Bool(false));
        original.insert("ratio".into(), HeaderValue::Float(0.5));

        let table = field_table(&original);
        assert!(matches!(
            table.inner().get("retryCount"),
            Some(AMQPValue::LongInt(3))
        ));
        assert!(matches!(
            table.inner().get("big"),
            Some(AMQPValue::LongLongInt(_))
        ));

        assert_eq!(headers(&table), original);
    }

    #[test]
    fn unsupported_field_values_are_skipped() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from("void"), AMQPValue::Void);
        btree.insert(ShortString::from("kind"), AMQPValue::ShortString("order".into()));

        let converted = headers(&FieldTable::from(btree));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted["kind"], HeaderValue::from("order"));
    }

    #[test]
    fn properties_default_a_message_id() {
        let props = basic_properties(&MessageProperties {
            persistent: true,
            content_type: Some("application/json".into()),
            ..Default::default()
        });

        assert!(props.message_id().is_some());
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));

        let back = message_properties(&props);
        assert!(back.persistent);
        assert_eq!(back.content_type.as_deref(), Some("application/json"));
    }
}
