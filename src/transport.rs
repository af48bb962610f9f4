// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Capabilities
//!
//! The broker is reached through three collaborators: a [`Connector`] that
//! opens [`TransportConnection`]s, which in turn open [`TransportChannel`]s.
//! Everything above this module speaks only these traits, so the lapin
//! transport and the in-process broker are interchangeable.

use crate::{
    errors::TransportError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// A single header value carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Float(v) => Some(*v as i64),
            HeaderValue::String(v) => v.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(v) => Some(*v),
            HeaderValue::String(v) => v.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(v) => write!(f, "{v}"),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Header table attached to a message.
pub type Headers = BTreeMap<String, HeaderValue>;

/// Message properties set by the producer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub headers: Headers,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
}

/// Delivery information assigned by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryFields {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: Option<String>,
}

/// A message as received from a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub content: Vec<u8>,
    pub properties: MessageProperties,
    pub fields: DeliveryFields,
}

/// Queue counters reported by declare and check operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Parameters used to open a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub uri: String,
    pub connection_name: String,
}

/// An active consumer and the deliveries it receives.
///
/// The stream ends when the consumer is cancelled or its channel closes.
pub struct Consumer {
    pub tag: String,
    pub deliveries: BoxStream<'static, Result<Message, TransportError>>,
}

/// Invoked once a connection or channel stops being usable, with the reason if known.
pub type CloseCallback = Box<dyn Fn(Option<String>) + Send + Sync>;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

/// A live connection to the broker.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError>;

    fn is_open(&self) -> bool;

    fn on_close(&self, callback: CloseCallback);

    async fn close(&self) -> Result<(), TransportError>;
}

/// A channel multiplexed over a [`TransportConnection`].
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn prefetch(&self, count: u16) -> Result<(), TransportError>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError>;

    /// Passive check; a missing exchange yields [`TransportError::NotFound`].
    async fn check_exchange(&self, name: &str) -> Result<(), TransportError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), TransportError>;

    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError>;

    /// Passive check; a missing queue yields [`TransportError::NotFound`].
    async fn check_queue(&self, name: &str) -> Result<QueueInfo, TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<u32, TransportError>;

    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), TransportError>;

    /// Publishes to an exchange; the empty exchange name routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError>;

    async fn get(&self, queue: &str) -> Result<Option<Message>, TransportError>;

    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer, TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn on_close(&self, callback: CloseCallback);

    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_coerce() {
        assert_eq!(HeaderValue::from("3").as_int(), Some(3));
        assert_eq!(HeaderValue::Int(7).as_int(), Some(7));
        assert_eq!(HeaderValue::from(true).as_bool(), Some(true));
        assert_eq!(HeaderValue::Int(1).as_str(), None);
        assert_eq!(HeaderValue::from("x").to_string(), "x");
    }

    #[test]
    fn header_values_deserialize_untagged() {
        let headers: Headers =
            serde_json::from_str(r#"{"a":true,"b":2,"c":"three","d":1.5}"#).unwrap();
        assert_eq!(headers["a"], HeaderValue::Bool(true));
        assert_eq!(headers["b"], HeaderValue::Int(2));
        assert_eq!(headers["c"], HeaderValue::String("three".into()));
        assert_eq!(headers["d"], HeaderValue::Float(1.5));
    }
}
