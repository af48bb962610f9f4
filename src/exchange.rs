// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchange kinds and the options used when asserting an exchange. BunnyBus
//! publishes through a topic exchange; the other kinds are available for
//! callers managing their own topology.

use crate::transport::{HeaderValue, Headers};
use serde::Deserialize;

/// Header field naming the alternate exchange for unroutable messages
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";
/// Header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: exact match of routing keys
/// - Fanout: every bound queue regardless of routing key
/// - Topic: wildcard pattern matching of routing keys
/// - Headers: matching on header values
/// - XMessageDelayed: delayed delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Options applied when an exchange is asserted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub internal: bool,
    pub auto_delete: bool,
    pub alternate_exchange: Option<String>,
    pub arguments: Headers,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: true,
            internal: false,
            auto_delete: false,
            alternate_exchange: None,
            arguments: Headers::default(),
        }
    }
}

impl ExchangeOptions {
    /// Makes the exchange transient.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Routes unroutable messages to `exchange`.
    pub fn alternate_exchange(mut self, exchange: &str) -> Self {
        self.alternate_exchange = Some(exchange.to_owned());
        self
    }

    /// Marks a delayed exchange as delivering like `kind` once the delay elapses.
    pub fn delayed(mut self, kind: &str) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::from(kind),
        );
        self
    }

    /// Adds a single argument.
    pub fn argument(mut self, key: &str, value: HeaderValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Arguments as sent to the broker, alternate exchange included.
    pub fn declare_arguments(&self) -> Headers {
        let mut args = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            args.insert(
                AMQP_HEADERS_ALTERNATE_EXCHANGE.to_owned(),
                HeaderValue::from(alternate.as_str()),
            );
        }
        args
    }
}
