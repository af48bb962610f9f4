// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Options used when asserting queues, with builder helpers for the common
//! RabbitMQ queue arguments.

use crate::transport::{HeaderValue, Headers};
use serde::Deserialize;

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Options applied when a queue is asserted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: Headers,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            exclusive: false,
            durable: true,
            auto_delete: false,
            arguments: Headers::default(),
        }
    }
}

impl QueueOptions {
    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the queue transient, lost on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the queue to auto-delete when its last consumer leaves.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Messages older than `ttl` milliseconds are dropped or dead-lettered.
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.arguments
            .insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::Int(ttl));
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i64) -> Self {
        self.arguments
            .insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::Int(max));
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i64) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
            HeaderValue::Int(max_bytes),
        );
        self
    }

    /// Lets the broker dead-letter expired or overflowing messages to `queue`.
    pub fn dead_letter_to(mut self, queue: &str) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            HeaderValue::from(""),
        );
        self.arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
            HeaderValue::from(queue),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_durable_and_shared() {
        let opts = QueueOptions::default();
        assert!(opts.durable);
        assert!(!opts.exclusive);
        assert!(!opts.auto_delete);
        assert!(opts.arguments.is_empty());
    }

    #[test]
    fn builders_fill_arguments() {
        let opts = QueueOptions::default()
            .ttl(1_000)
            .max_length(10)
            .dead_letter_to("orders-dlq");

        assert_eq!(
            opts.arguments.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&HeaderValue::Int(1_000))
        );
        assert_eq!(
            opts.arguments.get(AMQP_HEADERS_MAX_LENGTH),
            Some(&HeaderValue::Int(10))
        );
        assert_eq!(
            opts.arguments.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("orders-dlq"))
        );
    }
}
