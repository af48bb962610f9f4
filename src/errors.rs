// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for BunnyBus
//!
//! Every failure the client surfaces is a typed variant of [`BunnyError`].
//! Transport collaborators report through [`TransportError`], which keeps
//! "not found" apart from connectivity failures so that check operations can
//! turn it into a benign negative result.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BunnyError>;

/// Errors raised by a transport collaborator (broker connection or channel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The queue or exchange addressed by the operation does not exist
    #[error("resource not found `{0}`")]
    NotFound(String),

    /// The connection or channel handle is no longer usable
    #[error("transport handle closed")]
    Closed,

    /// A resource was re-declared with attributes that differ from the existing one
    #[error("precondition failed `{0}`")]
    PreconditionFailed(String),

    /// Failure to reach the broker
    #[error("failure to connect `{0}`")]
    Connect(String),

    /// Any other broker-level failure
    #[error("protocol error `{0}`")]
    Protocol(String),
}

/// Represents errors that can occur during BunnyBus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BunnyError {
    /// No connection could be established for the requested name
    #[error("failure to connect")]
    NoConnection,

    /// No channel could be established for the requested name
    #[error("failure to create a channel")]
    NoChannel,

    /// Publish attempted without a resolvable routing key
    #[error("no route key could be resolved for the message")]
    NoRouteKey,

    /// A required envelope header is missing
    #[error("missing header field `{0}`")]
    NoHeaderField(String),

    /// An active subscription already consumes the queue
    #[error("subscription already exists for queue `{0}`")]
    SubscriptionExists(String),

    /// The queue is blocked from being subscribed
    #[error("subscription blocked for queue `{0}`")]
    SubscriptionBlocked(String),

    /// The producer stamped a version whose major part differs from ours
    #[error("incompatible publisher version `{0}`")]
    IncompatibleVersion(String),

    /// A custom logger does not provide every required level
    #[error("incompatible logger, missing level `{0}`")]
    IncompatibleLogger(String),

    /// No dead letter queue is configured for a rejection
    #[error("no dead letter queue configured")]
    NoDeadLetterQueue,

    /// A retried operation failed on every attempt
    #[error("exceeded maximum attempts `{0}`")]
    AttemptsExceeded(usize),

    /// A retried operation was stopped by its error filter
    #[error("retry stopped by error filter `{0}`")]
    FilterTripped(String),

    /// An operation did not complete before its deadline
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Failure to serialize or deserialize a payload
    #[error("failure to serialize payload `{0}`")]
    Serialization(String),

    /// Configuration could not be loaded
    #[error("invalid configuration `{0}`")]
    Config(String),

    /// A subscription handler reported a failure
    #[error("handler failure `{0}`")]
    Handler(String),

    /// Error raised by the transport
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BunnyError {
    /// Whether the error stems from the transport dropping or refusing a connection.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            BunnyError::NoConnection
                | BunnyError::NoChannel
                | BunnyError::Transport(TransportError::Closed)
                | BunnyError::Transport(TransportError::Connect(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_convert() {
        let err: BunnyError = TransportError::NotFound("q".into()).into();
        assert_eq!(err, BunnyError::Transport(TransportError::NotFound("q".into())));
        assert!(!err.is_connectivity());
        assert!(BunnyError::from(TransportError::Closed).is_connectivity());
    }

    #[test]
    fn messages_name_the_queue() {
        let err = BunnyError::SubscriptionBlocked("orders".into());
        assert_eq!(err.to_string(), "subscription blocked for queue `orders`");
    }
}
