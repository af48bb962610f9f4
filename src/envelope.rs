// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Every message on the wire carries a set of envelope headers: transaction
//! id, route key, creation time, the producing client's version, whether the
//! payload is raw bytes, and the retry bookkeeping added on requeue and
//! dead-lettering. This module encodes payloads, decodes received messages
//! and builds the header set for send, publish, requeue and reject.

use crate::{
    errors::{BunnyError, Result},
    transport::{DeliveryFields, HeaderValue, Headers, Message, MessageProperties},
};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

/// Version stamped on every envelope produced by this client.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Content type of JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of raw byte payloads
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

pub const HEADER_TRANSACTION_ID: &str = "transactionId";
pub const HEADER_IS_BUFFER: &str = "isBuffer";
pub const HEADER_ROUTE_KEY: &str = "routeKey";
pub const HEADER_CREATED_AT: &str = "createdAt";
pub const HEADER_VERSION: &str = "bunnyBus";
pub const HEADER_SOURCE: &str = "source";
pub const HEADER_RETRY_COUNT: &str = "retryCount";
pub const HEADER_REQUEUED_AT: &str = "requeuedAt";
pub const HEADER_ERRORED_AT: &str = "erroredAt";

const TRANSACTION_ID_BYTES: usize = 20;

/// Application payload: raw bytes or a structured JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(Value),
}

impl Payload {
    /// Serializes any value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|err| BunnyError::Serialization(err.to_string()))
    }

    /// Deserializes a JSON payload into `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone())
                .map_err(|err| BunnyError::Serialization(err.to_string())),
            Payload::Bytes(bytes) => serde_json::from_slice(bytes)
                .map_err(|err| BunnyError::Serialization(err.to_string())),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Json(_) => None,
        }
    }

    /// The `event` field of a structured body, if any.
    pub fn event(&self) -> Option<&str> {
        self.as_json()?.get("event")?.as_str()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Converts a payload to wire bytes, reporting whether it was raw bytes.
pub fn encode(payload: &Payload) -> Result<(Vec<u8>, bool)> {
    match payload {
        Payload::Bytes(bytes) => Ok((bytes.clone(), true)),
        Payload::Json(value) => serde_json::to_vec(value)
            .map(|bytes| (bytes, false))
            .map_err(|err| BunnyError::Serialization(err.to_string())),
    }
}

/// Metadata delivered alongside a decoded message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub headers: Headers,
    pub fields: DeliveryFields,
}

impl Metadata {
    pub fn envelope(&self) -> EnvelopeHeaders {
        EnvelopeHeaders::from_headers(&self.headers)
    }
}

/// A received message split into its logical payload and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: Payload,
    pub metadata: Metadata,
}

/// Reconstructs the payload of a received message.
///
/// Missing, empty or unparseable content yields `None`; malformed input is an
/// expected outcome for consumers, not an error.
pub fn decode(raw: &Message) -> Option<Decoded> {
    if raw.content.is_empty() {
        return None;
    }

    let headers = raw.properties.headers.clone();
    let is_buffer = headers
        .get(HEADER_IS_BUFFER)
        .and_then(HeaderValue::as_bool)
        .unwrap_or(false);

    let message = if is_buffer {
        Payload::Bytes(raw.content.clone())
    } else {
        match serde_json::from_slice::<Value>(&raw.content) {
            Ok(value) => Payload::Json(value),
            Err(err) => {
                debug!(error = err.to_string(), "unparseable message content");
                return None;
            }
        }
    };

    Some(Decoded {
        message,
        metadata: Metadata {
            headers,
            fields: raw.fields.clone(),
        },
    })
}

/// Typed view over the envelope headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeHeaders {
    pub transaction_id: Option<String>,
    pub is_buffer: bool,
    pub route_key: Option<String>,
    pub created_at: Option<String>,
    pub version: Option<String>,
    pub source: Option<String>,
    pub retry_count: Option<i64>,
    pub requeued_at: Option<String>,
    pub errored_at: Option<String>,
    /// Headers this client does not interpret, carried through untouched.
    pub extra: Headers,
}

impl EnvelopeHeaders {
    pub fn from_headers(headers: &Headers) -> Self {
        let text = |key: &str| headers.get(key).map(|v| v.to_string());
        let mut extra = headers.clone();
        for key in [
            HEADER_TRANSACTION_ID,
            HEADER_IS_BUFFER,
            HEADER_ROUTE_KEY,
            HEADER_CREATED_AT,
            HEADER_VERSION,
            HEADER_SOURCE,
            HEADER_RETRY_COUNT,
            HEADER_REQUEUED_AT,
            HEADER_ERRORED_AT,
        ] {
            extra.remove(key);
        }

        EnvelopeHeaders {
            transaction_id: text(HEADER_TRANSACTION_ID),
            is_buffer: headers
                .get(HEADER_IS_BUFFER)
                .and_then(HeaderValue::as_bool)
                .unwrap_or(false),
            route_key: text(HEADER_ROUTE_KEY),
            created_at: text(HEADER_CREATED_AT),
            version: text(HEADER_VERSION),
            source: text(HEADER_SOURCE),
            retry_count: headers.get(HEADER_RETRY_COUNT).and_then(HeaderValue::as_int),
            requeued_at: text(HEADER_REQUEUED_AT),
            errored_at: text(HEADER_ERRORED_AT),
            extra,
        }
    }

    /// Wire representation; absent fields are omitted, never sent as null.
    pub fn to_headers(&self) -> Headers {
        let mut headers = self.extra.clone();
        let mut put = |key: &str, value: Option<HeaderValue>| {
            if let Some(value) = value {
                headers.insert(key.to_owned(), value);
            }
        };

        put(HEADER_TRANSACTION_ID, self.transaction_id.clone().map(Into::into));
        put(HEADER_IS_BUFFER, Some(self.is_buffer.into()));
        put(HEADER_ROUTE_KEY, self.route_key.clone().map(Into::into));
        put(HEADER_CREATED_AT, self.created_at.clone().map(Into::into));
        put(HEADER_VERSION, self.version.clone().map(Into::into));
        put(HEADER_SOURCE, self.source.clone().map(Into::into));
        put(HEADER_RETRY_COUNT, self.retry_count.map(Into::into));
        put(HEADER_REQUEUED_AT, self.requeued_at.clone().map(Into::into));
        put(HEADER_ERRORED_AT, self.errored_at.clone().map(Into::into));

        headers
    }
}

/// Inputs to the route key resolution chain, highest precedence first.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteKeySources<'a> {
    /// Key forced by the caller for this single operation.
    pub override_key: Option<&'a str>,
    /// A previously received message being forwarded.
    pub received: Option<&'a Message>,
    /// Key supplied through publish/send options.
    pub option_key: Option<&'a str>,
    /// The outgoing payload.
    pub payload: Option<&'a Payload>,
}

type RouteKeyLink = for<'a, 'b> fn(&'a RouteKeySources<'b>) -> Option<String>;

const ROUTE_KEY_CHAIN: [RouteKeyLink; 5] = [
    from_override,
    from_received_header,
    from_options,
    from_event,
    from_received_fields,
];

fn from_override(s: &RouteKeySources<'_>) -> Option<String> {
    s.override_key.map(str::to_owned)
}

fn from_received_header(s: &RouteKeySources<'_>) -> Option<String> {
    s.received?
        .properties
        .headers
        .get(HEADER_ROUTE_KEY)
        .map(|v| v.to_string())
}

fn from_options(s: &RouteKeySources<'_>) -> Option<String> {
    s.option_key.map(str::to_owned)
}

fn from_event(s: &RouteKeySources<'_>) -> Option<String> {
    s.payload?.event().map(str::to_owned)
}

fn from_received_fields(s: &RouteKeySources<'_>) -> Option<String> {
    Some(s.received?.fields.routing_key.clone())
}

/// First non-empty route key found along the precedence chain.
pub fn resolve_route_key(sources: &RouteKeySources<'_>) -> Option<String> {
    ROUTE_KEY_CHAIN
        .iter()
        .filter_map(|link| link(sources))
        .find(|key| !key.is_empty())
}

/// Fresh 40 character hex transaction id.
pub fn transaction_id() -> String {
    let bytes: [u8; TRANSACTION_ID_BYTES] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Current time in the envelope timestamp format.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Header fields requested for an outgoing envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeDraft {
    pub transaction_id: Option<String>,
    pub created_at: Option<String>,
    pub route_key: Option<String>,
    pub source: Option<String>,
    pub retry_count: Option<i64>,
    pub requeued_at: Option<String>,
    pub errored_at: Option<String>,
    pub extra: Headers,
}

impl EnvelopeDraft {
    /// Draft preserving the identity and bookkeeping of a received envelope.
    pub fn redelivery(received: &EnvelopeHeaders) -> Self {
        EnvelopeDraft {
            transaction_id: received.transaction_id.clone(),
            created_at: received.created_at.clone(),
            route_key: received.route_key.clone(),
            source: received.source.clone(),
            retry_count: received.retry_count,
            requeued_at: received.requeued_at.clone(),
            errored_at: received.errored_at.clone(),
            extra: received.extra.clone(),
        }
    }

    /// Completes the header set for `content`, generating identity fields
    /// that were not carried over.
    pub fn seal(self, content: Vec<u8>, is_buffer: bool) -> Envelope {
        let headers = EnvelopeHeaders {
            transaction_id: Some(self.transaction_id.unwrap_or_else(transaction_id)),
            is_buffer,
            route_key: self.route_key,
            created_at: Some(self.created_at.unwrap_or_else(timestamp)),
            version: Some(VERSION.to_owned()),
            source: self.source,
            retry_count: self.retry_count,
            requeued_at: self.requeued_at,
            errored_at: self.errored_at,
            extra: self.extra,
        };

        Envelope { content, headers }
    }
}

/// Encoded content plus its header set, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub content: Vec<u8>,
    pub headers: EnvelopeHeaders,
}

impl Envelope {
    pub fn properties(&self) -> MessageProperties {
        MessageProperties {
            headers: self.headers.to_headers(),
            content_type: Some(
                if self.headers.is_buffer {
                    BINARY_CONTENT_TYPE
                } else {
                    JSON_CONTENT_TYPE
                }
                .to_owned(),
            ),
            message_id: self.headers.transaction_id.clone(),
            persistent: true,
        }
    }
}

/// Checks a received envelope before it reaches a handler.
///
/// `publisher` requires the identity headers every BunnyBus producer stamps;
/// `version` additionally requires the producer's major version to match ours.
pub fn validate(headers: &EnvelopeHeaders, publisher: bool, version: bool) -> Result<()> {
    if publisher {
        if headers.transaction_id.is_none() {
            return Err(BunnyError::NoHeaderField(HEADER_TRANSACTION_ID.to_owned()));
        }
        if headers.created_at.is_none() {
            return Err(BunnyError::NoHeaderField(HEADER_CREATED_AT.to_owned()));
        }
        if headers.version.is_none() {
            return Err(BunnyError::NoHeaderField(HEADER_VERSION.to_owned()));
        }
    }

    if version {
        let Some(stamp) = headers.version.as_deref() else {
            return Err(BunnyError::NoHeaderField(HEADER_VERSION.to_owned()));
        };
        if major(stamp) != major(VERSION) {
            return Err(BunnyError::IncompatibleVersion(stamp.to_owned()));
        }
    }

    Ok(())
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or_default()
}
