// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # BunnyBus
//!
//! A publish/subscribe client over AMQP brokers that keeps working across
//! connection and channel loss.
//!
//! ```no_run
//! use bunnybus::{handler, BunnyBus, BunnyConfig, Handlers, Incoming, PublishOptions, SubscribeOptions};
//! use serde_json::json;
//!
//! # async fn run() -> bunnybus::Result<()> {
//! let bus = BunnyBus::new(BunnyConfig::load(None)?);
//!
//! let handlers = Handlers::new().on(
//!     "order.*",
//!     handler(|incoming: Incoming| async move { incoming.ack().await }),
//! );
//! bus.subscribe("orders", handlers, SubscribeOptions::default()).await?;
//!
//! bus.publish(json!({"event": "order.created", "id": 7}), PublishOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Messages travel inside an envelope of headers (`transactionId`,
//! `createdAt`, `routeKey`, `retryCount`, ...) that survives requeueing and
//! dead-lettering, see [`envelope`]. Transports are abstracted by the traits
//! in [`transport`]: [`AmqpConnector`] talks to a real broker through lapin
//! and [`MemoryBroker`] keeps everything in process.

mod consumer;
mod otel;

pub mod amqp;
pub mod bus;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod logger;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod subscription;
pub mod transport;

pub use amqp::AmqpConnector;
pub use bus::{BunnyBus, GetAllOptions, PublishOptions};
pub use config::BunnyConfig;
pub use consumer::Incoming;
pub use dispatcher::DispatchType;
pub use envelope::{Metadata, Payload};
pub use errors::{BunnyError, Result, TransportError};
pub use events::{BusEvent, Lifecycle, LifecycleEvent};
pub use exchange::{ExchangeKind, ExchangeOptions};
pub use logger::{CallbackLogger, Level, Logger, TracingLogger};
pub use memory::MemoryBroker;
pub use queue::QueueOptions;
pub use subscription::{handler, Handler, Handlers, SubscribeOptions};
pub use transport::{HeaderValue, Headers, Message, QueueInfo};
