// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Named [`ChannelContext`]s multiplexed over a [`ConnectionContext`]. Like
//! connections, a channel context is stable per name and only its transport
//! handle is rebuilt. A channel cannot outlive its connection: when the
//! owning connection closes, every channel built on it is invalidated right
//! away, without waiting for a channel level close event.

use crate::{
    connection::ConnectionContext,
    errors::{BunnyError, Result},
    events::{Emitter, Lifecycle, LifecycleEvent},
    retry::timeout_bound,
    transport::TransportChannel,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

/// Channel used for publish, send and get.
pub const DEFAULT_CHANNEL_NAME: &str = "default";
/// Channel reserved for passive existence checks.
pub const MANAGEMENT_CHANNEL_NAME: &str = "management";

const LISTEN_CHANNEL_PREFIX: &str = "listen-channel-";

/// Name of the channel consuming `queue`.
pub fn listen_channel_name(queue: &str) -> String {
    format!("{LISTEN_CHANNEL_PREFIX}{queue}")
}

/// Options applied whenever a channel is (re)built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Unacknowledged deliveries allowed in flight; zero leaves the broker default.
    pub prefetch: u16,
}

type Handle = Option<(u64, Arc<dyn TransportChannel>)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named channel and its lifecycle.
pub struct ChannelContext {
    name: String,
    connection: RwLock<Weak<ConnectionContext>>,
    options: RwLock<ChannelOptions>,
    handle: RwLock<Handle>,
    generation: AtomicU64,
    build: tokio::sync::Mutex<()>,
    events: Emitter<LifecycleEvent>,
}

impl ChannelContext {
    fn new(name: &str, options: ChannelOptions, events: Emitter<LifecycleEvent>) -> Self {
        ChannelContext {
            name: name.to_owned(),
            connection: RwLock::new(Weak::new()),
            options: RwLock::new(options),
            handle: RwLock::new(None),
            generation: AtomicU64::new(0),
            build: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> ChannelOptions {
        *self.options.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The connection context this channel was last built on.
    pub fn connection(&self) -> Option<Arc<ConnectionContext>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// The transport handle, only while both it and its connection are open.
    pub fn channel(&self) -> Option<Arc<dyn TransportChannel>> {
        if !self.connection().is_some_and(|c| c.is_live()) {
            return None;
        }

        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(_, channel)| channel.is_open())
            .map(|(_, channel)| channel.clone())
    }

    pub fn is_live(&self) -> bool {
        self.channel().is_some()
    }

    fn is_bound_to(&self, connection: &Arc<ConnectionContext>) -> bool {
        self.connection().is_some_and(|c| Arc::ptr_eq(&c, connection))
    }

    fn emit(&self, stage: Lifecycle, reason: Option<String>) {
        self.events
            .emit(LifecycleEvent::new(&self.name, stage).with_reason(reason));
    }

    fn take(&self, generation: Option<u64>) -> Option<Arc<dyn TransportChannel>> {
        let mut handle = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        let stale = matches!(
            (handle.as_ref(), generation),
            (Some((current, _)), Some(expected)) if *current != expected
        );
        if stale {
            return None;
        }
        handle.take().map(|(_, channel)| channel)
    }

    /// Clears the handle of `generation` and reports the close once.
    fn invalidate(&self, generation: u64, reason: Option<String>) {
        if self.take(Some(generation)).is_none() {
            return;
        }

        if let Some(reason) = &reason {
            warn!(channel = self.name, reason, "channel closed");
            self.emit(Lifecycle::Error, Some(reason.clone()));
        } else {
            debug!(channel = self.name, "channel invalidated");
        }
        self.emit(Lifecycle::Closed, reason);
    }

    async fn shutdown(&self) -> Result<bool> {
        if self.handle.read().unwrap_or_else(PoisonError::into_inner).is_none() {
            return Ok(false);
        }
        self.emit(Lifecycle::Closing, None);

        let Some(channel) = self.take(None) else {
            return Ok(false);
        };
        let result = if channel.is_open() {
            channel.close().await
        } else {
            Ok(())
        };
        self.emit(Lifecycle::Closed, None);

        result.map(|_| true).map_err(|err| {
            error!(error = err.to_string(), channel = self.name, "failure to close channel");
            BunnyError::from(err)
        })
    }
}

/// Registry of named channels.
pub struct ChannelManager {
    contexts: Mutex<HashMap<String, Arc<ChannelContext>>>,
    events: Emitter<LifecycleEvent>,
    timeout: Duration,
}

impl ChannelManager {
    /// Channel opening and prefetch negotiation are each bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        ChannelManager {
            contexts: Mutex::new(HashMap::new()),
            events: Emitter::default(),
            timeout,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn context(&self, name: &str, options: ChannelOptions) -> Arc<ChannelContext> {
        lock(&self.contexts)
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(ChannelContext::new(name, options, self.events.clone())))
            .clone()
    }

    /// Returns the live context for `name` on `connection`, opening a channel
    /// first if needed.
    ///
    /// Concurrent callers for the same name share one build.
    ///
    /// # Parameters
    /// * `name` - The channel name
    /// * `connection` - Connection the channel is opened on
    /// * `options` - Prefetch applied to a newly opened channel
    ///
    /// # Returns
    /// The channel context, [`BunnyError::NoConnection`] when the connection
    /// is not live, or [`BunnyError::NoChannel`] when opening fails or times out
    pub async fn create(
        &self,
        name: &str,
        connection: &Arc<ConnectionContext>,
        options: ChannelOptions,
    ) -> Result<Arc<ChannelContext>> {
        let context = self.context(name, options);
        if context.is_bound_to(connection) && context.is_live() {
            return Ok(context);
        }

        let builder = context.clone();
        let _build = builder.build.lock().await;
        if context.is_bound_to(connection) && context.is_live() {
            trace!(channel = name, "channel built by a concurrent caller");
            return Ok(context);
        }

        let Some(transport) = connection.connection() else {
            error!(channel = name, connection = connection.name(), "connection not available");
            return Err(BunnyError::NoConnection);
        };

        *context.connection.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(connection);
        *context.options.write().unwrap_or_else(PoisonError::into_inner) = options;

        debug!(channel = name, "creating amqp channel...");
        let channel = timeout_bound(
            async { transport.create_channel().await.map_err(BunnyError::from) },
            self.timeout,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), channel = name, "error to create the channel");
            context.emit(Lifecycle::Error, Some(err.to_string()));
            BunnyError::NoChannel
        })?;

        if options.prefetch > 0 {
            timeout_bound(
                async { channel.prefetch(options.prefetch).await.map_err(BunnyError::from) },
                self.timeout,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), channel = name, "error to apply prefetch");
                context.emit(Lifecycle::Error, Some(err.to_string()));
                BunnyError::NoChannel
            })?;
        }

        let generation = context.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let weak = Arc::downgrade(&context);
        channel.on_close(Box::new(move |reason| {
            if let Some(context) = weak.upgrade() {
                context.invalidate(generation, reason);
            }
        }));

        let weak = Arc::downgrade(&context);
        connection.on_close(
            &format!("channel:{name}"),
            Box::new(move || {
                if let Some(context) = weak.upgrade() {
                    context.invalidate(generation, None);
                }
            }),
        );

        *context.handle.write().unwrap_or_else(PoisonError::into_inner) = Some((generation, channel));
        debug!(channel = name, "channel created");
        Ok(context)
    }

    /// Context registered under `name`, live or not.
    pub fn get(&self, name: &str) -> Option<Arc<ChannelContext>> {
        lock(&self.contexts).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.contexts).keys().cloned().collect()
    }

    /// Closes the channel of `name`, keeping its context.
    ///
    /// # Returns
    /// `false` when no channel of that name was ever created
    pub async fn close(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(context) => context.shutdown().await,
            None => Ok(false),
        }
    }

    /// Closes the channel of `name` and forgets its context.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let Some(context) = lock(&self.contexts).remove(name) else {
            return Ok(false);
        };
        context.shutdown().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connection::ConnectionManager, memory::MemoryBroker, transport::ConnectionOptions};

    const TIMEOUT: Duration = Duration::from_millis(500);

    async fn setup() -> (MemoryBroker, ConnectionManager, Arc<ConnectionContext>) {
        let broker = MemoryBroker::new();
        let connections = ConnectionManager::new(Arc::new(broker.clone()), TIMEOUT, 1);
        let connection = connections
            .create("c", ConnectionOptions::default())
            .await
            .unwrap();
        (broker, connections, connection)
    }

    #[test]
    fn listen_channels_are_named_after_the_queue() {
        assert_eq!(listen_channel_name("orders"), "listen-channel-orders");
    }

    #[tokio::test]
    async fn concurrent_and_sequential_builds_share_the_context() {
        let (_broker, _connections, connection) = setup().await;
        let channels = ChannelManager::new(TIMEOUT);
        let options = ChannelOptions { prefetch: 5 };

        let (a, b) = tokio::join!(
            channels.create("ch", &connection, options),
            channels.create("ch", &connection, options),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let c = channels.create("ch", &connection, options).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        let (ha, hc) = (a.channel().unwrap(), c.channel().unwrap());
        assert!(Arc::ptr_eq(&ha, &hc));
        assert_eq!(a.options().prefetch, 5);
    }

    #[tokio::test]
    async fn connection_loss_invalidates_channels() {
        let (broker, connections, connection) = setup().await;
        let channels = ChannelManager::new(TIMEOUT);
        let context = channels
            .create("ch", &connection, ChannelOptions::default())
            .await
            .unwrap();
        let mut events = channels.events();

        broker.drop_connections();

        assert!(!context.is_live());
        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            if event.stage == Lifecycle::Closed {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);

        let err = channels
            .create("ch", &connection, ChannelOptions::default())
            .await
            .err();
        assert_eq!(err, Some(BunnyError::NoConnection));

        let connection = connections
            .create("c", ConnectionOptions::default())
            .await
            .unwrap();
        let rebuilt = channels
            .create("ch", &connection, ChannelOptions::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&context, &rebuilt));
        assert!(rebuilt.is_live());
    }

    #[tokio::test]
    async fn channel_level_close_is_rebuilt_on_demand() {
        let (_broker, _connections, connection) = setup().await;
        let channels = ChannelManager::new(TIMEOUT);
        let context = channels
            .create(MANAGEMENT_CHANNEL_NAME, &connection, ChannelOptions::default())
            .await
            .unwrap();

        let first = context.channel().unwrap();
        assert!(first.check_queue("missing").await.is_err());
        assert!(!context.is_live());
        assert!(connection.is_live());

        let rebuilt = channels
            .create(MANAGEMENT_CHANNEL_NAME, &connection, ChannelOptions::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&context, &rebuilt));
        assert!(!Arc::ptr_eq(&first, &rebuilt.channel().unwrap()));
    }

    #[tokio::test]
    async fn close_and_remove() {
        let (_broker, _connections, connection) = setup().await;
        let channels = ChannelManager::new(TIMEOUT);
        channels
            .create("ch", &connection, ChannelOptions::default())
            .await
            .unwrap();

        assert_eq!(channels.close("ch").await, Ok(true));
        assert_eq!(channels.close("ch").await, Ok(false));
        assert!(channels.get("ch").is_some());
        assert_eq!(channels.remove("ch").await, Ok(true));
        assert!(channels.get("ch").is_none());
        assert_eq!(channels.close("ch").await, Ok(false));
    }
}
