// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! A [`ConnectionContext`] is the stable, named home of one broker
//! connection. The transport handle inside it comes and goes; the context
//! itself is created once per name and handed out by reference, so callers
//! can compare contexts with [`Arc::ptr_eq`].
//!
//! Concurrent [`ConnectionManager::create`] calls for the same name collapse
//! into one connect attempt: the first caller builds while holding the
//! context's build lock, the others wait on it and re-check liveness.
//! A context never reconnects on its own; it only records the close and lets
//! the next caller rebuild.

use crate::{
    errors::{BunnyError, Result},
    events::{Emitter, Lifecycle, LifecycleEvent},
    retry::{exponential_backoff, never, retry, timeout_bound},
    transport::{ConnectionOptions, Connector, TransportConnection},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Name of the connection used by the orchestrator.
pub const DEFAULT_CONNECTION_NAME: &str = "default";

type Hook = Box<dyn FnOnce() + Send>;
type Handle = Option<(u64, Arc<dyn TransportConnection>)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named connection and its lifecycle.
pub struct ConnectionContext {
    name: String,
    options: RwLock<ConnectionOptions>,
    handle: RwLock<Handle>,
    generation: AtomicU64,
    build: tokio::sync::Mutex<()>,
    dependents: Mutex<HashMap<String, Hook>>,
    events: Emitter<LifecycleEvent>,
}

impl ConnectionContext {
    fn new(name: &str, options: ConnectionOptions, events: Emitter<LifecycleEvent>) -> Self {
        ConnectionContext {
            name: name.to_owned(),
            options: RwLock::new(options),
            handle: RwLock::new(None),
            generation: AtomicU64::new(0),
            build: tokio::sync::Mutex::new(()),
            dependents: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The transport handle, only while it is open.
    pub fn connection(&self) -> Option<Arc<dyn TransportConnection>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(_, connection)| connection.is_open())
            .map(|(_, connection)| connection.clone())
    }

    pub fn is_live(&self) -> bool {
        self.connection().is_some()
    }

    /// Runs `hook` once the current handle closes. A later registration under
    /// the same `key` replaces an earlier one; with no live handle the hook
    /// runs immediately.
    pub fn on_close(&self, key: &str, hook: Hook) {
        if !self.is_live() {
            hook();
            return;
        }
        lock(&self.dependents).insert(key.to_owned(), hook);
    }

    fn emit(&self, stage: Lifecycle, reason: Option<String>) {
        self.events
            .emit(LifecycleEvent::new(&self.name, stage).with_reason(reason));
    }

    fn install(&self, generation: u64, connection: Arc<dyn TransportConnection>) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some((generation, connection));
    }

    /// Takes the handle out, but only the given generation when one is named.
    fn take(&self, generation: Option<u64>) -> Option<Arc<dyn TransportConnection>> {
        let mut handle = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        let stale = matches!(
            (handle.as_ref(), generation),
            (Some((current, _)), Some(expected)) if *current != expected
        );
        if stale {
            return None;
        }
        handle.take().map(|(_, connection)| connection)
    }

    fn finish_close(&self, reason: Option<String>) {
        if let Some(reason) = &reason {
            warn!(connection = self.name, reason, "connection closed unexpectedly");
            self.emit(Lifecycle::Error, Some(reason.clone()));
        }
        self.emit(Lifecycle::Closed, reason);

        let hooks: Vec<Hook> = lock(&self.dependents).drain().map(|(_, hook)| hook).collect();
        for hook in hooks {
            hook();
        }
    }

    fn closed_by_transport(&self, generation: u64, reason: Option<String>) {
        if self.take(Some(generation)).is_some() {
            self.finish_close(reason);
        }
    }

    /// Closes the live handle; false when there was nothing to close.
    async fn shutdown(&self) -> Result<bool> {
        if !self.is_live() {
            return Ok(false);
        }
        self.emit(Lifecycle::Closing, None);

        let Some(connection) = self.take(None) else {
            return Ok(false);
        };
        let result = connection.close().await;
        self.finish_close(None);

        result.map(|_| true).map_err(|err| {
            error!(error = err.to_string(), connection = self.name, "failure to close connection");
            BunnyError::from(err)
        })
    }
}

/// Registry of named connections.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    contexts: Mutex<HashMap<String, Arc<ConnectionContext>>>,
    events: Emitter<LifecycleEvent>,
    timeout: Duration,
    max_attempts: usize,
}

impl ConnectionManager {
    /// Each connect attempt is bounded by `timeout`; a build gives up after
    /// `max_attempts` attempts spaced by exponential backoff.
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration, max_attempts: usize) -> Self {
        ConnectionManager {
            connector,
            contexts: Mutex::new(HashMap::new()),
            events: Emitter::default(),
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn context(&self, name: &str, options: &ConnectionOptions) -> Arc<ConnectionContext> {
        lock(&self.contexts)
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(ConnectionContext::new(
                    name,
                    options.clone(),
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Returns the live context for `name`, connecting first if needed.
    pub async fn create(&self, name: &str, options: ConnectionOptions) -> Result<Arc<ConnectionContext>> {
        let context = self.context(name, &options);
        if context.is_live() {
            return Ok(context);
        }

        let builder = context.clone();
        let _build = builder.build.lock().await;
        if context.is_live() {
            trace!(connection = name, "connection built by a concurrent caller");
            return Ok(context);
        }

        *context.options.write().unwrap_or_else(PoisonError::into_inner) = options.clone();
        context.emit(Lifecycle::Connecting, None);
        debug!(connection = name, "creating amqp connection...");

        let connector = &self.connector;
        let options = &options;
        let timeout = self.timeout;
        let connection = retry(
            |_| {
                timeout_bound(
                    async move { connector.connect(options).await.map_err(BunnyError::from) },
                    timeout,
                )
            },
            exponential_backoff,
            self.max_attempts,
            never,
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), connection = name, "failure to connect");
            context.emit(Lifecycle::Error, Some(err.to_string()));
            BunnyError::NoConnection
        })?;

        let generation = context.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(&context);
        connection.on_close(Box::new(move |reason| {
            if let Some(context) = weak.upgrade() {
                context.closed_by_transport(generation, reason);
            }
        }));
        context.install(generation, connection);

        context.emit(Lifecycle::Connected, None);
        info!(connection = name, "amqp connected");
        Ok(context)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionContext>> {
        lock(&self.contexts).get(name).cloned()
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.get(name).is_some_and(|context| context.is_live())
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.contexts).keys().cloned().collect()
    }

    /// Closes the connection of `name`, keeping its context.
    pub async fn close(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(context) => context.shutdown().await,
            None => Ok(false),
        }
    }

    /// Closes the connection of `name` and forgets its context.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let Some(context) = lock(&self.contexts).remove(name) else {
            return Ok(false);
        };
        context.shutdown().await?;
        Ok(true)
    }
}
