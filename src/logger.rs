// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! The orchestrator reports through a [`Logger`]. The default
//! [`TracingLogger`] forwards to `tracing` and re-emits every entry as a
//! [`LogEvent`]; [`CallbackLogger`] adapts caller-supplied per-level
//! callbacks and refuses a set that misses a required level.

use crate::{
    errors::{BunnyError, Result},
    events::Emitter,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Levels a custom logger must provide.
pub const REQUIRED_LEVELS: [Level; 5] = [
    Level::Debug,
    Level::Info,
    Level::Warn,
    Level::Error,
    Level::Fatal,
];

/// A log entry re-emitted by [`TracingLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: Level,
    pub message: String,
}

pub trait Logger: Send + Sync {
    fn trace(&self, message: &str) {
        self.debug(message)
    }

    fn debug(&self, message: &str);

    fn info(&self, message: &str);

    fn warn(&self, message: &str);

    fn error(&self, message: &str);

    fn fatal(&self, message: &str);

    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Trace => self.trace(message),
            Level::Debug => self.debug(message),
            Level::Info => self.info(message),
            Level::Warn => self.warn(message),
            Level::Error => self.error(message),
            Level::Fatal => self.fatal(message),
        }
    }
}

/// Default logger: `tracing` output plus observable [`LogEvent`]s.
#[derive(Debug, Default)]
pub struct TracingLogger {
    events: Emitter<LogEvent>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    fn emit(&self, level: Level, message: &str) {
        self.events.emit(LogEvent {
            level,
            message: message.to_owned(),
        });
    }
}

impl Logger for TracingLogger {
    fn trace(&self, message: &str) {
        trace!("{}", message);
        self.emit(Level::Trace, message);
    }

    fn debug(&self, message: &str) {
        debug!("{}", message);
        self.emit(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        info!("{}", message);
        self.emit(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
        self.emit(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        error!("{}", message);
        self.emit(Level::Error, message);
    }

    fn fatal(&self, message: &str) {
        error!(fatal = true, "{}", message);
        self.emit(Level::Fatal, message);
    }
}

/// Replaceable logger shared by the orchestrator and its running consumers.
#[derive(Clone)]
pub struct SharedLogger {
    current: Arc<RwLock<Arc<dyn Logger>>>,
}

impl SharedLogger {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        SharedLogger {
            current: Arc::new(RwLock::new(logger)),
        }
    }

    /// The logger in effect now.
    pub fn get(&self) -> Arc<dyn Logger> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps the logger for every holder of this handle.
    pub fn set(&self, logger: Arc<dyn Logger>) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = logger;
    }
}

/// Callback receiving the message of one level.
pub type LogCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Logger assembled from caller-supplied callbacks.
pub struct CallbackLogger {
    levels: HashMap<Level, LogCallback>,
}

impl CallbackLogger {
    /// Fails with [`BunnyError::IncompatibleLogger`] unless every level in
    /// [`REQUIRED_LEVELS`] has a callback. Trace falls back to debug.
    pub fn from_levels(levels: HashMap<Level, LogCallback>) -> Result<Self> {
        if let Some(missing) = REQUIRED_LEVELS.iter().find(|l| !levels.contains_key(*l)) {
            return Err(BunnyError::IncompatibleLogger(missing.to_string()));
        }
        Ok(CallbackLogger { levels })
    }

    fn call(&self, level: Level, message: &str) {
        if let Some(callback) = self.levels.get(&level) {
            callback(message);
        }
    }
}

impl Logger for CallbackLogger {
    fn trace(&self, message: &str) {
        match self.levels.get(&Level::Trace) {
            Some(callback) => callback(message),
            None => self.call(Level::Debug, message),
        }
    }

    fn debug(&self, message: &str) {
        self.call(Level::Debug, message)
    }

    fn info(&self, message: &str) {
        self.call(Level::Info, message)
    }

    fn warn(&self, message: &str) {
        self.call(Level::Warn, message)
    }

    fn error(&self, message: &str) {
        self.call(Level::Error, message)
    }

    fn fatal(&self, message: &str) {
        self.call(Level::Fatal, message)
    }
}
