// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatchers
//!
//! Strategies deciding how consumer callbacks for a queue are executed:
//!
//! - [`SerialDispatcher`]: one in-flight delegate per key, FIFO. A worker task
//!   is spawned on the first push for a key and exits once that key's buffer
//!   drains, taking its bookkeeping with it.
//! - [`ConcurrentDispatcher`]: every delegate runs immediately, no ordering.

use futures_util::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{error, trace};

/// Unit of work pushed to a dispatcher.
pub type Delegate = BoxFuture<'static, ()>;

/// Executes delegates grouped by key.
pub trait Dispatcher: Send + Sync {
    fn push(&self, key: &str, delegate: Delegate);
}

/// Dispatch strategy selected through configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchType {
    #[default]
    Serial,
    Concurrent,
}

impl DispatchType {
    pub fn dispatcher(self) -> Arc<dyn Dispatcher> {
        match self {
            DispatchType::Serial => Arc::new(SerialDispatcher::new()),
            DispatchType::Concurrent => Arc::new(ConcurrentDispatcher),
        }
    }
}

/// Runs each delegate as soon as it is pushed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcurrentDispatcher;

impl Dispatcher for ConcurrentDispatcher {
    fn push(&self, key: &str, delegate: Delegate) {
        trace!(key, "dispatching concurrently");
        tokio::spawn(delegate);
    }
}

type Buffers = Arc<Mutex<HashMap<String, VecDeque<Delegate>>>>;

/// Runs delegates of the same key one at a time, in push order.
#[derive(Default, Clone)]
pub struct SerialDispatcher {
    buffers: Buffers,
}

impl SerialDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(buffers: &Buffers) -> MutexGuard<'_, HashMap<String, VecDeque<Delegate>>> {
        buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with a live worker.
    pub fn active_keys(&self) -> usize {
        Self::lock(&self.buffers).len()
    }

    /// Delegates buffered for `key`, the running one excluded.
    pub fn pending(&self, key: &str) -> usize {
        Self::lock(&self.buffers).get(key).map_or(0, VecDeque::len)
    }

    async fn drain(buffers: Buffers, key: String) {
        loop {
            let next = {
                let mut guard = Self::lock(&buffers);
                let Some(buffer) = guard.get_mut(&key) else {
                    return;
                };
                match buffer.pop_front() {
                    Some(delegate) => delegate,
                    None => {
                        guard.remove(&key);
                        trace!(key, "serial worker drained");
                        return;
                    }
                }
            };

            if AssertUnwindSafe(next).catch_unwind().await.is_err() {
                error!(key, "dispatched delegate panicked");
            }
        }
    }
}

impl Dispatcher for SerialDispatcher {
    fn push(&self, key: &str, delegate: Delegate) {
        let mut guard = Self::lock(&self.buffers);
        if let Some(buffer) = guard.get_mut(key) {
            buffer.push_back(delegate);
            return;
        }

        guard.insert(key.to_owned(), VecDeque::from([delegate]));
        drop(guard);

        trace!(key, "spawning serial worker");
        tokio::spawn(Self::drain(self.buffers.clone(), key.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::poll_until;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::time::{sleep, Instant};

    #[tokio::test(start_paused = true)]
    async fn serial_runs_one_at_a_time_in_order() {
        let dispatcher = SerialDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for (i, delay) in [30_u64, 20, 10].into_iter().enumerate() {
            let order = order.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            dispatcher.push(
                "q",
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(delay)).await;
                    order.lock().unwrap().push(i);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }

        let watched = dispatcher.clone();
        poll_until(
            move || {
                let idle = watched.active_keys() == 0;
                async move { Ok(idle) }
            },
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn serial_keys_run_independently() {
        let dispatcher = SerialDispatcher::new();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        for key in ["a", "b"] {
            let finished = finished.clone();
            dispatcher.push(
                key,
                Box::pin(async move {
                    sleep(Duration::from_millis(100)).await;
                    finished.lock().unwrap().push(start.elapsed());
                }),
            );
        }
        assert_eq!(dispatcher.active_keys(), 2);

        sleep(Duration::from_millis(150)).await;

        let finished = finished.lock().unwrap();
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|d| *d < Duration::from_millis(150)));
        assert_eq!(dispatcher.active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn serial_survives_panicking_delegate() {
        let dispatcher = SerialDispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));

        dispatcher.push("q", Box::pin(async { panic!("boom") }));
        let counter = ran.clone();
        dispatcher.push(
            "q",
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        sleep(Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending("q"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_overlaps_delegates() {
        let dispatcher = DispatchType::Concurrent.dispatcher();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            dispatcher.push(
                "q",
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }),
            );
        }

        sleep(Duration::from_millis(100)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
