//! Key-coalescing debouncer.
//!
//! Callers register `(key, callback)` pairs from any task or thread. Each
//! registration (re)stores the callback under its key and resets a single
//! shared timer. When the window elapses with no further registrations, the
//! whole queue is swapped out atomically and every surviving callback runs
//! once, on the debouncer's own task. Repeated registrations under the same
//! key within one window invoke only the latest callback.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

type Callback = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A debouncer with one fixed window and at most one pending timer.
#[derive(Clone)]
pub struct Debouncer {
    queue: Arc<Mutex<HashMap<String, Callback>>>,
    kick: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    /// Create a debouncer and spawn its processing task. The task exits when
    /// the last `Debouncer` handle is dropped.
    pub fn new(window: Duration) -> Self {
        let queue: Arc<Mutex<HashMap<String, Callback>>> = Arc::new(Mutex::new(HashMap::new()));
        let (kick, kick_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(window, Arc::clone(&queue), kick_rx));

        Self { queue, kick }
    }

    /// Register `callback` under `key`, superseding any earlier registration
    /// for the same key in the current window, and reset the window timer.
    pub fn debounce<F>(&self, key: impl Into<String>, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue.lock().insert(key.into(), Box::pin(callback));
        // Sending never blocks; a closed channel means the process is
        // shutting down and the callback can be dropped with the queue.
        let _ = self.kick.send(());
    }
}

async fn run(
    window: Duration,
    queue: Arc<Mutex<HashMap<String, Callback>>>,
    mut kick_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        match deadline {
            None => match kick_rx.recv().await {
                Some(()) => deadline = Some(Instant::now() + window),
                None => return,
            },
            Some(at) => {
                tokio::select! {
                    kicked = kick_rx.recv() => match kicked {
                        Some(()) => deadline = Some(Instant::now() + window),
                        None => return,
                    },
                    _ = sleep_until(at) => {
                        // Swap the whole map out before invoking anything, so
                        // callbacks registered while draining land in a fresh
                        // queue for the next window instead of being lost.
                        let drained = std::mem::take(&mut *queue.lock());
                        deadline = None;
                        for (_, callback) in drained {
                            callback.await;
                        }
                    }
                }
            }
        }
    }
}
