//! Cross-context coordination.
//!
//! When the user exits the call UI from one context, every sibling context
//! on the same named channel must run the same teardown-and-close routine.
//! Backed by a process-wide registry of broadcast channels; environments
//! without the primitive fall back to single-context teardown.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

pub const CALL_CHANNEL: &str = "video-call";

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Tear down and close this context.
    Close { from: u64 },
}

static REGISTRY: Lazy<Mutex<HashMap<String, broadcast::Sender<Signal>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct CrossTabCoordinator {
    context_id: u64,
    tx: broadcast::Sender<Signal>,
    rx: broadcast::Receiver<Signal>,
}

impl CrossTabCoordinator {
    /// Joins the named channel. Returns `None` when broadcast coordination
    /// is disabled for this process (`PAIRCALL_NO_BROADCAST`), in which case
    /// callers degrade to single-context teardown.
    pub fn join(channel: &str) -> Option<Self> {
        if std::env::var_os("PAIRCALL_NO_BROADCAST").is_some() {
            return None;
        }
        let tx = {
            let mut registry = REGISTRY.lock();
            registry
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        let rx = tx.subscribe();
        Some(Self {
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
            tx,
            rx,
        })
    }

    /// Publishes the close sentinel to every sibling context.
    pub fn publish_close(&self) {
        // no receivers just means no sibling contexts are open
        let _ = self.tx.send(Signal::Close {
            from: self.context_id,
        });
    }

    /// A send-only handle with the same context identity, for when the
    /// coordinator itself moves into a listener task.
    pub fn publisher(&self) -> CrossTabPublisher {
        CrossTabPublisher {
            context_id: self.context_id,
            tx: self.tx.clone(),
        }
    }

    /// Waits for the next signal from a sibling context. Our own
    /// publications are filtered out; lagged slots are skipped.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            match self.rx.recv().await {
                Ok(Signal::Close { from }) if from == self.context_id => continue,
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Clone)]
pub struct CrossTabPublisher {
    context_id: u64,
    tx: broadcast::Sender<Signal>,
}

impl CrossTabPublisher {
    pub fn publish_close(&self) {
        let _ = self.tx.send(Signal::Close {
            from: self.context_id,
        });
    }
}
