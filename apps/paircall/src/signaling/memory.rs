//! In-memory signaling channel for tests and local simulations.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{SignalingChannel, SignalingError};
use crate::protocol::{ClientMessage, ServerMessage};

pub struct MemorySignaling {
    to_relay: mpsc::UnboundedSender<ClientMessage>,
    from_relay: AsyncMutex<mpsc::UnboundedReceiver<ServerMessage>>,
    closed: AtomicBool,
}

/// The relay-side ends of a [`MemorySignaling`] channel.
pub struct RelayEnd {
    pub from_client: mpsc::UnboundedReceiver<ClientMessage>,
    pub to_client: mpsc::UnboundedSender<ServerMessage>,
}

impl RelayEnd {
    /// Drains everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.from_client.try_recv() {
            out.push(message);
        }
        out
    }
}

pub fn pair() -> (Arc<MemorySignaling>, RelayEnd) {
    let (to_relay, from_client) = mpsc::unbounded_channel();
    let (to_client, from_relay) = mpsc::unbounded_channel();
    (
        Arc::new(MemorySignaling {
            to_relay,
            from_relay: AsyncMutex::new(from_relay),
            closed: AtomicBool::new(false),
        }),
        RelayEnd {
            from_client,
            to_client,
        },
    )
}

impl MemorySignaling {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::ChannelClosed);
        }
        self.to_relay
            .send(message)
            .map_err(|_| SignalingError::ChannelClosed)
    }

    async fn recv(&self) -> Option<ServerMessage> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.from_relay.lock().await;
        rx.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
