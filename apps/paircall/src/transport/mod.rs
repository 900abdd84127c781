use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::LocalMedia;
use crate::protocol::{IceCandidateBlob, SessionDescription};

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("timed out")]
    Timeout,
}

/// Connectivity as reported by the underlying peer connection. Degradation
/// is informational only; it never tears the session down by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected)
    }

    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

/// Events the transport pushes back into the engine's inbox.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A locally discovered network path option to forward to the peer.
    LocalCandidate(IceCandidateBlob),
    /// Connectivity state change.
    Connectivity(ConnectivityState),
}

/// Capability interface over one peer connection. One instance per room;
/// media senders are rebuilt with every new instance, never reused.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Discards a local offer that has not been answered yet (glare loser).
    async fn rollback_local_description(&self) -> Result<(), TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), TransportError>;

    fn connectivity(&self) -> ConnectivityState;

    /// Whether remote media tracks have reached a live readiness state.
    /// Polled by the lifecycle controller's readiness watchdog.
    fn remote_media_live(&self) -> bool;

    /// Stops all sender and receiver tracks and closes the connection.
    /// Must be idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds one transport per matched room with the local media attached.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
