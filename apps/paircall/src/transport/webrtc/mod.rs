//! Production [`PeerTransport`] backed by the `webrtc` crate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{ConnectivityState, PeerTransport, TransportError, TransportEvent, TransportFactory};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidateBlob, SdpKind, SessionDescription};

pub mod config;

pub use config::{IceSettings, RelayCredentials};

const MEDIA_STREAM_ID: &str = "paircall-stream";

fn to_setup_error(err: impl fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error(err: impl fmt::Display) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn description_to_rtc(
    description: &SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => {
            RTCSessionDescription::offer(description.sdp.clone()).map_err(to_negotiation_error)
        }
        SdpKind::Answer => {
            RTCSessionDescription::answer(description.sdp.clone()).map_err(to_negotiation_error)
        }
    }
}

fn description_from_rtc(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, TransportError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::Negotiation(format!(
                "unexpected sdp type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn rollback_description() -> Result<RTCSessionDescription, TransportError> {
    // RTCSessionDescription has no rollback constructor; build it through
    // its serde representation the same way a browser peer would send it.
    serde_json::from_value(serde_json::json!({"type": "rollback", "sdp": ""}))
        .map_err(to_negotiation_error)
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
            ConnectivityState::New
        }
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Vec<Arc<RTCRtpSender>>,
    connectivity: Arc<Mutex<ConnectivityState>>,
    remote_live: Arc<AtomicBool>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_negotiation_error)?;
        description_from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        description_from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = description_to_rtc(&description)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn rollback_local_description(&self) -> Result<(), TransportError> {
        self.pc
            .set_local_description(rollback_description()?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = description_to_rtc(&description)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.lock()
    }

    fn remote_media_live(&self) -> bool {
        self.remote_live.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for sender in &self.senders {
            if let Err(err) = sender.stop().await {
                tracing::debug!(target = "webrtc", error = %err, "sender stop failed");
            }
        }
        for receiver in self.pc.get_receivers().await {
            if let Err(err) = receiver.stop().await {
                tracing::debug!(target = "webrtc", error = %err, "receiver stop failed");
            }
        }
        self.remote_live.store(false, Ordering::SeqCst);
        self.pc.close().await.map_err(to_setup_error)
    }
}

/// Builds one fully wired peer connection per matched room.
pub struct WebRtcTransportFactory {
    ice: IceSettings,
}

impl WebRtcTransportFactory {
    pub fn new(ice: IceSettings) -> Self {
        Self { ice }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        let blob = IceCandidateBlob {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        };
                        let _ = events.send(TransportEvent::LocalCandidate(blob));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let connectivity = Arc::new(Mutex::new(ConnectivityState::New));
        let connectivity_for_state = Arc::clone(&connectivity);
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let connectivity = Arc::clone(&connectivity_for_state);
            let events = state_events.clone();
            Box::pin(async move {
                let mapped = map_connection_state(state);
                tracing::debug!(target = "webrtc", state = ?mapped, "peer connection state changed");
                *connectivity.lock() = mapped;
                let _ = events.send(TransportEvent::Connectivity(mapped));
            })
        }));

        let remote_live = Arc::new(AtomicBool::new(false));
        let remote_live_for_track = Arc::clone(&remote_live);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote_live = Arc::clone(&remote_live_for_track);
            Box::pin(async move {
                tracing::debug!(
                    target = "webrtc",
                    kind = %track.kind(),
                    "remote track arrived"
                );
                remote_live.store(true, Ordering::SeqCst);
            })
        }));

        // Senders are rebuilt per transport; tracks that were stopped while
        // the previous call wound down are simply not offered again.
        let mut senders = Vec::new();
        if media.audio().is_live() {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                MEDIA_STREAM_ID.to_owned(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_setup_error)?;
            senders.push(sender);
        }
        if media.video().is_live() {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                MEDIA_STREAM_ID.to_owned(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_setup_error)?;
            senders.push(sender);
        }

        Ok(Arc::new(WebRtcPeerTransport {
            pc,
            senders,
            connectivity,
            remote_live,
            closed: AtomicBool::new(false),
        }))
    }
}
