//! Call session lifecycle.
//!
//! [`SessionController`] is a single-task actor: every input — relay
//! messages, user commands, transport events, timer expiries, cross-context
//! signals — lands in one ordered inbox and is processed to completion
//! before the next, so negotiation and teardown never race each other.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{CrossTabCoordinator, CrossTabPublisher, Signal};
use crate::media::{LocalMedia, MediaSource};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::signaling::SignalingChannel;
use crate::transport::{ConnectivityState, TransportEvent, TransportFactory};

pub mod feedback;
pub mod negotiation;

use feedback::FeedbackFlow;
use negotiation::Negotiator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Disconnected,
    /// Enqueued, waiting for a match.
    Connecting,
    /// Matched into a room, media not yet flowing.
    Matched,
    /// Remote media is live.
    Live,
    Ended,
}

/// User intents, delivered through the [`ControllerHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    JoinQueue,
    StopMatching,
    Hangup,
    LeavePage,
    ToggleMicrophone,
    ToggleCamera,
    SubmitRating(u8),
    SkipRating,
}

/// Everything the controller reacts to, in one totally ordered stream.
#[derive(Debug)]
pub enum EngineEvent {
    Signal(ServerMessage),
    User(UserCommand),
    Transport(TransportEvent),
    /// Readiness watchdog poll.
    ReadinessTick,
    /// One-shot slow-start timer for the relay-fallback hint.
    RelayHintElapsed,
    /// A sibling context asked us to tear down and close.
    CrossTabClose,
    /// The relay websocket is gone.
    SignalingClosed,
}

/// State changes the embedding UI renders. The controller never renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Registered { user_id: String },
    Queued { queue_size: Option<u32> },
    QueueUpdated { queue_size: Option<u32> },
    Dequeued,
    MatchmakingActive(bool),
    Matched { room_id: String },
    /// Whether the "waiting for peer" indicator should show.
    RemoteWaiting(bool),
    CallLive,
    CallEnded { reason: String },
    MediaFailed { message: String },
    MicrophoneEnabled(bool),
    CameraEnabled(bool),
    /// Connectivity is still not up well after matching; suggest
    /// configuring a relay (TURN) fallback.
    RelayFallbackHint,
    FeedbackRequested { partner: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub username: Option<String>,
    /// Re-enter the queue automatically when the peer ends the call.
    pub auto_requeue: bool,
    /// Whether TURN relay credentials are configured.
    pub has_relay_fallback: bool,
    pub readiness_poll_interval: Duration,
    pub readiness_max_attempts: u32,
    pub relay_hint_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            username: None,
            auto_requeue: true,
            has_relay_fallback: false,
            readiness_poll_interval: Duration::from_millis(300),
            readiness_max_attempts: 40,
            relay_hint_delay: Duration::from_secs(8),
        }
    }
}

/// Clonable sender half for feeding the controller from the outside.
#[derive(Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<EngineEvent>,
}

impl ControllerHandle {
    pub fn command(&self, command: UserCommand) {
        let _ = self.inbox.send(EngineEvent::User(command));
    }

    pub fn inject(&self, event: EngineEvent) {
        let _ = self.inbox.send(event);
    }
}

/// Everything owned by one matched room. Dropped as a unit at teardown, so
/// room id and peer id can never survive independently of each other.
struct ActiveSession {
    peer_id: String,
    negotiator: Negotiator,
    connectivity: ConnectivityState,
    readiness_attempts: u32,
    readiness_task: Option<JoinHandle<()>>,
    hint_task: Option<JoinHandle<()>>,
    event_pump: JoinHandle<()>,
}

impl ActiveSession {
    fn cancel_tasks(&mut self) {
        if let Some(task) = self.readiness_task.take() {
            task.abort();
        }
        if let Some(task) = self.hint_task.take() {
            task.abort();
        }
        self.event_pump.abort();
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Exit,
}

pub struct SessionController {
    config: ControllerConfig,
    signaling: Arc<dyn SignalingChannel>,
    transports: Arc<dyn TransportFactory>,
    media_source: Arc<dyn MediaSource>,
    coordinator: Option<CrossTabCoordinator>,
    tab_publisher: Option<CrossTabPublisher>,
    inbox_tx: mpsc::UnboundedSender<EngineEvent>,
    inbox_rx: mpsc::UnboundedReceiver<EngineEvent>,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
    state: CallState,
    keep_matching: bool,
    local_id: Option<String>,
    local_media: Option<LocalMedia>,
    session: Option<ActiveSession>,
    feedback: FeedbackFlow,
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        signaling: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
        coordinator: Option<CrossTabCoordinator>,
    ) -> (Self, ControllerHandle, mpsc::UnboundedReceiver<UiEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let handle = ControllerHandle {
            inbox: inbox_tx.clone(),
        };
        let tab_publisher = coordinator.as_ref().map(|c| c.publisher());
        let keep_matching = config.auto_requeue;
        let controller = Self {
            config,
            signaling,
            transports,
            media_source,
            coordinator,
            tab_publisher,
            inbox_tx,
            inbox_rx,
            ui_tx,
            state: CallState::Disconnected,
            keep_matching,
            local_id: None,
            local_media: None,
            session: None,
            feedback: FeedbackFlow::default(),
        };
        (controller, handle, ui_rx)
    }

    /// Runs the actor until the user leaves the page, a sibling context
    /// closes us, or the relay goes away.
    pub async fn run(mut self) {
        if let Some(username) = self.config.username.clone() {
            if let Err(err) = self
                .signaling
                .send(ClientMessage::RegisterUsername { username })
            {
                warn!(target = "session", error = %err, "username registration failed");
            }
        }

        let signal_pump = {
            let signaling = Arc::clone(&self.signaling);
            let inbox = self.inbox_tx.clone();
            tokio::spawn(async move {
                loop {
                    match signaling.recv().await {
                        Some(message) => {
                            if inbox.send(EngineEvent::Signal(message)).is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = inbox.send(EngineEvent::SignalingClosed);
                            break;
                        }
                    }
                }
            })
        };

        let tab_listener = self.coordinator.take().map(|mut coordinator| {
            let inbox = self.inbox_tx.clone();
            tokio::spawn(async move {
                while let Some(Signal::Close { .. }) = coordinator.recv().await {
                    if inbox.send(EngineEvent::CrossTabClose).is_err() {
                        break;
                    }
                }
            })
        });

        while let Some(event) = self.inbox_rx.recv().await {
            if self.process(event).await == Flow::Exit {
                break;
            }
        }

        signal_pump.abort();
        if let Some(listener) = tab_listener {
            listener.abort();
        }
    }

    async fn process(&mut self, event: EngineEvent) -> Flow {
        match event {
            EngineEvent::Signal(message) => self.on_signal(message).await,
            EngineEvent::User(command) => return self.on_command(command).await,
            EngineEvent::Transport(event) => self.on_transport(event),
            EngineEvent::ReadinessTick => self.on_readiness_tick(),
            EngineEvent::RelayHintElapsed => self.on_relay_hint(),
            EngineEvent::CrossTabClose => {
                info!(target = "session", "sibling context requested close");
                return self.shutdown("closed from another context", false).await;
            }
            EngineEvent::SignalingClosed => {
                warn!(target = "session", "relay connection lost");
                return self.shutdown("relay disconnected", true).await;
            }
        }
        Flow::Continue
    }

    async fn on_signal(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Hello { user_id } => {
                debug!(target = "session", %user_id, "relay assigned identity");
                self.local_id = Some(user_id.clone());
                self.emit(UiEvent::Registered { user_id });
            }
            ServerMessage::Enqueued { queue_size } => {
                if self.session.is_none() {
                    self.state = CallState::Connecting;
                }
                self.emit(UiEvent::Queued { queue_size });
                self.emit(UiEvent::MatchmakingActive(true));
            }
            ServerMessage::QueueUpdate { queue_size } => {
                self.emit(UiEvent::QueueUpdated { queue_size });
            }
            ServerMessage::Dequeued {} => {
                if self.state == CallState::Connecting {
                    self.state = CallState::Disconnected;
                }
                self.emit(UiEvent::Dequeued);
                self.emit(UiEvent::MatchmakingActive(false));
            }
            ServerMessage::Matched {
                room_id,
                peer_id,
                partner_username,
            } => {
                self.on_matched(room_id, peer_id, partner_username).await;
            }
            ServerMessage::RtcOffer { data } => {
                let Some(session) = self.session.as_mut() else {
                    debug!(target = "session", "dropping offer with no active session");
                    return;
                };
                match session.negotiator.handle_remote_offer(data).await {
                    Ok(()) => self.restart_readiness(),
                    // recoverable: the peer can re-offer
                    Err(err) => {
                        warn!(target = "session", error = %err, "remote offer failed")
                    }
                }
            }
            ServerMessage::RtcAnswer { data } => {
                let Some(session) = self.session.as_mut() else {
                    debug!(target = "session", "dropping answer with no active session");
                    return;
                };
                match session.negotiator.handle_remote_answer(data).await {
                    Ok(true) => self.restart_readiness(),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(target = "session", error = %err, "remote answer failed")
                    }
                }
            }
            ServerMessage::RtcIce { data } => {
                if let Some(session) = self.session.as_mut() {
                    session.negotiator.handle_remote_candidate(data).await;
                } else {
                    debug!(target = "session", "dropping candidate with no active session");
                }
            }
            ServerMessage::CallEnded {} => {
                self.offer_feedback();
                // peer is gone but our devices stay warm for the next match
                self.end_session("peer ended the call", true).await;
                if self.keep_matching {
                    if let Err(err) = self.signaling.send(ClientMessage::JoinQueue {}) {
                        warn!(target = "session", error = %err, "auto re-queue failed");
                        self.state = CallState::Disconnected;
                        return;
                    }
                    self.state = CallState::Connecting;
                    self.emit(UiEvent::MatchmakingActive(true));
                } else {
                    self.state = CallState::Disconnected;
                    self.emit(UiEvent::MatchmakingActive(false));
                }
            }
        }
    }

    async fn on_command(&mut self, command: UserCommand) -> Flow {
        match command {
            UserCommand::JoinQueue => {
                if matches!(
                    self.state,
                    CallState::Connecting | CallState::Matched | CallState::Live
                ) {
                    debug!(target = "session", state = ?self.state, "already matching");
                    return Flow::Continue;
                }
                match self.media_source.acquire().await {
                    Ok(media) => self.local_media = Some(media),
                    Err(err) => {
                        // matchmaking must not start without devices
                        self.emit(UiEvent::MediaFailed {
                            message: err.to_string(),
                        });
                        return Flow::Continue;
                    }
                }
                self.keep_matching = self.config.auto_requeue;
                if self.signaling.send(ClientMessage::JoinQueue {}).is_ok() {
                    self.state = CallState::Connecting;
                    self.emit(UiEvent::MatchmakingActive(true));
                }
            }
            UserCommand::StopMatching => {
                self.keep_matching = false;
                let _ = self.signaling.send(ClientMessage::LeaveQueue {});
                if self.state == CallState::Connecting {
                    self.state = CallState::Disconnected;
                }
                self.emit(UiEvent::MatchmakingActive(false));
            }
            UserCommand::Hangup => {
                self.keep_matching = false;
                if let Some(session) = &self.session {
                    let _ = self.signaling.send(ClientMessage::EndCall {
                        room_id: session.negotiator.room_id().to_string(),
                    });
                }
                let _ = self.signaling.send(ClientMessage::LeaveQueue {});
                self.offer_feedback();
                self.end_session("hung up", false).await;
                self.state = CallState::Disconnected;
                self.emit(UiEvent::MatchmakingActive(false));
            }
            UserCommand::LeavePage => {
                if let Some(publisher) = &self.tab_publisher {
                    publisher.publish_close();
                }
                return self.shutdown("leaving", false).await;
            }
            UserCommand::ToggleMicrophone => {
                if let Some(media) = &self.local_media {
                    let enabled = media.audio().toggle_enabled();
                    self.emit(UiEvent::MicrophoneEnabled(enabled));
                }
            }
            UserCommand::ToggleCamera => {
                if let Some(media) = &self.local_media {
                    let enabled = media.video().toggle_enabled();
                    self.emit(UiEvent::CameraEnabled(enabled));
                }
            }
            UserCommand::SubmitRating(rating) => {
                if let Some(message) = self.feedback.submit(rating) {
                    if let Err(err) = self.signaling.send(message) {
                        warn!(target = "session", error = %err, "rating submission failed");
                    }
                }
            }
            UserCommand::SkipRating => self.feedback.skip(),
        }
        Flow::Continue
    }

    async fn on_matched(
        &mut self,
        room_id: String,
        peer_id: String,
        partner_username: Option<String>,
    ) {
        // a lingering previous session means the relay re-matched us first
        self.end_session("re-matched", true).await;
        self.feedback.arm(partner_username);

        let media = match self.media_source.acquire().await {
            Ok(media) => {
                self.local_media = Some(media.clone());
                media
            }
            Err(err) => {
                warn!(target = "session", error = %err, "media unavailable at match time");
                self.emit(UiEvent::MediaFailed {
                    message: err.to_string(),
                });
                let _ = self.signaling.send(ClientMessage::LeaveQueue {});
                self.state = CallState::Disconnected;
                return;
            }
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let event_pump = {
            let inbox = self.inbox_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if inbox.send(EngineEvent::Transport(event)).is_err() {
                        break;
                    }
                }
            })
        };

        let transport = match self.transports.create(&media, events_tx).await {
            Ok(transport) => transport,
            Err(err) => {
                event_pump.abort();
                warn!(target = "session", error = %err, "transport setup failed");
                self.emit(UiEvent::CallEnded {
                    reason: format!("transport setup failed: {err}"),
                });
                self.state = CallState::Disconnected;
                return;
            }
        };

        let initiator = elect_initiator(self.local_id.as_deref(), &peer_id);
        info!(
            target = "session",
            room_id = %room_id,
            peer_id = %peer_id,
            initiator,
            "matched"
        );

        let negotiator = Negotiator::new(room_id.clone(), transport, Arc::clone(&self.signaling));
        let mut session = ActiveSession {
            peer_id,
            negotiator,
            connectivity: ConnectivityState::New,
            readiness_attempts: 0,
            readiness_task: None,
            hint_task: None,
            event_pump,
        };

        if initiator {
            if let Err(err) = session.negotiator.create_offer().await {
                warn!(target = "session", error = %err, "initial offer failed");
            }
        }

        session.readiness_task = Some(self.spawn_readiness_ticker());
        session.hint_task = Some(self.spawn_hint_timer());
        self.session = Some(session);
        self.state = CallState::Matched;
        self.emit(UiEvent::Matched { room_id });
        self.emit(UiEvent::RemoteWaiting(true));
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let Some(session) = &self.session else {
                    debug!(target = "session", "dropping local candidate after teardown");
                    return;
                };
                let _ = self.signaling.send(ClientMessage::RtcIce {
                    room_id: session.negotiator.room_id().to_string(),
                    data: candidate,
                });
            }
            TransportEvent::Connectivity(state) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.connectivity = state;
                if state.is_connected() {
                    debug!(target = "session", "peer connectivity established");
                } else if state.is_degraded() {
                    // informational only, recovery or teardown comes from
                    // the relay or the user, never from connectivity alone
                    self.emit(UiEvent::RemoteWaiting(true));
                }
            }
        }
    }

    fn on_readiness_tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let live = session
            .negotiator
            .transport()
            .is_some_and(|t| t.remote_media_live());
        if live {
            if let Some(task) = session.readiness_task.take() {
                task.abort();
            }
            self.emit(UiEvent::RemoteWaiting(false));
            if self.state == CallState::Matched {
                self.state = CallState::Live;
                self.emit(UiEvent::CallLive);
            }
            return;
        }
        session.readiness_attempts += 1;
        if session.readiness_attempts >= self.config.readiness_max_attempts {
            // give up silently, the waiting indicator stays up
            if let Some(task) = session.readiness_task.take() {
                task.abort();
            }
            debug!(target = "session", "remote readiness watchdog gave up");
        }
    }

    fn on_relay_hint(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(task) = session.hint_task.take() {
            task.abort();
        }
        if !session.connectivity.is_connected() && !self.config.has_relay_fallback {
            self.emit(UiEvent::RelayFallbackHint);
        }
    }

    /// Resets the readiness watchdog after a (re)negotiation completes.
    fn restart_readiness(&mut self) {
        let ticker = self.spawn_readiness_ticker();
        if let Some(session) = self.session.as_mut() {
            session.readiness_attempts = 0;
            if let Some(task) = session.readiness_task.replace(ticker) {
                task.abort();
            }
        } else {
            ticker.abort();
        }
    }

    fn spawn_readiness_ticker(&self) -> JoinHandle<()> {
        let inbox = self.inbox_tx.clone();
        let interval = self.config.readiness_poll_interval;
        let max_attempts = self.config.readiness_max_attempts;
        tokio::spawn(async move {
            for _ in 0..max_attempts {
                tokio::time::sleep(interval).await;
                if inbox.send(EngineEvent::ReadinessTick).is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_hint_timer(&self) -> JoinHandle<()> {
        let inbox = self.inbox_tx.clone();
        let delay = self.config.relay_hint_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(EngineEvent::RelayHintElapsed);
        })
    }

    fn offer_feedback(&mut self) {
        if let Some(partner) = self.feedback.offer() {
            self.emit(UiEvent::FeedbackRequested { partner });
        }
    }

    /// Tears down the active session, optionally keeping local devices warm
    /// for an immediate re-match. Safe to call with no session.
    async fn end_session(&mut self, reason: &str, keep_local_media: bool) {
        if let Some(mut session) = self.session.take() {
            session.cancel_tasks();
            session.negotiator.teardown_transport().await;
            info!(
                target = "session",
                room_id = %session.negotiator.room_id(),
                peer_id = %session.peer_id,
                reason,
                "session ended"
            );
            self.state = CallState::Ended;
            self.emit(UiEvent::RemoteWaiting(true));
            self.emit(UiEvent::CallEnded {
                reason: reason.to_string(),
            });
        }
        if !keep_local_media {
            if let Some(media) = self.local_media.take() {
                media.stop();
            }
        }
    }

    /// Full release: end the call, leave the queue, close signaling.
    async fn shutdown(&mut self, reason: &str, relay_gone: bool) -> Flow {
        if !relay_gone {
            if let Some(session) = &self.session {
                let _ = self.signaling.send(ClientMessage::EndCall {
                    room_id: session.negotiator.room_id().to_string(),
                });
            }
            if self.state == CallState::Connecting {
                let _ = self.signaling.send(ClientMessage::LeaveQueue {});
            }
        }
        self.end_session(reason, false).await;
        self.state = CallState::Disconnected;
        self.emit(UiEvent::MatchmakingActive(false));
        self.signaling.close().await;
        Flow::Exit
    }

    fn emit(&self, event: UiEvent) {
        // a dropped UI receiver must never stall the engine
        let _ = self.ui_tx.send(event);
    }
}

/// Exactly one side must offer. Lower id wins; if the relay never told us
/// our id, default to offering and let glare resolution sort out the rest.
fn elect_initiator(local_id: Option<&str>, peer_id: &str) -> bool {
    match local_id {
        Some(local) => local < peer_id,
        None => {
            warn!(
                target = "session",
                "no local identity at match time, defaulting to initiator"
            );
            true
        }
    }
}
