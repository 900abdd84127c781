//! End-to-end lifecycle tests: a controller driven through an in-memory
//! relay and scriptable transports, asserting on the wire traffic and the
//! UI event stream.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use paircall_core::media::{MediaSource, StaticMediaSource};
use paircall_core::protocol::{
    ClientMessage, IceCandidateBlob, ServerMessage, SessionDescription,
};
use paircall_core::session::{
    ControllerConfig, ControllerHandle, EngineEvent, SessionController, UiEvent, UserCommand,
};
use paircall_core::signaling::memory::{self, MemorySignaling, RelayEnd};
use paircall_core::transport::mock::{MockOp, MockTransportFactory};

struct Harness {
    handle: ControllerHandle,
    ui: mpsc::UnboundedReceiver<UiEvent>,
    relay: RelayEnd,
    factory: Arc<MockTransportFactory>,
    media: Arc<StaticMediaSource>,
    signaling: Arc<MemorySignaling>,
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        // timers are injected by hand in these tests
        readiness_poll_interval: Duration::from_secs(3600),
        relay_hint_delay: Duration::from_secs(3600),
        ..ControllerConfig::default()
    }
}

fn spawn_controller(config: ControllerConfig) -> Harness {
    let (signaling, relay) = memory::pair();
    let factory = Arc::new(MockTransportFactory::new());
    let media = Arc::new(StaticMediaSource::new(true));
    let (controller, handle, ui) = SessionController::new(
        config,
        Arc::clone(&signaling) as _,
        Arc::clone(&factory) as _,
        Arc::clone(&media) as _,
        None,
    );
    tokio::spawn(controller.run());
    Harness {
        handle,
        ui,
        relay,
        factory,
        media,
        signaling,
    }
}

impl Harness {
    fn send(&self, message: ServerMessage) {
        self.relay.to_client.send(message).unwrap();
    }

    async fn next_client(&mut self) -> ClientMessage {
        timeout(Duration::from_secs(2), self.relay.from_client.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("client channel closed")
    }

    async fn await_ui(&mut self, pred: impl Fn(&UiEvent) -> bool) -> UiEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                match self.ui.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("ui channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for ui event")
    }

    async fn drain_client(&mut self) -> Vec<ClientMessage> {
        sleep(Duration::from_millis(50)).await;
        self.relay.drain()
    }

    /// Registers an identity and delivers a match, waiting until the
    /// controller has built the transport.
    async fn match_into_room(&mut self, local_id: &str, peer_id: &str, partner: Option<&str>) {
        self.send(ServerMessage::Hello {
            user_id: local_id.to_string(),
        });
        self.send(ServerMessage::Matched {
            room_id: "room-1".to_string(),
            peer_id: peer_id.to_string(),
            partner_username: partner.map(str::to_string),
        });
        self.await_ui(|e| matches!(e, UiEvent::Matched { .. })).await;
    }
}

fn offer(sdp: &str) -> ServerMessage {
    ServerMessage::RtcOffer {
        data: SessionDescription::offer(sdp),
    }
}

fn answer(sdp: &str) -> ServerMessage {
    ServerMessage::RtcAnswer {
        data: SessionDescription::answer(sdp),
    }
}

fn ice(candidate: &str) -> ServerMessage {
    ServerMessage::RtcIce {
        data: IceCandidateBlob {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        },
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn queue_status_messages_translate_to_ui_events() {
    let mut h = spawn_controller(test_config());
    h.handle.command(UserCommand::JoinQueue);
    assert!(matches!(h.next_client().await, ClientMessage::JoinQueue {}));

    h.send(ServerMessage::Enqueued {
        queue_size: Some(3),
    });
    let event = h.await_ui(|e| matches!(e, UiEvent::Queued { .. })).await;
    assert_eq!(
        event,
        UiEvent::Queued {
            queue_size: Some(3)
        }
    );

    h.send(ServerMessage::QueueUpdate {
        queue_size: Some(2),
    });
    let event = h
        .await_ui(|e| matches!(e, UiEvent::QueueUpdated { .. }))
        .await;
    assert_eq!(
        event,
        UiEvent::QueueUpdated {
            queue_size: Some(2)
        }
    );

    h.send(ServerMessage::Dequeued {});
    h.await_ui(|e| matches!(e, UiEvent::Dequeued)).await;

    // dequeued dropped us back to idle, so joining again goes on the wire
    h.handle.command(UserCommand::JoinQueue);
    assert!(matches!(h.next_client().await, ClientMessage::JoinQueue {}));
}

#[tokio::test]
async fn lower_id_initiates_the_offer() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;

    let message = h.next_client().await;
    assert!(
        matches!(&message, ClientMessage::RtcOffer { room_id, .. } if room_id == "room-1"),
        "expected offer, got {message:?}"
    );
}

#[tokio::test]
async fn higher_id_waits_and_answers_the_remote_offer() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("b2", "a1", None).await;

    assert!(
        !h.drain_client()
            .await
            .iter()
            .any(|m| matches!(m, ClientMessage::RtcOffer { .. })),
        "non-initiator must not offer"
    );

    h.send(offer("v=0 theirs"));
    let message = h.next_client().await;
    assert!(matches!(message, ClientMessage::RtcAnswer { .. }));
    assert!(!h.factory.last().unwrap().rolled_back());
}

#[tokio::test]
async fn glare_rolls_back_local_offer_and_answers() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;
    // our offer goes out first
    assert!(matches!(
        h.next_client().await,
        ClientMessage::RtcOffer { .. }
    ));

    // the peer offered simultaneously; theirs wins
    h.send(offer("v=0 theirs"));
    let message = h.next_client().await;
    assert!(matches!(message, ClientMessage::RtcAnswer { .. }));
    assert!(h.factory.last().unwrap().rolled_back());
}

#[tokio::test]
async fn early_candidates_apply_in_order_after_the_answer() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;
    h.next_client().await; // our offer

    h.send(ice("c1"));
    h.send(ice("c2"));
    sleep(Duration::from_millis(50)).await;
    let mock = h.factory.last().unwrap();
    assert!(mock.applied_candidates().is_empty());

    h.send(answer("v=0 theirs"));
    eventually(|| mock.applied_candidates() == vec!["c1", "c2"]).await;

    h.send(ice("c3"));
    eventually(|| mock.applied_candidates() == vec!["c1", "c2", "c3"]).await;
}

#[tokio::test]
async fn stale_answer_is_ignored() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("b2", "a1", None).await;

    h.send(answer("v=0 stale"));
    sleep(Duration::from_millis(50)).await;
    let mock = h.factory.last().unwrap();
    assert!(
        !mock
            .ops()
            .iter()
            .any(|op| matches!(op, MockOp::SetRemote(_)))
    );
}

#[tokio::test]
async fn readiness_tick_promotes_the_call_to_live() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;

    let mock = h.factory.last().unwrap();
    mock.set_remote_live(true);
    h.handle.inject(EngineEvent::ReadinessTick);

    h.await_ui(|e| matches!(e, UiEvent::RemoteWaiting(false))).await;
    h.await_ui(|e| matches!(e, UiEvent::CallLive)).await;
}

#[tokio::test]
async fn watchdog_gives_up_silently_without_remote_media() {
    let mut h = spawn_controller(ControllerConfig {
        readiness_max_attempts: 3,
        ..test_config()
    });
    h.match_into_room("a1", "b2", None).await;

    for _ in 0..5 {
        h.handle.inject(EngineEvent::ReadinessTick);
    }
    sleep(Duration::from_millis(100)).await;
    while let Ok(event) = h.ui.try_recv() {
        assert!(!matches!(event, UiEvent::CallLive), "call must not go live");
    }
}

#[tokio::test]
async fn peer_hangup_requeues_and_keeps_local_media() {
    let mut h = spawn_controller(test_config());
    let local_media = h.media.acquire().await.unwrap();
    h.match_into_room("a1", "b2", None).await;
    h.drain_client().await;

    h.send(ServerMessage::CallEnded {});
    let message = h.next_client().await;
    assert!(matches!(message, ClientMessage::JoinQueue {}));
    h.await_ui(|e| matches!(e, UiEvent::CallEnded { .. })).await;

    assert_eq!(h.factory.last().unwrap().close_count(), 1);
    assert!(local_media.is_live(), "devices stay warm for the next match");

    // the next match builds a brand new transport
    h.send(ServerMessage::Matched {
        room_id: "room-2".to_string(),
        peer_id: "c3".to_string(),
        partner_username: None,
    });
    h.await_ui(|e| matches!(e, UiEvent::Matched { .. })).await;
    assert_eq!(h.factory.created().len(), 2);
}

#[tokio::test]
async fn peer_hangup_without_auto_requeue_goes_idle() {
    let mut h = spawn_controller(ControllerConfig {
        auto_requeue: false,
        ..test_config()
    });
    h.match_into_room("a1", "b2", None).await;
    h.drain_client().await;

    h.send(ServerMessage::CallEnded {});
    h.await_ui(|e| matches!(e, UiEvent::CallEnded { .. })).await;
    assert!(
        !h.drain_client()
            .await
            .iter()
            .any(|m| matches!(m, ClientMessage::JoinQueue {}))
    );
}

#[tokio::test]
async fn local_hangup_notifies_relay_and_stops_media() {
    let mut h = spawn_controller(test_config());
    let local_media = h.media.acquire().await.unwrap();
    h.match_into_room("a1", "b2", Some("bob")).await;
    h.drain_client().await;

    h.handle.command(UserCommand::Hangup);
    let first = h.next_client().await;
    assert!(
        matches!(&first, ClientMessage::EndCall { room_id } if room_id == "room-1"),
        "expected endCall, got {first:?}"
    );
    assert!(matches!(h.next_client().await, ClientMessage::LeaveQueue {}));

    let event = h
        .await_ui(|e| matches!(e, UiEvent::FeedbackRequested { .. }))
        .await;
    assert_eq!(
        event,
        UiEvent::FeedbackRequested {
            partner: "bob".into()
        }
    );
    eventually(|| !local_media.is_live()).await;
}

#[tokio::test]
async fn rating_is_submitted_exactly_once() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", Some("bob")).await;
    h.drain_client().await;

    h.send(ServerMessage::CallEnded {});
    h.await_ui(|e| matches!(e, UiEvent::FeedbackRequested { .. }))
        .await;
    h.drain_client().await; // auto re-queue join

    h.handle.command(UserCommand::SubmitRating(5));
    let message = h.next_client().await;
    match message {
        ClientMessage::SubmitRating {
            partner_username,
            rating,
            service_type,
        } => {
            assert_eq!(partner_username, "bob");
            assert_eq!(rating, 5);
            assert_eq!(service_type, "video");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    // a second submission has nothing left to rate
    h.handle.command(UserCommand::SubmitRating(1));
    assert!(h.drain_client().await.is_empty());
}

#[tokio::test]
async fn skipping_feedback_discards_the_pending_rating() {
    let mut h = spawn_controller(ControllerConfig {
        auto_requeue: false,
        ..test_config()
    });
    h.match_into_room("a1", "b2", Some("bob")).await;
    h.drain_client().await;

    h.send(ServerMessage::CallEnded {});
    h.await_ui(|e| matches!(e, UiEvent::FeedbackRequested { .. }))
        .await;

    h.handle.command(UserCommand::SkipRating);
    h.handle.command(UserCommand::SubmitRating(5));
    assert!(h.drain_client().await.is_empty());
}

#[tokio::test]
async fn rtc_messages_without_a_session_are_dropped() {
    let mut h = spawn_controller(test_config());
    h.send(offer("v=0 early"));
    h.send(ice("early"));
    assert!(h.drain_client().await.is_empty());

    // the controller is still healthy afterwards
    h.match_into_room("a1", "b2", None).await;
    assert!(matches!(
        h.next_client().await,
        ClientMessage::RtcOffer { .. }
    ));
}

#[tokio::test]
async fn relay_hint_fires_only_without_fallback_credentials() {
    let mut h = spawn_controller(ControllerConfig {
        relay_hint_delay: Duration::from_millis(20),
        ..test_config()
    });
    h.match_into_room("a1", "b2", None).await;
    h.await_ui(|e| matches!(e, UiEvent::RelayFallbackHint)).await;

    let mut h = spawn_controller(ControllerConfig {
        relay_hint_delay: Duration::from_millis(20),
        has_relay_fallback: true,
        ..test_config()
    });
    h.match_into_room("a1", "b2", None).await;
    sleep(Duration::from_millis(100)).await;
    while let Ok(event) = h.ui.try_recv() {
        assert!(!matches!(event, UiEvent::RelayFallbackHint));
    }
}

#[tokio::test]
async fn media_failure_blocks_matchmaking() {
    let (signaling, mut relay) = memory::pair();
    let factory = Arc::new(MockTransportFactory::new());
    let media = Arc::new(StaticMediaSource::new(false));
    let (controller, handle, mut ui) =
        SessionController::new(test_config(), signaling, factory, media, None);
    tokio::spawn(controller.run());

    handle.command(UserCommand::JoinQueue);
    let event = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(event @ UiEvent::MediaFailed { .. }) = ui.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(event, UiEvent::MediaFailed { .. }));

    sleep(Duration::from_millis(50)).await;
    assert!(
        !relay
            .drain()
            .iter()
            .any(|m| matches!(m, ClientMessage::JoinQueue {}))
    );
}

#[tokio::test]
async fn device_errors_from_the_media_source_reach_the_ui() {
    use paircall_core::media::{LocalMedia, MediaError, MediaSource};

    struct DeniedMediaSource;

    #[async_trait::async_trait]
    impl MediaSource for DeniedMediaSource {
        async fn acquire(&self) -> Result<LocalMedia, MediaError> {
            Err(MediaError::PermissionDenied)
        }
    }

    let (signaling, mut relay) = memory::pair();
    let factory = Arc::new(MockTransportFactory::new());
    let (controller, handle, mut ui) = SessionController::new(
        test_config(),
        signaling,
        factory,
        Arc::new(DeniedMediaSource),
        None,
    );
    tokio::spawn(controller.run());

    handle.command(UserCommand::JoinQueue);
    let event = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(event @ UiEvent::MediaFailed { .. }) = ui.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    match event {
        UiEvent::MediaFailed { message } => assert!(message.contains("permission")),
        other => panic!("unexpected event: {other:?}"),
    }

    sleep(Duration::from_millis(50)).await;
    assert!(
        !relay
            .drain()
            .iter()
            .any(|m| matches!(m, ClientMessage::JoinQueue {}))
    );
}

#[tokio::test]
async fn leaving_closes_the_signaling_channel() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;
    h.drain_client().await;

    h.handle.command(UserCommand::LeavePage);
    assert!(
        matches!(&h.next_client().await, ClientMessage::EndCall { room_id } if room_id == "room-1")
    );
    eventually(|| h.signaling.is_closed()).await;
}

#[tokio::test]
async fn leaving_one_context_closes_its_siblings() {
    use paircall_core::broadcast::CrossTabCoordinator;

    let channel = format!("flow-{}", uuid::Uuid::new_v4());
    let spawn_with_coordinator = |coordinator| {
        let (signaling, relay) = memory::pair();
        let factory = Arc::new(MockTransportFactory::new());
        let media = Arc::new(StaticMediaSource::new(true));
        let (controller, handle, ui) = SessionController::new(
            test_config(),
            Arc::clone(&signaling) as _,
            factory,
            media,
            coordinator,
        );
        tokio::spawn(controller.run());
        (handle, ui, relay, signaling)
    };

    let (a_handle, _a_ui, _a_relay, a_signaling) =
        spawn_with_coordinator(CrossTabCoordinator::join(&channel));
    let (_b_handle, _b_ui, _b_relay, b_signaling) =
        spawn_with_coordinator(CrossTabCoordinator::join(&channel));

    a_handle.command(UserCommand::LeavePage);

    eventually(|| a_signaling.is_closed()).await;
    eventually(|| b_signaling.is_closed()).await;
}

#[tokio::test]
async fn local_candidates_are_forwarded_with_the_room_id() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;
    h.drain_client().await;

    let events = h.factory.last_events().unwrap();
    events
        .send(paircall_core::transport::TransportEvent::LocalCandidate(
            IceCandidateBlob {
                candidate: "local-c1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        ))
        .unwrap();

    let message = h.next_client().await;
    match message {
        ClientMessage::RtcIce { room_id, data } => {
            assert_eq!(room_id, "room-1");
            assert_eq!(data.candidate, "local-c1");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn degraded_connectivity_shows_waiting_but_keeps_the_session() {
    let mut h = spawn_controller(test_config());
    h.match_into_room("a1", "b2", None).await;
    h.drain_client().await;
    while h.ui.try_recv().is_ok() {} // discard match-time events

    let events = h.factory.last_events().unwrap();
    events
        .send(paircall_core::transport::TransportEvent::Connectivity(
            paircall_core::transport::ConnectivityState::Disconnected,
        ))
        .unwrap();

    h.await_ui(|e| matches!(e, UiEvent::RemoteWaiting(true))).await;
    assert_eq!(h.factory.last().unwrap().close_count(), 0);
}
