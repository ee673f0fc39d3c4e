//! Call lifecycle flows over fake media devices and peer connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use wellspring_rtc::call::media::{
    MediaDevices, MediaStream, PeerConnection, PeerConnectionFactory, PeerEvent, TrackKind,
};
use wellspring_rtc::call::{CallEngine, CALL_ANSWER_TIMEOUT};
use wellspring_rtc::error::{EngineError, EngineResult};
use wellspring_rtc::models::CallStatus;
use wellspring_rtc::protocol::{
    ClientEvent, IceCandidateInit, SdpKind, ServerEvent, SessionDescription,
};
use wellspring_rtc::transport::{ConnectionState, EventSink};

struct FakeSink {
    sent: Mutex<Vec<ClientEvent>>,
}

impl FakeSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }
}

impl EventSink for FakeSink {
    fn send(&self, event: ClientEvent) -> EngineResult<()> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

#[derive(Default)]
struct StreamState {
    stops: AtomicUsize,
    video: bool,
}

struct FakeStream(Arc<StreamState>);

impl MediaStream for FakeStream {
    fn set_enabled(&self, _kind: TrackKind, _enabled: bool) {}

    fn stop(&self) {
        self.0.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn has_video(&self) -> bool {
        self.0.video
    }
}

#[derive(Default)]
struct FakeDevices {
    fail: AtomicBool,
    acquired: Mutex<Vec<Arc<StreamState>>>,
}

#[async_trait::async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, _audio: bool, video: bool) -> EngineResult<Box<dyn MediaStream>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Media("camera unavailable".into()));
        }
        let state = Arc::new(StreamState {
            stops: AtomicUsize::new(0),
            video,
        });
        self.acquired.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeStream(state)))
    }

    async fn acquire_display(&self) -> EngineResult<Box<dyn MediaStream>> {
        let state = Arc::new(StreamState {
            stops: AtomicUsize::new(0),
            video: true,
        });
        self.acquired.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeStream(state)))
    }
}

#[derive(Default)]
struct PeerState {
    ops: Mutex<Vec<String>>,
    applied_candidates: Mutex<Vec<String>>,
    closes: AtomicUsize,
    fail_replace: AtomicBool,
}

struct FakePeer(Arc<PeerState>);

#[async_trait::async_trait]
impl PeerConnection for FakePeer {
    async fn attach_local(&self, _stream: &dyn MediaStream) -> EngineResult<()> {
        self.0.ops.lock().unwrap().push("attach_local".into());
        Ok(())
    }

    async fn create_offer(&self) -> EngineResult<SessionDescription> {
        self.0.ops.lock().unwrap().push("create_offer".into());
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "offer-sdp".into(),
        })
    }

    async fn create_answer(&self) -> EngineResult<SessionDescription> {
        self.0.ops.lock().unwrap().push("create_answer".into());
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "answer-sdp".into(),
        })
    }

    async fn set_local_description(&self, _description: SessionDescription) -> EngineResult<()> {
        self.0.ops.lock().unwrap().push("set_local".into());
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> EngineResult<()> {
        self.0.ops.lock().unwrap().push("set_remote".into());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> EngineResult<()> {
        self.0
            .applied_candidates
            .lock()
            .unwrap()
            .push(candidate.candidate);
        Ok(())
    }

    async fn replace_video_track(&self, _source: &dyn MediaStream) -> EngineResult<()> {
        if self.0.fail_replace.load(Ordering::SeqCst) {
            return Err(EngineError::Media("sender gone".into()));
        }
        self.0.ops.lock().unwrap().push("replace_video".into());
        Ok(())
    }

    async fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeFactory {
    peers: Mutex<Vec<Arc<PeerState>>>,
}

impl PeerConnectionFactory for FakeFactory {
    fn create(
        &self,
    ) -> EngineResult<(Box<dyn PeerConnection>, tokio::sync::mpsc::UnboundedReceiver<PeerEvent>)>
    {
        let state = Arc::new(PeerState::default());
        self.peers.lock().unwrap().push(state.clone());
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Ok((Box::new(FakePeer(state)), rx))
    }
}

struct Harness {
    sink: Arc<FakeSink>,
    devices: Arc<FakeDevices>,
    factory: Arc<FakeFactory>,
    engine: Arc<CallEngine>,
}

fn harness() -> Harness {
    let sink = FakeSink::new();
    let devices = Arc::new(FakeDevices::default());
    let factory = Arc::new(FakeFactory::default());
    let engine = CallEngine::new(sink.clone(), devices.clone(), factory.clone());
    Harness {
        sink,
        devices,
        factory,
        engine,
    }
}

fn candidate(tag: &str) -> IceCandidateInit {
    IceCandidateInit {
        candidate: tag.into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

fn answer() -> SessionDescription {
    SessionDescription {
        kind: SdpKind::Answer,
        sdp: "answer-sdp".into(),
    }
}

async fn connecting_caller(h: &Harness) -> Uuid {
    let call_id = h
        .engine
        .start_call(Uuid::new_v4(), "coach", true)
        .await
        .unwrap();
    h.engine
        .apply_event(&ServerEvent::CallAccepted { call_id })
        .await;
    call_id
}

#[tokio::test]
async fn caller_emits_initiate_then_offer_on_accept() {
    let h = harness();
    let call_id = h
        .engine
        .start_call(Uuid::new_v4(), "coach", true)
        .await
        .unwrap();
    assert_eq!(h.engine.status().await, CallStatus::Calling);
    assert!(h.sink.sent().iter().any(|e| matches!(
        e,
        ClientEvent::CallInitiate { call_id: id, video: true, .. } if *id == call_id
    )));

    h.engine
        .apply_event(&ServerEvent::CallAccepted { call_id })
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Connecting);
    assert!(h.sink.sent().iter().any(|e| matches!(
        e,
        ClientEvent::WebrtcOffer { call_id: id, description }
            if *id == call_id && description.sdp == "offer-sdp"
    )));

    let peer = h.factory.peers.lock().unwrap()[0].clone();
    let ops = peer.ops.lock().unwrap().clone();
    assert_eq!(ops, vec!["attach_local", "create_offer", "set_local"]);
}

#[tokio::test]
async fn ice_candidates_buffer_until_remote_description_then_apply_in_order() {
    let h = harness();
    let call_id = connecting_caller(&h).await;

    for tag in ["c1", "c2"] {
        h.engine
            .apply_event(&ServerEvent::IceCandidate {
                call_id,
                candidate: candidate(tag),
            })
            .await;
    }
    let peer = h.factory.peers.lock().unwrap()[0].clone();
    assert!(peer.applied_candidates.lock().unwrap().is_empty());

    h.engine
        .apply_event(&ServerEvent::WebrtcAnswer {
            call_id,
            description: answer(),
        })
        .await;
    // Post-description candidates apply immediately.
    h.engine
        .apply_event(&ServerEvent::IceCandidate {
            call_id,
            candidate: candidate("c3"),
        })
        .await;

    let applied = peer.applied_candidates.lock().unwrap().clone();
    assert_eq!(applied, vec!["c1", "c2", "c3"]);
}

#[tokio::test]
async fn callee_accept_answers_the_offer_without_creating_one() {
    let h = harness();
    let call_id = Uuid::new_v4();
    h.engine
        .apply_event(&ServerEvent::CallIncoming {
            call_id,
            caller_id: Uuid::new_v4(),
            caller_name: "coach".into(),
            video: false,
        })
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Incoming);

    h.engine.accept().await.unwrap();
    assert_eq!(h.engine.status().await, CallStatus::Connecting);
    assert!(h
        .sink
        .sent()
        .iter()
        .any(|e| matches!(e, ClientEvent::CallAccept { call_id: id } if *id == call_id)));

    h.engine
        .apply_event(&ServerEvent::WebrtcOffer {
            call_id,
            description: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "offer-sdp".into(),
            },
        })
        .await;
    assert!(h.sink.sent().iter().any(|e| matches!(
        e,
        ClientEvent::WebrtcAnswer { call_id: id, description }
            if *id == call_id && description.sdp == "answer-sdp"
    )));
    let peer = h.factory.peers.lock().unwrap()[0].clone();
    let ops = peer.ops.lock().unwrap().clone();
    assert!(!ops.contains(&"create_offer".to_string()));
    assert_eq!(
        ops,
        vec!["attach_local", "set_remote", "create_answer", "set_local"]
    );
}

#[tokio::test]
async fn decline_then_reset_returns_to_idle_for_the_next_call() {
    let h = harness();
    let call_id = Uuid::new_v4();
    h.engine
        .apply_event(&ServerEvent::CallIncoming {
            call_id,
            caller_id: Uuid::new_v4(),
            caller_name: "coach".into(),
            video: false,
        })
        .await;

    h.engine.decline().await.unwrap();
    assert_eq!(h.engine.status().await, CallStatus::Declined);
    assert!(h
        .sink
        .sent()
        .iter()
        .any(|e| matches!(e, ClientEvent::CallDecline { call_id: id } if *id == call_id)));

    h.engine.reset().await.unwrap();
    assert_eq!(h.engine.status().await, CallStatus::Idle);

    let next = h
        .engine
        .start_call(Uuid::new_v4(), "coach", false)
        .await
        .unwrap();
    assert_ne!(next, call_id);
    assert_eq!(h.engine.status().await, CallStatus::Calling);
}

#[tokio::test]
async fn caller_sees_decline_releases_resources_and_can_call_again() {
    let h = harness();
    let call_id = h
        .engine
        .start_call(Uuid::new_v4(), "coach", true)
        .await
        .unwrap();

    h.engine
        .apply_event(&ServerEvent::CallDeclined { call_id })
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Declined);
    let stream = h.devices.acquired.lock().unwrap()[0].clone();
    assert_eq!(stream.stops.load(Ordering::SeqCst), 1);

    h.engine.reset().await.unwrap();
    let next = h
        .engine
        .start_call(Uuid::new_v4(), "coach", true)
        .await
        .unwrap();
    assert_ne!(next, call_id);
    assert_eq!(h.engine.status().await, CallStatus::Calling);
}

#[tokio::test]
async fn second_incoming_call_while_busy_is_ignored() {
    let h = harness();
    let call_id = h
        .engine
        .start_call(Uuid::new_v4(), "coach", true)
        .await
        .unwrap();

    h.engine
        .apply_event(&ServerEvent::CallIncoming {
            call_id: Uuid::new_v4(),
            caller_id: Uuid::new_v4(),
            caller_name: "someone else".into(),
            video: false,
        })
        .await;

    let snapshot = h.engine.snapshot().await;
    assert_eq!(snapshot.call_id, Some(call_id));
    assert_eq!(snapshot.status, CallStatus::Calling);
}

#[tokio::test]
async fn media_acquisition_failure_reports_failed_without_signaling() {
    let h = harness();
    h.devices.fail.store(true, Ordering::SeqCst);

    let result = h.engine.start_call(Uuid::new_v4(), "coach", true).await;
    assert!(matches!(result, Err(EngineError::Media(_))));
    let snapshot = h.engine.snapshot().await;
    assert_eq!(snapshot.status, CallStatus::Failed);
    assert!(snapshot.error.is_some());
    assert!(h.sink.sent().is_empty());

    // The failed attempt is terminal; reset clears it.
    h.engine.reset().await.unwrap();
    assert_eq!(h.engine.status().await, CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn unanswered_outgoing_call_times_out_as_missed() {
    let h = harness();
    let call_id = h
        .engine
        .start_call(Uuid::new_v4(), "coach", false)
        .await
        .unwrap();

    tokio::time::sleep(CALL_ANSWER_TIMEOUT + std::time::Duration::from_secs(1)).await;

    assert_eq!(h.engine.status().await, CallStatus::Missed);
    assert!(h
        .sink
        .sent()
        .iter()
        .any(|e| matches!(e, ClientEvent::CallTimeout { call_id: id } if *id == call_id)));
    let stream = h.devices.acquired.lock().unwrap()[0].clone();
    assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_call_auto_declines_as_missed() {
    let h = harness();
    let call_id = Uuid::new_v4();
    h.engine
        .apply_event(&ServerEvent::CallIncoming {
            call_id,
            caller_id: Uuid::new_v4(),
            caller_name: "coach".into(),
            video: false,
        })
        .await;

    tokio::time::sleep(CALL_ANSWER_TIMEOUT + std::time::Duration::from_secs(1)).await;

    assert_eq!(h.engine.status().await, CallStatus::Missed);
    assert!(h
        .sink
        .sent()
        .iter()
        .any(|e| matches!(e, ClientEvent::CallDecline { call_id: id } if *id == call_id)));
}

#[tokio::test]
async fn end_call_cleanup_is_idempotent() {
    let h = harness();
    let call_id = connecting_caller(&h).await;
    h.engine
        .handle_peer_event(call_id, PeerEvent::IceConnected)
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Connected);

    h.engine.end_call().await.unwrap();
    h.engine.end_call().await.unwrap();

    assert_eq!(h.engine.status().await, CallStatus::Ended);
    let stream = h.devices.acquired.lock().unwrap()[0].clone();
    assert_eq!(stream.stops.load(Ordering::SeqCst), 1);
    let peer = h.factory.peers.lock().unwrap()[0].clone();
    assert_eq!(peer.closes.load(Ordering::SeqCst), 1);
    let ends = h
        .sink
        .sent()
        .iter()
        .filter(|e| matches!(e, ClientEvent::CallEnd { .. }))
        .count();
    assert_eq!(ends, 1);
    assert!(h.engine.snapshot().await.duration.is_some());
}

#[tokio::test]
async fn ice_drop_and_recovery_mirror_into_status() {
    let h = harness();
    let call_id = connecting_caller(&h).await;

    h.engine
        .handle_peer_event(call_id, PeerEvent::IceConnected)
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Connected);

    h.engine
        .handle_peer_event(call_id, PeerEvent::IceDisconnected)
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Reconnecting);

    h.engine
        .handle_peer_event(call_id, PeerEvent::IceConnected)
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Connected);

    h.engine
        .handle_peer_event(call_id, PeerEvent::IceFailed)
        .await;
    assert_eq!(h.engine.status().await, CallStatus::Failed);
}

#[tokio::test]
async fn screen_share_replaces_track_and_reverts() {
    let h = harness();
    let call_id = connecting_caller(&h).await;
    h.engine
        .handle_peer_event(call_id, PeerEvent::IceConnected)
        .await;

    assert!(h.engine.toggle_screen_share().await.unwrap());
    assert!(h.engine.snapshot().await.screen_sharing);

    // Browser-level stop control reverts through the same path.
    h.engine
        .handle_peer_event(call_id, PeerEvent::ScreenShareEnded)
        .await;
    assert!(!h.engine.snapshot().await.screen_sharing);

    let peer = h.factory.peers.lock().unwrap()[0].clone();
    let replacements = peer
        .ops
        .lock()
        .unwrap()
        .iter()
        .filter(|op| *op == "replace_video")
        .count();
    assert_eq!(replacements, 2);
    // The display stream stopped; the camera stream is still live.
    let acquired = h.devices.acquired.lock().unwrap().clone();
    assert_eq!(acquired[1].stops.load(Ordering::SeqCst), 1);
    assert_eq!(acquired[0].stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn screen_share_before_connection_acquires_nothing() {
    let h = harness();
    h.engine
        .start_call(Uuid::new_v4(), "coach", true)
        .await
        .unwrap();

    // Still ringing: no peer connection exists yet.
    let result = h.engine.toggle_screen_share().await;
    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    // Only the camera stream was ever acquired.
    assert_eq!(h.devices.acquired.lock().unwrap().len(), 1);
    assert!(!h.engine.snapshot().await.screen_sharing);
}

#[tokio::test]
async fn failed_track_replacement_stops_the_display_stream() {
    let h = harness();
    let call_id = connecting_caller(&h).await;
    h.engine
        .handle_peer_event(call_id, PeerEvent::IceConnected)
        .await;
    let peer = h.factory.peers.lock().unwrap()[0].clone();
    peer.fail_replace.store(true, Ordering::SeqCst);

    let result = h.engine.toggle_screen_share().await;
    assert!(matches!(result, Err(EngineError::Media(_))));
    assert!(!h.engine.snapshot().await.screen_sharing);

    let acquired = h.devices.acquired.lock().unwrap().clone();
    assert_eq!(acquired.len(), 2);
    // The display capture must not keep running after the failure.
    assert_eq!(acquired[1].stops.load(Ordering::SeqCst), 1);
    assert_eq!(acquired[0].stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mute_toggle_flips_flag_and_advises_peer() {
    let h = harness();
    connecting_caller(&h).await;

    assert!(h.engine.toggle_mute().await.unwrap());
    assert!(!h.engine.toggle_mute().await.unwrap());

    let advisories: Vec<bool> = h
        .sink
        .sent()
        .into_iter()
        .filter_map(|e| match e {
            ClientEvent::MediaState { muted, .. } => Some(muted),
            _ => None,
        })
        .collect();
    assert_eq!(advisories, vec![true, false]);
}

#[tokio::test]
async fn remote_media_state_is_recorded() {
    let h = harness();
    let call_id = connecting_caller(&h).await;

    h.engine
        .apply_event(&ServerEvent::MediaState {
            call_id,
            muted: true,
            camera_off: false,
            screen_sharing: true,
        })
        .await;

    let snapshot = h.engine.snapshot().await;
    assert!(snapshot.remote_media.muted);
    assert!(!snapshot.remote_media.camera_off);
    assert!(snapshot.remote_media.screen_sharing);
}
