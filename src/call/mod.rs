//! Call lifecycle state machine and WebRTC negotiation.
//!
//! `idle -> calling -> connecting -> connected -> reconnecting` on the caller
//! side, `idle -> incoming -> connecting -> ...` on the callee side, with
//! `ended/declined/missed/failed` terminal. Exactly one session exists
//! outside idle. The caller creates the offer and the callee answers, which
//! avoids glare. Received ICE candidates are buffered until the remote
//! description is set and then applied in arrival order; the transport gives
//! no ordering guarantee across distinct event types, so this buffer is
//! load-bearing. Every failure path funnels through one idempotent cleanup
//! routine before the session reports `failed`.

pub mod media;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{CallDirection, CallStatus, MediaStateFlags};
use crate::protocol::{ClientEvent, IceCandidateInit, ServerEvent, SessionDescription};
use crate::transport::EventSink;
use media::{MediaDevices, MediaStream, PeerConnection, PeerConnectionFactory, PeerEvent, TrackKind};

/// One shared timeout for the outgoing ring and the incoming auto-decline.
pub const CALL_ANSWER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

struct CallSession {
    call_id: Uuid,
    status: CallStatus,
    direction: CallDirection,
    peer_id: Uuid,
    peer_name: String,
    video: bool,
    local_stream: Option<Box<dyn MediaStream>>,
    display_stream: Option<Box<dyn MediaStream>>,
    connection: Option<Box<dyn PeerConnection>>,
    muted: bool,
    camera_off: bool,
    screen_sharing: bool,
    remote_media: MediaStateFlags,
    remote_stream: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidateInit>,
    connected_at: Option<Instant>,
    final_duration: Option<std::time::Duration>,
    timeout_handle: Option<JoinHandle<()>>,
    pump_handle: Option<JoinHandle<()>>,
    error: Option<String>,
}

impl CallSession {
    fn new(
        call_id: Uuid,
        peer_id: Uuid,
        peer_name: &str,
        direction: CallDirection,
        video: bool,
        status: CallStatus,
    ) -> Self {
        Self {
            call_id,
            status,
            direction,
            peer_id,
            peer_name: peer_name.to_string(),
            video,
            local_stream: None,
            display_stream: None,
            connection: None,
            muted: false,
            camera_off: false,
            screen_sharing: false,
            remote_media: MediaStateFlags::default(),
            remote_stream: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            connected_at: None,
            final_duration: None,
            timeout_handle: None,
            pump_handle: None,
            error: None,
        }
    }

    fn duration(&self) -> Option<std::time::Duration> {
        self.final_duration
            .or_else(|| self.connected_at.map(|t| t.elapsed()))
    }
}

/// Read-only view of the active call for UI layers.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub call_id: Option<Uuid>,
    pub direction: Option<CallDirection>,
    pub peer_id: Option<Uuid>,
    pub peer_name: Option<String>,
    pub muted: bool,
    pub camera_off: bool,
    pub screen_sharing: bool,
    pub remote_media: MediaStateFlags,
    pub remote_stream: bool,
    pub duration: Option<std::time::Duration>,
    pub error: Option<String>,
}

impl CallSnapshot {
    fn idle() -> Self {
        Self {
            status: CallStatus::Idle,
            call_id: None,
            direction: None,
            peer_id: None,
            peer_name: None,
            muted: false,
            camera_off: false,
            screen_sharing: false,
            remote_media: MediaStateFlags::default(),
            remote_stream: false,
            duration: None,
            error: None,
        }
    }
}

pub struct CallEngine {
    sink: Arc<dyn EventSink>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    state: RwLock<Option<CallSession>>,
}

impl CallEngine {
    pub fn new(
        sink: Arc<dyn EventSink>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            devices,
            peers,
            state: RwLock::new(None),
        })
    }

    // ------------------------------------------------------------------
    // User intents
    // ------------------------------------------------------------------

    /// Initiate an outgoing call. Local media is acquired first; if that
    /// fails nothing is signaled and the attempt reports failed.
    pub async fn start_call(
        self: &Arc<Self>,
        callee_id: Uuid,
        callee_name: &str,
        video: bool,
    ) -> EngineResult<Uuid> {
        {
            let guard = self.state.read().await;
            if guard.as_ref().is_some_and(|s| !s.status.is_terminal()) {
                return Err(EngineError::InvalidState(
                    "a call is already in progress".into(),
                ));
            }
        }

        let call_id = Uuid::new_v4();
        let stream = match self.devices.acquire(true, video).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut session = CallSession::new(
                    call_id,
                    callee_id,
                    callee_name,
                    CallDirection::Outgoing,
                    video,
                    CallStatus::Failed,
                );
                session.error = Some(e.to_string());
                *self.state.write().await = Some(session);
                return Err(e);
            }
        };

        let mut guard = self.state.write().await;
        if guard.as_ref().is_some_and(|s| !s.status.is_terminal()) {
            // An incoming call raced us while acquiring media.
            stream.stop();
            return Err(EngineError::InvalidState(
                "a call is already in progress".into(),
            ));
        }
        let mut session = CallSession::new(
            call_id,
            callee_id,
            callee_name,
            CallDirection::Outgoing,
            video,
            CallStatus::Calling,
        );
        session.local_stream = Some(stream);
        if let Err(e) = self.sink.send(ClientEvent::CallInitiate {
            call_id,
            callee_id,
            video,
        }) {
            session.status = CallStatus::Failed;
            session.error = Some(e.to_string());
            cleanup_session(&mut session).await;
            *guard = Some(session);
            return Err(e);
        }
        session.timeout_handle = Some(self.spawn_ring_timeout(call_id));
        *guard = Some(session);
        debug!(%call_id, "call initiated");
        Ok(call_id)
    }

    /// Accept the ringing incoming call. The callee does not create the
    /// offer; it acquires media, builds the peer connection and waits for the
    /// caller's offer.
    pub async fn accept(self: &Arc<Self>) -> EngineResult<()> {
        let mut guard = self.state.write().await;
        let session = guard
            .as_mut()
            .filter(|s| s.status == CallStatus::Incoming)
            .ok_or_else(|| EngineError::InvalidState("no incoming call to accept".into()))?;
        if let Some(handle) = session.timeout_handle.take() {
            handle.abort();
        }

        let call_id = session.call_id;
        let video = session.video;
        let stream = match self.devices.acquire(true, video).await {
            Ok(stream) => stream,
            Err(e) => {
                session.status = CallStatus::Failed;
                session.error = Some(e.to_string());
                cleanup_session(session).await;
                return Err(e);
            }
        };

        if let Err(e) = self.build_peer_connection(session, stream).await {
            session.status = CallStatus::Failed;
            session.error = Some(e.to_string());
            cleanup_session(session).await;
            return Err(e);
        }
        session.status = CallStatus::Connecting;
        if let Err(e) = self.sink.send(ClientEvent::CallAccept { call_id }) {
            session.status = CallStatus::Failed;
            session.error = Some(e.to_string());
            cleanup_session(session).await;
            return Err(e);
        }
        Ok(())
    }

    /// Decline the ringing incoming call.
    pub async fn decline(&self) -> EngineResult<()> {
        let mut guard = self.state.write().await;
        let session = guard
            .as_mut()
            .filter(|s| s.status == CallStatus::Incoming)
            .ok_or_else(|| EngineError::InvalidState("no incoming call to decline".into()))?;
        let _ = self.sink.send(ClientEvent::CallDecline {
            call_id: session.call_id,
        });
        session.status = CallStatus::Declined;
        cleanup_session(session).await;
        Ok(())
    }

    /// Hang up. A no-op when no call is active.
    pub async fn end_call(&self) -> EngineResult<()> {
        let mut guard = self.state.write().await;
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };
        if session.status.is_terminal() {
            return Ok(());
        }
        let _ = self.sink.send(ClientEvent::CallEnd {
            call_id: session.call_id,
        });
        session.status = CallStatus::Ended;
        cleanup_session(session).await;
        Ok(())
    }

    /// Return a terminal session to idle so a new call can start.
    pub async fn reset(&self) -> EngineResult<()> {
        let mut guard = self.state.write().await;
        match guard.as_ref() {
            None => Ok(()),
            Some(s) if s.status.is_terminal() => {
                *guard = None;
                Ok(())
            }
            Some(_) => Err(EngineError::InvalidState(
                "call still active, end it first".into(),
            )),
        }
    }

    /// Toggle the microphone. The track stays attached; only its enabled
    /// flag flips, and the peer gets an advisory media-state event.
    pub async fn toggle_mute(&self) -> EngineResult<bool> {
        let mut guard = self.state.write().await;
        let session = active_session(&mut guard)?;
        session.muted = !session.muted;
        if let Some(stream) = session.local_stream.as_deref() {
            stream.set_enabled(TrackKind::Audio, !session.muted);
        }
        self.send_media_state(session);
        Ok(session.muted)
    }

    pub async fn toggle_camera(&self) -> EngineResult<bool> {
        let mut guard = self.state.write().await;
        let session = active_session(&mut guard)?;
        session.camera_off = !session.camera_off;
        if let Some(stream) = session.local_stream.as_deref() {
            stream.set_enabled(TrackKind::Video, !session.camera_off);
        }
        self.send_media_state(session);
        Ok(session.camera_off)
    }

    /// Start or stop screen sharing by replacing the outgoing video track in
    /// place through the existing sender. The browser-level share-stop signal
    /// arrives as [`PeerEvent::ScreenShareEnded`] and reverts through the
    /// same path.
    pub async fn toggle_screen_share(&self) -> EngineResult<bool> {
        let mut guard = self.state.write().await;
        let session = active_session(&mut guard)?;
        if session.screen_sharing {
            self.stop_screen_share_inner(session).await;
            return Ok(false);
        }
        let conn = session
            .connection
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("call is not connected".into()))?;
        let display = self.devices.acquire_display().await?;
        if let Err(e) = conn.replace_video_track(&*display).await {
            display.stop();
            return Err(e);
        }
        session.display_stream = Some(display);
        session.screen_sharing = true;
        self.send_media_state(session);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------

    /// Apply one inbound signaling event. Chat events are ignored here.
    pub async fn apply_event(self: &Arc<Self>, event: &ServerEvent) {
        match event {
            ServerEvent::CallIncoming {
                call_id,
                caller_id,
                caller_name,
                video,
            } => {
                self.on_incoming(*call_id, *caller_id, caller_name, *video)
                    .await;
            }
            ServerEvent::CallAccepted { call_id } => self.on_accepted(*call_id).await,
            ServerEvent::CallDeclined { call_id } => {
                self.on_peer_terminated(*call_id, CallStatus::Declined).await;
            }
            ServerEvent::CallEnded { call_id } => {
                self.on_peer_terminated(*call_id, CallStatus::Ended).await;
            }
            ServerEvent::WebrtcOffer {
                call_id,
                description,
            } => self.on_offer(*call_id, description.clone()).await,
            ServerEvent::WebrtcAnswer {
                call_id,
                description,
            } => self.on_answer(*call_id, description.clone()).await,
            ServerEvent::IceCandidate { call_id, candidate } => {
                self.on_candidate(*call_id, candidate.clone()).await;
            }
            ServerEvent::MediaState {
                call_id,
                muted,
                camera_off,
                screen_sharing,
            } => {
                let mut guard = self.state.write().await;
                if let Some(session) = guard.as_mut().filter(|s| s.call_id == *call_id) {
                    session.remote_media = MediaStateFlags {
                        muted: *muted,
                        camera_off: *camera_off,
                        screen_sharing: *screen_sharing,
                    };
                }
            }
            _ => {}
        }
    }

    async fn on_incoming(self: &Arc<Self>, call_id: Uuid, caller_id: Uuid, caller_name: &str, video: bool) {
        let mut guard = self.state.write().await;
        if guard.as_ref().is_some_and(|s| !s.status.is_terminal()) {
            // No call waiting: a client mid-call ignores a second ring.
            debug!(%call_id, "ignoring incoming call while busy");
            return;
        }
        let mut session = CallSession::new(
            call_id,
            caller_id,
            caller_name,
            CallDirection::Incoming,
            video,
            CallStatus::Incoming,
        );
        session.timeout_handle = Some(self.spawn_ring_timeout(call_id));
        *guard = Some(session);
        debug!(%call_id, %caller_id, "incoming call");
    }

    async fn on_accepted(self: &Arc<Self>, call_id: Uuid) {
        let mut guard = self.state.write().await;
        let Some(session) = guard
            .as_mut()
            .filter(|s| s.call_id == call_id && s.status == CallStatus::Calling)
        else {
            return;
        };
        if let Some(handle) = session.timeout_handle.take() {
            handle.abort();
        }
        // Caller side: build the connection and create the offer.
        let result = async {
            let stream_ref = session
                .local_stream
                .as_deref()
                .ok_or_else(|| EngineError::Media("local stream missing".into()))?;
            let (conn, events) = self.peers.create()?;
            conn.attach_local(stream_ref).await?;
            session.connection = Some(conn);
            session.pump_handle = Some(self.spawn_peer_pump(call_id, events));
            session.status = CallStatus::Connecting;
            if let Some(conn) = session.connection.as_ref() {
                let offer = conn.create_offer().await?;
                conn.set_local_description(offer.clone()).await?;
                self.sink.send(ClientEvent::WebrtcOffer {
                    call_id,
                    description: offer,
                })?;
            }
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = result {
            fail_session(session, &e).await;
        }
    }

    async fn on_offer(self: &Arc<Self>, call_id: Uuid, description: SessionDescription) {
        let mut guard = self.state.write().await;
        let Some(session) = guard
            .as_mut()
            .filter(|s| s.call_id == call_id && s.status == CallStatus::Connecting)
        else {
            return;
        };
        let result = async {
            apply_remote_description(session, description).await?;
            if let Some(conn) = session.connection.as_ref() {
                let answer = conn.create_answer().await?;
                conn.set_local_description(answer.clone()).await?;
                self.sink.send(ClientEvent::WebrtcAnswer {
                    call_id,
                    description: answer,
                })?;
            }
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = result {
            fail_session(session, &e).await;
        }
    }

    async fn on_answer(self: &Arc<Self>, call_id: Uuid, description: SessionDescription) {
        let mut guard = self.state.write().await;
        let Some(session) = guard.as_mut().filter(|s| s.call_id == call_id) else {
            return;
        };
        if let Err(e) = apply_remote_description(session, description).await {
            fail_session(session, &e).await;
        }
    }

    async fn on_candidate(&self, call_id: Uuid, candidate: IceCandidateInit) {
        let mut guard = self.state.write().await;
        let Some(session) = guard.as_mut().filter(|s| s.call_id == call_id) else {
            return;
        };
        if session.remote_description_set {
            if let Some(conn) = session.connection.as_ref() {
                if let Err(e) = conn.add_ice_candidate(candidate).await {
                    fail_session(session, &EngineError::Signaling(e.to_string())).await;
                }
                return;
            }
        }
        // ICE before the remote description is meaningless; buffer in
        // arrival order until it can be applied.
        session.pending_candidates.push(candidate);
    }

    async fn on_peer_terminated(self: &Arc<Self>, call_id: Uuid, status: CallStatus) {
        let mut guard = self.state.write().await;
        let Some(session) = guard
            .as_mut()
            .filter(|s| s.call_id == call_id && !s.status.is_terminal())
        else {
            return;
        };
        session.status = status;
        cleanup_session(session).await;
        debug!(%call_id, status = status.as_str(), "call terminated by peer");
    }

    // ------------------------------------------------------------------
    // Peer connection events
    // ------------------------------------------------------------------

    pub async fn handle_peer_event(&self, call_id: Uuid, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                // Only emitted once the call id is known, which is always the
                // case here: the connection exists only inside a session.
                let guard = self.state.read().await;
                if guard.as_ref().is_some_and(|s| s.call_id == call_id) {
                    let _ = self.sink.send(ClientEvent::IceCandidate { call_id, candidate });
                }
            }
            PeerEvent::IceConnected => {
                let mut guard = self.state.write().await;
                let Some(session) = guard.as_mut().filter(|s| s.call_id == call_id) else {
                    return;
                };
                if matches!(
                    session.status,
                    CallStatus::Connecting | CallStatus::Reconnecting
                ) {
                    session.status = CallStatus::Connected;
                    // Duration reflects media time, not acceptance time.
                    session.connected_at.get_or_insert_with(Instant::now);
                }
            }
            PeerEvent::IceDisconnected => {
                let mut guard = self.state.write().await;
                if let Some(session) = guard
                    .as_mut()
                    .filter(|s| s.call_id == call_id && s.status == CallStatus::Connected)
                {
                    // The transport renegotiates on its own; we only mirror.
                    session.status = CallStatus::Reconnecting;
                }
            }
            PeerEvent::IceFailed => {
                let mut guard = self.state.write().await;
                if let Some(session) = guard
                    .as_mut()
                    .filter(|s| s.call_id == call_id && !s.status.is_terminal())
                {
                    fail_session(session, &EngineError::Signaling("ice failed".into())).await;
                }
            }
            PeerEvent::RemoteStream => {
                let mut guard = self.state.write().await;
                if let Some(session) = guard.as_mut().filter(|s| s.call_id == call_id) {
                    session.remote_stream = true;
                }
            }
            PeerEvent::ScreenShareEnded => {
                let mut guard = self.state.write().await;
                if let Some(session) = guard
                    .as_mut()
                    .filter(|s| s.call_id == call_id && s.screen_sharing)
                {
                    self.stop_screen_share_inner(session).await;
                }
            }
        }
    }

    /// Fires when the ring window elapses without an answer.
    pub(crate) async fn handle_ring_timeout(&self, call_id: Uuid) {
        let mut guard = self.state.write().await;
        let Some(session) = guard.as_mut().filter(|s| s.call_id == call_id) else {
            return;
        };
        match session.status {
            CallStatus::Calling => {
                let _ = self.sink.send(ClientEvent::CallTimeout { call_id });
                session.status = CallStatus::Missed;
                cleanup_session(session).await;
            }
            CallStatus::Incoming => {
                let _ = self.sink.send(ClientEvent::CallDecline { call_id });
                session.status = CallStatus::Missed;
                cleanup_session(session).await;
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn status(&self) -> CallStatus {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(CallStatus::Idle)
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        match &*self.state.read().await {
            None => CallSnapshot::idle(),
            Some(s) => CallSnapshot {
                status: s.status,
                call_id: Some(s.call_id),
                direction: Some(s.direction),
                peer_id: Some(s.peer_id),
                peer_name: Some(s.peer_name.clone()),
                muted: s.muted,
                camera_off: s.camera_off,
                screen_sharing: s.screen_sharing,
                remote_media: s.remote_media,
                remote_stream: s.remote_stream,
                duration: s.duration(),
                error: s.error.clone(),
            },
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn build_peer_connection(
        self: &Arc<Self>,
        session: &mut CallSession,
        stream: Box<dyn MediaStream>,
    ) -> EngineResult<()> {
        let (conn, events) = self.peers.create()?;
        conn.attach_local(&*stream).await?;
        session.local_stream = Some(stream);
        session.connection = Some(conn);
        session.pump_handle = Some(self.spawn_peer_pump(session.call_id, events));
        Ok(())
    }

    async fn stop_screen_share_inner(&self, session: &mut CallSession) {
        if let Some(display) = session.display_stream.take() {
            display.stop();
        }
        session.screen_sharing = false;
        if let (Some(conn), Some(camera)) = (
            session.connection.as_ref(),
            session.local_stream.as_deref(),
        ) {
            if let Err(e) = conn.replace_video_track(camera).await {
                warn!(error = %e, "reverting screen share failed");
            }
        }
        self.send_media_state(session);
    }

    fn send_media_state(&self, session: &CallSession) {
        let _ = self.sink.send(ClientEvent::MediaState {
            call_id: session.call_id,
            muted: session.muted,
            camera_off: session.camera_off,
            screen_sharing: session.screen_sharing,
        });
    }

    fn spawn_ring_timeout(self: &Arc<Self>, call_id: Uuid) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CALL_ANSWER_TIMEOUT).await;
            engine.handle_ring_timeout(call_id).await;
        })
    }

    fn spawn_peer_pump(
        self: &Arc<Self>,
        call_id: Uuid,
        mut events: UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_peer_event(call_id, event).await;
            }
        })
    }
}

fn active_session<'a>(
    guard: &'a mut tokio::sync::RwLockWriteGuard<'_, Option<CallSession>>,
) -> EngineResult<&'a mut CallSession> {
    guard
        .as_mut()
        .filter(|s| !s.status.is_terminal() && s.local_stream.is_some())
        .ok_or_else(|| EngineError::InvalidState("no active call".into()))
}

async fn apply_remote_description(
    session: &mut CallSession,
    description: SessionDescription,
) -> EngineResult<()> {
    let conn = session
        .connection
        .as_ref()
        .ok_or_else(|| EngineError::Signaling("no peer connection".into()))?;
    conn.set_remote_description(description).await?;
    session.remote_description_set = true;
    // Flush buffered candidates in original arrival order.
    let pending: Vec<IceCandidateInit> = session.pending_candidates.drain(..).collect();
    for candidate in pending {
        conn.add_ice_candidate(candidate).await?;
    }
    Ok(())
}

/// Tear down every side effect of a call attempt: tracks, peer connection,
/// timers, buffered candidates. Idempotent so every failure path can call it
/// unconditionally.
async fn cleanup_session(session: &mut CallSession) {
    if let Some(conn) = session.connection.take() {
        conn.close().await;
    }
    if let Some(stream) = session.local_stream.take() {
        stream.stop();
    }
    if let Some(display) = session.display_stream.take() {
        display.stop();
    }
    if let Some(handle) = session.timeout_handle.take() {
        handle.abort();
    }
    if let Some(handle) = session.pump_handle.take() {
        handle.abort();
    }
    session.pending_candidates.clear();
    session.remote_description_set = false;
    session.screen_sharing = false;
    if let Some(start) = session.connected_at.take() {
        session.final_duration = Some(start.elapsed());
    }
}

async fn fail_session(session: &mut CallSession, error: &EngineError) {
    warn!(call_id = %session.call_id, error = %error, "call failed");
    session.status = CallStatus::Failed;
    session.error = Some(error.to_string());
    cleanup_session(session).await;
}
