//! Seams to the platform WebRTC/media stack.
//!
//! The engine owns the call state machine; everything that touches actual
//! devices or an RTCPeerConnection sits behind these traits so the
//! negotiation logic is testable and portable across bindings. The local
//! media stream and peer connection are exclusively owned by the active call
//! session; no other component touches them.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::EngineResult;
use crate::protocol::{IceCandidateInit, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local media stream (camera/microphone or display capture).
pub trait MediaStream: Send + Sync {
    /// Toggle a track in place; the track is never removed.
    fn set_enabled(&self, kind: TrackKind, enabled: bool);
    /// Stop all tracks. Must be safe to call more than once.
    fn stop(&self);
    fn has_video(&self) -> bool;
}

/// Access to capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, audio: bool, video: bool) -> EngineResult<Box<dyn MediaStream>>;
    async fn acquire_display(&self) -> EngineResult<Box<dyn MediaStream>>;
}

/// Events surfaced by the underlying peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate ready to signal to the peer.
    IceCandidate(IceCandidateInit),
    IceConnected,
    IceDisconnected,
    IceFailed,
    /// Remote media arrived.
    RemoteStream,
    /// Browser-level "stop sharing" control fired; must revert screen share
    /// through the same path as the explicit toggle.
    ScreenShareEnded,
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_local(&self, stream: &dyn MediaStream) -> EngineResult<()>;
    async fn create_offer(&self) -> EngineResult<SessionDescription>;
    async fn create_answer(&self) -> EngineResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> EngineResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> EngineResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> EngineResult<()>;
    /// Replace the outgoing video track via the existing sender; no
    /// renegotiation.
    async fn replace_video_track(&self, source: &dyn MediaStream) -> EngineResult<()>;
    /// Close the connection. Must be safe to call more than once.
    async fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    /// Build a peer connection and the channel its events arrive on.
    fn create(&self) -> EngineResult<(Box<dyn PeerConnection>, UnboundedReceiver<PeerEvent>)>;
}
