//! Wire protocol for the event transport.
//!
//! One exhaustive tagged-union schema shared by sender and receiver, validated
//! at the transport boundary. Malformed or unknown frames fail decoding there
//! and are dropped with a warning instead of propagating undefined fields into
//! the engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MediaInfo, Message, MessageKind, PresenceRecord, Reaction, ReplyRef};

/// Logical multicast scope the transport routes events through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Session,
    Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// WebRTC session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// WebRTC network path proposal. Meaningless before the remote description is
/// set, which is why receivers buffer them (see the call engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Crisis alert payload, forwarded verbatim to the registered callback. The
/// engine does not interpret or rate-limit these; detection stays the single
/// source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrisisAlert {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub level: i32,
    pub message_id: Option<Uuid>,
    pub excerpt: Option<String>,
}

/// Outbound intents, client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "join_room")]
    JoinRoom { kind: RoomKind, id: Uuid },
    #[serde(rename = "leave_room")]
    LeaveRoom { kind: RoomKind, id: Uuid },

    /// Text or already-uploaded media message. `message_id` is client
    /// generated and echoed back by the server, which is what lets the
    /// offline queue correlate an emission with its confirmation.
    #[serde(rename = "send_message")]
    SendMessage {
        message_id: Uuid,
        conversation_id: Uuid,
        content: Option<String>,
        kind: MessageKind,
        #[serde(default)]
        media: MediaInfo,
        reply_to: Option<ReplyRef>,
    },
    /// Voice note: opaque audio bytes, base64-encoded, in one event.
    #[serde(rename = "send_voice")]
    SendVoice {
        message_id: Uuid,
        conversation_id: Uuid,
        audio_base64: String,
        duration_secs: f32,
    },
    #[serde(rename = "edit_message")]
    EditMessage {
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
    },
    #[serde(rename = "delete_message")]
    DeleteMessage {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    #[serde(rename = "add_reaction")]
    AddReaction {
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },
    #[serde(rename = "remove_reaction")]
    RemoveReaction {
        conversation_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: Uuid,
        is_typing: bool,
    },
    #[serde(rename = "mark_read")]
    MarkRead {
        conversation_id: Uuid,
        message_ids: Vec<Uuid>,
    },
    #[serde(rename = "query_presence")]
    QueryPresence { user_ids: Vec<Uuid> },

    #[serde(rename = "call_initiate")]
    CallInitiate {
        call_id: Uuid,
        callee_id: Uuid,
        video: bool,
    },
    #[serde(rename = "call_accept")]
    CallAccept { call_id: Uuid },
    #[serde(rename = "call_decline")]
    CallDecline { call_id: Uuid },
    #[serde(rename = "call_end")]
    CallEnd { call_id: Uuid },
    #[serde(rename = "call_timeout")]
    CallTimeout { call_id: Uuid },

    #[serde(rename = "webrtc_offer")]
    WebrtcOffer {
        call_id: Uuid,
        description: SessionDescription,
    },
    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer {
        call_id: Uuid,
        description: SessionDescription,
    },
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        call_id: Uuid,
        candidate: IceCandidateInit,
    },
    #[serde(rename = "media_state")]
    MediaState {
        call_id: Uuid,
        muted: bool,
        camera_off: bool,
        screen_sharing: bool,
    },
}

/// Inbound confirmations and pushes, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message_new")]
    MessageNew { message: Message },
    #[serde(rename = "message_edited")]
    MessageEdited {
        conversation_id: Uuid,
        message_id: Uuid,
        content: String,
        edited_at: DateTime<Utc>,
    },
    #[serde(rename = "message_deleted")]
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    #[serde(rename = "reaction_added")]
    ReactionAdded {
        conversation_id: Uuid,
        message_id: Uuid,
        reaction: Reaction,
    },
    #[serde(rename = "reaction_removed")]
    ReactionRemoved {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        user_name: String,
        is_typing: bool,
    },
    #[serde(rename = "read_receipt")]
    ReadReceipt {
        conversation_id: Uuid,
        reader_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },
    #[serde(rename = "crisis_alert")]
    CrisisAlert {
        #[serde(flatten)]
        alert: CrisisAlert,
    },
    #[serde(rename = "presence_changed")]
    PresenceChanged {
        #[serde(flatten)]
        record: PresenceRecord,
    },
    #[serde(rename = "presence_bulk")]
    PresenceBulk { records: Vec<PresenceRecord> },
    /// Async enrichment of a prior voice message.
    #[serde(rename = "biomarkers_ready")]
    BiomarkersReady {
        conversation_id: Uuid,
        message_id: Uuid,
        transcript: Option<String>,
        sentiment: Option<String>,
        crisis_level: Option<i32>,
        biomarkers: Option<serde_json::Value>,
    },

    #[serde(rename = "call_incoming")]
    CallIncoming {
        call_id: Uuid,
        caller_id: Uuid,
        caller_name: String,
        video: bool,
    },
    #[serde(rename = "call_accepted")]
    CallAccepted { call_id: Uuid },
    #[serde(rename = "call_declined")]
    CallDeclined { call_id: Uuid },
    #[serde(rename = "call_ended")]
    CallEnded { call_id: Uuid },

    #[serde(rename = "webrtc_offer")]
    WebrtcOffer {
        call_id: Uuid,
        description: SessionDescription,
    },
    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer {
        call_id: Uuid,
        description: SessionDescription,
    },
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        call_id: Uuid,
        candidate: IceCandidateInit,
    },
    #[serde(rename = "media_state")]
    MediaState {
        call_id: Uuid,
        muted: bool,
        camera_off: bool,
        screen_sharing: bool,
    },
}

/// Decode an inbound frame at the transport boundary.
pub fn decode_server_event(raw: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_client_event(event: &ClientEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
