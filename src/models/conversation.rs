use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::message::MessageKind;

/// The other participant of a 1:1 conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub online: bool,
    pub last_active: Option<DateTime<Utc>>,
}

/// Denormalized summary of the newest message, shown in the conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender_id: Uuid,
    pub content: Option<String>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// A 1:1 conversation between the local user and a counterpart.
///
/// Created by a REST call or materialized from an inbound message event.
/// Never deleted client-side; archival happens server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub counterpart: Participant,
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}
