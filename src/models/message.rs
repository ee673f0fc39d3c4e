use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Voice,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

/// Media fields, meaningful only for non-text message kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Fields populated asynchronously after message creation by server-side
/// enrichment (transcription, sentiment, crisis scoring, voice biomarkers).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedInsights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crisis_level: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biomarkers: Option<serde_json::Value>,
}

/// Reference to the message being replied to, with a denormalized preview so
/// the UI never has to chase the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: Uuid,
    pub preview: String,
}

/// A single reaction. (user_id, emoji) is the dedup key within a message;
/// the same user may hold several reactions with different emoji.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Uuid,
    pub user_name: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// Grouped view of reactions for display. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedReaction {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<String>,
    pub reacted_by_me: bool,
}

/// A message in a conversation timeline.
///
/// The id is stable from creation (including client-assigned ids for offline
/// sends) through server confirmation; reconciliation replaces an entry with
/// a matching id in place, never duplicates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    /// None once the message has been deleted (soft delete).
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub media: MediaInfo,
    #[serde(default)]
    pub insights: DerivedInsights,
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Add a reaction, deduplicating on (user_id, emoji). Returns whether the
    /// reaction was actually inserted.
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        if self
            .reactions
            .iter()
            .any(|r| r.user_id == reaction.user_id && r.emoji == reaction.emoji)
        {
            return false;
        }
        self.reactions.push(reaction);
        true
    }

    pub fn remove_reaction(&mut self, user_id: Uuid, emoji: &str) -> bool {
        let before = self.reactions.len();
        self.reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        before != self.reactions.len()
    }

    /// Group reactions by emoji in first-seen order.
    pub fn grouped_reactions(&self, me: Uuid) -> Vec<GroupedReaction> {
        let mut groups: Vec<GroupedReaction> = Vec::new();
        for reaction in &self.reactions {
            match groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
                Some(group) => {
                    group.count += 1;
                    group.users.push(reaction.user_name.clone());
                    group.reacted_by_me |= reaction.user_id == me;
                }
                None => groups.push(GroupedReaction {
                    emoji: reaction.emoji.clone(),
                    count: 1,
                    users: vec![reaction.user_name.clone()],
                    reacted_by_me: reaction.user_id == me,
                }),
            }
        }
        groups
    }
}

/// A counterpart currently typing in a conversation.
///
/// Self-expires after the typing window with no explicit "stopped typing"
/// event required; pruned on read.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub expires_at: DateTime<Utc>,
}

impl TypingIndicator {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
