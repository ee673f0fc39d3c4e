//! Durable offline message queue.
//!
//! The queue is the only client-side state this core persists: a single JSON
//! document overwritten wholesale on every mutation. Readers tolerate a
//! missing or malformed document and treat it as an empty queue, so a corrupt
//! write can never wedge the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{MediaInfo, MessageKind, ReplyRef};
use crate::protocol::ClientEvent;

/// Retries after the settle window before an item is marked failed.
pub const QUEUE_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Payload of a queued outbound intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedPayload {
    pub content: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub media: MediaInfo,
    pub reply_to: Option<ReplyRef>,
    /// Base64 audio for queued voice notes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f32>,
}

/// An outbound message held locally because the transport was unavailable at
/// send time. The id doubles as the wire message id, so the inbound echo can
/// be correlated back to the queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub payload: QueuedPayload,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn text(
        id: Uuid,
        conversation_id: Uuid,
        content: impl Into<String>,
        reply_to: Option<ReplyRef>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            payload: QueuedPayload {
                content: Some(content.into()),
                kind: MessageKind::Text,
                media: MediaInfo::default(),
                reply_to,
                audio_base64: None,
                duration_secs: None,
            },
            status: QueueStatus::Queued,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn voice(id: Uuid, conversation_id: Uuid, audio_base64: String, duration_secs: f32) -> Self {
        Self {
            id,
            conversation_id,
            payload: QueuedPayload {
                content: None,
                kind: MessageKind::Voice,
                media: MediaInfo::default(),
                reply_to: None,
                audio_base64: Some(audio_base64),
                duration_secs: Some(duration_secs),
            },
            status: QueueStatus::Queued,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn media(id: Uuid, conversation_id: Uuid, kind: MessageKind, media: MediaInfo) -> Self {
        Self {
            id,
            conversation_id,
            payload: QueuedPayload {
                content: None,
                kind,
                media,
                reply_to: None,
                audio_base64: None,
                duration_secs: None,
            },
            status: QueueStatus::Queued,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// The wire event this entry re-emits on flush.
    pub fn to_event(&self) -> ClientEvent {
        match (&self.payload.audio_base64, self.payload.kind) {
            (Some(audio), MessageKind::Voice) => ClientEvent::SendVoice {
                message_id: self.id,
                conversation_id: self.conversation_id,
                audio_base64: audio.clone(),
                duration_secs: self.payload.duration_secs.unwrap_or(0.0),
            },
            _ => ClientEvent::SendMessage {
                message_id: self.id,
                conversation_id: self.conversation_id,
                content: self.payload.content.clone(),
                kind: self.payload.kind,
                media: self.payload.media.clone(),
                reply_to: self.payload.reply_to.clone(),
            },
        }
    }
}

/// Durable backing store for the queue.
pub trait QueueStore: Send + Sync {
    /// Load the persisted queue; missing or malformed data reads as empty.
    fn load(&self) -> Vec<QueuedMessage>;
    fn save(&self, items: &[QueuedMessage]) -> EngineResult<()>;
}

/// Single JSON file, overwritten wholesale on every mutation.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl QueueStore for JsonFileStore {
    fn load(&self) -> Vec<QueuedMessage> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(items) => items,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "malformed queue file, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    fn save(&self, items: &[QueuedMessage]) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string(items)
            .map_err(|e| crate::error::EngineError::Queue(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// In-memory store, used by tests and useful for ephemeral embedders.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<Vec<QueuedMessage>>,
}

impl QueueStore for MemoryStore {
    fn load(&self) -> Vec<QueuedMessage> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn save(&self, items: &[QueuedMessage]) -> EngineResult<()> {
        *self
            .items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = items.to_vec();
        Ok(())
    }
}

/// FIFO queue of unacknowledged outbound intents, persisted through the store
/// on every mutation. Persistence failures are logged, never fatal: losing
/// durability must not lose the in-memory queue as well.
pub struct OfflineQueue {
    items: Vec<QueuedMessage>,
    store: Box<dyn QueueStore>,
}

impl OfflineQueue {
    pub fn new(store: Box<dyn QueueStore>) -> Self {
        let mut items = store.load();
        // A crash mid-flush persists items as Sending; re-queue them so the
        // next flush picks them up, otherwise they are stuck unreferenced.
        let mut recovered = 0;
        for item in &mut items {
            if item.status == QueueStatus::Sending {
                item.status = QueueStatus::Queued;
                recovered += 1;
            }
        }
        if !items.is_empty() {
            debug!(count = items.len(), recovered, "restored offline queue");
        }
        Self { items, store }
    }

    pub fn enqueue(&mut self, item: QueuedMessage) {
        self.items.push(item);
        self.persist();
    }

    /// Ids of items awaiting emission, in original enqueue order.
    pub fn queued_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter(|i| i.status == QueueStatus::Queued)
            .map(|i| i.id)
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&QueuedMessage> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn mark(&mut self, id: Uuid, status: QueueStatus) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.status = status;
            self.persist();
        }
    }

    /// Remove an entry once its inbound confirmation is observed. Returns
    /// whether anything was removed.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        let removed = before != self.items.len();
        if removed {
            self.persist();
        }
        removed
    }

    /// Settle pass after a flush: anything still `Sending` was not confirmed
    /// within the window. Retry up to the cap, then mark failed.
    pub fn settle_unconfirmed(&mut self) {
        let mut changed = false;
        for item in &mut self.items {
            if item.status == QueueStatus::Sending {
                item.retry_count += 1;
                item.status = if item.retry_count >= QUEUE_MAX_RETRIES {
                    QueueStatus::Failed
                } else {
                    QueueStatus::Queued
                };
                changed = true;
            }
        }
        if changed {
            self.persist();
        }
    }

    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.items.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.items) {
            warn!(error = %e, "failed to persist offline queue");
        }
    }
}
