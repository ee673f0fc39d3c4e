//! Conversation and message engine.
//!
//! Owns the conversation list, the selected conversation's timeline, typing
//! indicators, the presence map and the offline queue. UI layers read
//! snapshots and issue intents; every mutation of message and reaction state
//! comes from authoritative inbound events through [`ChatEngine::apply_event`]
//! so local state never diverges under concurrent multi-device use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Conversation, LastMessage, MediaInfo, Message, MessageKind, Participant, PresenceRecord,
    ReplyRef, TypingIndicator,
};
use crate::protocol::{ClientEvent, CrisisAlert, ServerEvent};
use crate::queue::{OfflineQueue, QueueStatus, QueueStore, QueuedMessage};
use crate::rest::ConversationApi;
use crate::transport::{ConnectionState, EventSink};

/// Typing indicators self-expire this long after the last refresh.
pub const TYPING_EXPIRY_SECS: i64 = 3;
/// At most one typing=true emission per conversation within this window.
pub const TYPING_DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(2);
/// Fallback window after a queue flush before unconfirmed items are retried.
pub const QUEUE_SETTLE_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
/// Cadence of the polling backstop for the open conversation.
pub const MESSAGE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

type CrisisHandler = Box<dyn Fn(&CrisisAlert) + Send + Sync>;

struct ChatState {
    conversations: Vec<Conversation>,
    selected: Option<Uuid>,
    /// Timeline of the selected conversation only.
    messages: Vec<Message>,
    typing: Vec<TypingIndicator>,
    presence: HashMap<Uuid, PresenceRecord>,
    queue: OfflineQueue,
    last_typing_sent: HashMap<Uuid, Instant>,
}

pub struct ChatEngine {
    sink: Arc<dyn EventSink>,
    api: Arc<dyn ConversationApi>,
    user_id: Uuid,
    state: RwLock<ChatState>,
    crisis_handler: std::sync::Mutex<Option<CrisisHandler>>,
}

impl ChatEngine {
    pub fn new(
        sink: Arc<dyn EventSink>,
        api: Arc<dyn ConversationApi>,
        store: Box<dyn QueueStore>,
        user_id: Uuid,
    ) -> Self {
        Self {
            sink,
            api,
            user_id,
            state: RwLock::new(ChatState {
                conversations: Vec::new(),
                selected: None,
                messages: Vec::new(),
                typing: Vec::new(),
                presence: HashMap::new(),
                queue: OfflineQueue::new(store),
                last_typing_sent: HashMap::new(),
            }),
            crisis_handler: std::sync::Mutex::new(None),
        }
    }

    /// Register the crisis-alert pass-through. Alerts are forwarded verbatim;
    /// this engine neither interprets nor rate-limits them.
    pub fn set_crisis_handler(&self, handler: impl Fn(&CrisisAlert) + Send + Sync + 'static) {
        *self
            .crisis_handler
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(handler));
    }

    // ------------------------------------------------------------------
    // Selection and retrieval
    // ------------------------------------------------------------------

    /// Switch focus to another conversation. Events for the previous one
    /// still arrive but are no longer merged into the visible timeline; room
    /// membership handles the underlying routing.
    pub async fn select_conversation(&self, id: Option<Uuid>) {
        let mut state = self.state.write().await;
        if state.selected == id {
            return;
        }
        state.selected = id;
        state.messages.clear();
        state.typing.clear();
    }

    /// Load the conversation list and request bulk presence for every
    /// counterpart in one query.
    pub async fn refresh_conversations(&self) -> EngineResult<()> {
        let fetched = self.api.list_conversations().await?;
        let mut state = self.state.write().await;
        state.conversations = fetched;
        // Re-apply presence already learned over the transport.
        let presence = state.presence.clone();
        for conversation in &mut state.conversations {
            if let Some(record) = presence.get(&conversation.counterpart.id) {
                conversation.counterpart.online = record.status.is_online();
                conversation.counterpart.last_active = record.last_seen;
            }
        }
        let counterparts: Vec<Uuid> = state
            .conversations
            .iter()
            .map(|c| c.counterpart.id)
            .collect();
        drop(state);

        if !counterparts.is_empty() && self.sink.state() == ConnectionState::Connected {
            let _ = self.sink.send(ClientEvent::QueryPresence {
                user_ids: counterparts,
            });
        }
        Ok(())
    }

    pub async fn create_conversation(&self, counterpart_id: Uuid) -> EngineResult<Conversation> {
        let conversation = self.api.create_conversation(counterpart_id).await?;
        let mut state = self.state.write().await;
        if !state.conversations.iter().any(|c| c.id == conversation.id) {
            state.conversations.push(conversation.clone());
        }
        Ok(conversation)
    }

    /// Fetch the selected conversation's history and merge it by id. The
    /// merge never discards reactions or derived fields already learned over
    /// the transport, and never duplicates ids. This is the polling backstop
    /// against missed events, not the primary delivery path.
    pub async fn refresh_messages(&self) -> EngineResult<()> {
        let selected = { self.state.read().await.selected };
        let Some(conversation_id) = selected else {
            return Ok(());
        };
        let fetched = self.api.list_messages(conversation_id).await?;
        let mut state = self.state.write().await;
        // Selection may have moved while the fetch was in flight.
        if state.selected == Some(conversation_id) {
            merge_timeline(&mut state.messages, fetched);
        }
        Ok(())
    }

    /// Drive [`refresh_messages`](Self::refresh_messages) on a fixed cadence.
    pub async fn poll_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(MESSAGE_POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if let Err(e) = self.refresh_messages().await {
                debug!(error = %e, "message poll failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound intents
    // ------------------------------------------------------------------

    /// Send a text message to the selected conversation. Connected: the
    /// intent is emitted and the message appears once the server echoes it
    /// back (no local-only optimistic entry, so reconciliation cannot
    /// duplicate ids). Disconnected: the intent is queued durably.
    pub async fn send_text(&self, content: &str, reply_to: Option<Uuid>) -> EngineResult<Uuid> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::BadRequest("message content is empty".into()));
        }
        let mut state = self.state.write().await;
        let conversation_id = state
            .selected
            .ok_or_else(|| EngineError::InvalidState("no conversation selected".into()))?;

        let reply_ref = reply_to.and_then(|id| {
            state.messages.iter().find(|m| m.id == id).map(|m| ReplyRef {
                message_id: id,
                preview: m.content.clone().unwrap_or_default(),
            })
        });

        let message_id = Uuid::new_v4();
        if self.sink.state() == ConnectionState::Connected {
            self.sink.send(ClientEvent::SendMessage {
                message_id,
                conversation_id,
                content: Some(content.to_string()),
                kind: MessageKind::Text,
                media: MediaInfo::default(),
                reply_to: reply_ref,
            })?;
        } else {
            state.queue.enqueue(QueuedMessage::text(
                message_id,
                conversation_id,
                content,
                reply_ref,
            ));
            debug!(%message_id, "transport unavailable, message queued");
        }
        Ok(message_id)
    }

    /// Send a voice note: opaque audio bytes, base64-encoded, one event.
    pub async fn send_voice(&self, audio: &[u8], duration_secs: f32) -> EngineResult<Uuid> {
        if audio.is_empty() {
            return Err(EngineError::BadRequest("voice payload is empty".into()));
        }
        let mut state = self.state.write().await;
        let conversation_id = state
            .selected
            .ok_or_else(|| EngineError::InvalidState("no conversation selected".into()))?;

        let message_id = Uuid::new_v4();
        let audio_base64 = STANDARD.encode(audio);
        if self.sink.state() == ConnectionState::Connected {
            self.sink.send(ClientEvent::SendVoice {
                message_id,
                conversation_id,
                audio_base64,
                duration_secs,
            })?;
        } else {
            state.queue.enqueue(QueuedMessage::voice(
                message_id,
                conversation_id,
                audio_base64,
                duration_secs,
            ));
        }
        Ok(message_id)
    }

    /// Send an image/file message. The blob was already uploaded out of band;
    /// only the resulting URL and metadata travel over the transport.
    pub async fn send_media(&self, kind: MessageKind, media: MediaInfo) -> EngineResult<Uuid> {
        if matches!(kind, MessageKind::Text | MessageKind::Voice) {
            return Err(EngineError::BadRequest(
                "send_media expects an image or file kind".into(),
            ));
        }
        if media.url.is_none() {
            return Err(EngineError::BadRequest("media url is required".into()));
        }
        let mut state = self.state.write().await;
        let conversation_id = state
            .selected
            .ok_or_else(|| EngineError::InvalidState("no conversation selected".into()))?;

        let message_id = Uuid::new_v4();
        if self.sink.state() == ConnectionState::Connected {
            self.sink.send(ClientEvent::SendMessage {
                message_id,
                conversation_id,
                content: None,
                kind,
                media,
                reply_to: None,
            })?;
        } else {
            state
                .queue
                .enqueue(QueuedMessage::media(message_id, conversation_id, kind, media));
        }
        Ok(message_id)
    }

    /// Edit a message in the selected conversation. Local state changes only
    /// on the inbound confirmation.
    pub async fn edit_message(&self, message_id: Uuid, content: &str) -> EngineResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::BadRequest("edited content is empty".into()));
        }
        let state = self.state.read().await;
        let conversation_id = self.owning_conversation(&state, message_id)?;
        self.sink.send(ClientEvent::EditMessage {
            conversation_id,
            message_id,
            content: content.to_string(),
        })
    }

    /// Soft-delete a message in the selected conversation.
    pub async fn delete_message(&self, message_id: Uuid) -> EngineResult<()> {
        let state = self.state.read().await;
        let conversation_id = self.owning_conversation(&state, message_id)?;
        self.sink.send(ClientEvent::DeleteMessage {
            conversation_id,
            message_id,
        })
    }

    /// Add a reaction. Emission only; the reaction list mutates on the
    /// inbound event so it always matches the authoritative multi-user view.
    pub async fn add_reaction(&self, message_id: Uuid, emoji: &str) -> EngineResult<()> {
        let state = self.state.read().await;
        let conversation_id = self.owning_conversation(&state, message_id)?;
        self.sink.send(ClientEvent::AddReaction {
            conversation_id,
            message_id,
            emoji: emoji.to_string(),
        })
    }

    pub async fn remove_reaction(&self, message_id: Uuid, emoji: &str) -> EngineResult<()> {
        let state = self.state.read().await;
        let conversation_id = self.owning_conversation(&state, message_id)?;
        self.sink.send(ClientEvent::RemoveReaction {
            conversation_id,
            message_id,
            emoji: emoji.to_string(),
        })
    }

    /// Typing signal for the selected conversation. `true` is debounced to
    /// one emission per conversation per window by wall-clock comparison;
    /// `false` is never debounced. Best-effort: dropped silently when the
    /// transport is down.
    pub async fn send_typing(&self, is_typing: bool) -> EngineResult<()> {
        let mut state = self.state.write().await;
        let conversation_id = state
            .selected
            .ok_or_else(|| EngineError::InvalidState("no conversation selected".into()))?;

        if is_typing {
            if let Some(last) = state.last_typing_sent.get(&conversation_id) {
                if last.elapsed() < TYPING_DEBOUNCE {
                    return Ok(());
                }
            }
        }
        if self.sink.state() == ConnectionState::Connected {
            let _ = self.sink.send(ClientEvent::Typing {
                conversation_id,
                is_typing,
            });
            // Stamp only on an actual emission; a suppressed send while
            // disconnected must not delay the first one after reconnect.
            if is_typing {
                state.last_typing_sent.insert(conversation_id, Instant::now());
            }
        }
        Ok(())
    }

    /// Batched read marking. Idempotent: already-read ids are filtered out,
    /// and an empty remainder emits nothing. The unread counter clears
    /// optimistically because read state is directional and uncontested.
    pub async fn mark_read(&self, message_ids: &[Uuid]) -> EngineResult<()> {
        let mut state = self.state.write().await;
        let conversation_id = state
            .selected
            .ok_or_else(|| EngineError::InvalidState("no conversation selected".into()))?;

        let now = Utc::now();
        let mut unread: Vec<Uuid> = Vec::new();
        for message in state
            .messages
            .iter_mut()
            .filter(|m| message_ids.contains(&m.id))
        {
            if message.sender_id != self.user_id && message.read_at.is_none() {
                message.read_at = Some(now);
                unread.push(message.id);
            }
        }
        if let Some(conversation) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.unread_count = 0;
        }
        if unread.is_empty() {
            return Ok(());
        }
        if self.sink.state() == ConnectionState::Connected {
            let _ = self.sink.send(ClientEvent::MarkRead {
                conversation_id,
                message_ids: unread,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Offline queue
    // ------------------------------------------------------------------

    /// Re-emit queued intents after a reconnect: first-in-first-out, one
    /// emission per item. An item is removed when its echo (matching id)
    /// arrives; anything unconfirmed after the settle window is retried up to
    /// the cap, then marked failed.
    pub async fn flush_queue(&self) -> EngineResult<()> {
        if self.sink.state() != ConnectionState::Connected {
            return Ok(());
        }
        let pending: Vec<QueuedMessage> = {
            let mut state = self.state.write().await;
            let ids = state.queue.queued_ids();
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                state.queue.mark(id, QueueStatus::Sending);
                if let Some(item) = state.queue.get(id) {
                    items.push(item.clone());
                }
            }
            items
        };
        if pending.is_empty() {
            return Ok(());
        }

        for item in &pending {
            if let Err(e) = self.sink.send(item.to_event()) {
                warn!(id = %item.id, error = %e, "queue flush interrupted");
                let mut state = self.state.write().await;
                state.queue.mark(item.id, QueueStatus::Queued);
                return Err(e);
            }
        }
        debug!(count = pending.len(), "offline queue flushed");

        tokio::time::sleep(QUEUE_SETTLE_DELAY).await;
        let mut state = self.state.write().await;
        state.queue.settle_unconfirmed();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Apply one authoritative inbound event. Call-signaling events are not
    /// handled here; the call engine has its own dispatch.
    pub async fn apply_event(&self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } => self.on_message_new(message).await,
            ServerEvent::MessageEdited {
                conversation_id,
                message_id,
                content,
                edited_at,
            } => {
                let mut state = self.state.write().await;
                if state.selected == Some(*conversation_id) {
                    if let Some(msg) = state.messages.iter_mut().find(|m| m.id == *message_id) {
                        msg.content = Some(content.clone());
                        msg.edited = true;
                        msg.updated_at = Some(*edited_at);
                    }
                }
            }
            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                let mut state = self.state.write().await;
                if state.selected == Some(*conversation_id) {
                    if let Some(msg) = state.messages.iter_mut().find(|m| m.id == *message_id) {
                        msg.content = None;
                        msg.deleted = true;
                    }
                }
            }
            ServerEvent::ReactionAdded {
                conversation_id,
                message_id,
                reaction,
            } => {
                let mut state = self.state.write().await;
                if state.selected == Some(*conversation_id) {
                    if let Some(msg) = state.messages.iter_mut().find(|m| m.id == *message_id) {
                        msg.add_reaction(reaction.clone());
                    }
                }
            }
            ServerEvent::ReactionRemoved {
                conversation_id,
                message_id,
                user_id,
                emoji,
            } => {
                let mut state = self.state.write().await;
                if state.selected == Some(*conversation_id) {
                    if let Some(msg) = state.messages.iter_mut().find(|m| m.id == *message_id) {
                        msg.remove_reaction(*user_id, emoji);
                    }
                }
            }
            ServerEvent::Typing {
                conversation_id,
                user_id,
                user_name,
                is_typing,
            } => {
                if *user_id == self.user_id {
                    return;
                }
                let mut state = self.state.write().await;
                let now = Utc::now();
                state.typing.retain(|t| !t.is_expired(now));
                if *is_typing {
                    let expires_at = now + ChronoDuration::seconds(TYPING_EXPIRY_SECS);
                    match state
                        .typing
                        .iter_mut()
                        .find(|t| t.conversation_id == *conversation_id && t.user_id == *user_id)
                    {
                        Some(existing) => existing.expires_at = expires_at,
                        None => state.typing.push(TypingIndicator {
                            conversation_id: *conversation_id,
                            user_id: *user_id,
                            user_name: user_name.clone(),
                            expires_at,
                        }),
                    }
                } else {
                    state
                        .typing
                        .retain(|t| !(t.conversation_id == *conversation_id && t.user_id == *user_id));
                }
            }
            ServerEvent::ReadReceipt {
                conversation_id,
                reader_id,
                message_ids,
                read_at,
            } => {
                if *reader_id == self.user_id {
                    return;
                }
                let mut state = self.state.write().await;
                if state.selected == Some(*conversation_id) {
                    for msg in state.messages.iter_mut().filter(|m| {
                        m.sender_id == self.user_id && message_ids.contains(&m.id)
                    }) {
                        msg.read_at = Some(*read_at);
                    }
                }
            }
            ServerEvent::CrisisAlert { alert } => {
                let handler = self
                    .crisis_handler
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(handler) = handler.as_ref() {
                    handler(alert);
                }
            }
            ServerEvent::PresenceChanged { record } => {
                let mut state = self.state.write().await;
                apply_presence(&mut state, record.clone());
            }
            ServerEvent::PresenceBulk { records } => {
                let mut state = self.state.write().await;
                for record in records {
                    apply_presence(&mut state, record.clone());
                }
            }
            ServerEvent::BiomarkersReady {
                conversation_id,
                message_id,
                transcript,
                sentiment,
                crisis_level,
                biomarkers,
            } => {
                let mut state = self.state.write().await;
                if state.selected == Some(*conversation_id) {
                    if let Some(msg) = state.messages.iter_mut().find(|m| m.id == *message_id) {
                        if transcript.is_some() {
                            msg.insights.transcript = transcript.clone();
                        }
                        if sentiment.is_some() {
                            msg.insights.sentiment = sentiment.clone();
                        }
                        if crisis_level.is_some() {
                            msg.insights.crisis_level = *crisis_level;
                        }
                        if biomarkers.is_some() {
                            msg.insights.biomarkers = biomarkers.clone();
                        }
                    }
                }
            }
            // Call signaling is the call engine's concern.
            _ => {}
        }
    }

    async fn on_message_new(&self, message: &Message) {
        let mut state = self.state.write().await;

        // Correlate the echo of a queued emission back to its entry.
        if state.queue.remove(message.id) {
            debug!(id = %message.id, "queued message confirmed by echo");
        }

        if state.selected == Some(message.conversation_id) {
            // Reconciliation replaces in place, never duplicates.
            match state.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => *existing = message.clone(),
                None => state.messages.push(message.clone()),
            }
            // A message from someone ends their typing indicator.
            state
                .typing
                .retain(|t| !(t.conversation_id == message.conversation_id && t.user_id == message.sender_id));
        }

        let summary = LastMessage {
            sender_id: message.sender_id,
            content: message.content.clone(),
            kind: message.kind,
            created_at: message.created_at,
        };
        let from_counterpart = message.sender_id != self.user_id;
        let selected = state.selected;
        match state
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            Some(conversation) => {
                conversation.last_message = Some(summary);
                conversation.updated_at = Some(message.created_at);
                if from_counterpart && selected != Some(conversation.id) {
                    conversation.unread_count += 1;
                }
            }
            None if from_counterpart => {
                // Materialize a conversation first seen through an event.
                state.conversations.push(Conversation {
                    id: message.conversation_id,
                    counterpart: Participant {
                        id: message.sender_id,
                        name: message.sender_name.clone(),
                        online: true,
                        last_active: Some(message.created_at),
                    },
                    last_message: Some(summary),
                    unread_count: 1,
                    created_at: message.created_at,
                    updated_at: Some(message.created_at),
                });
            }
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.read().await.conversations.clone()
    }

    pub async fn selected_conversation(&self) -> Option<Uuid> {
        self.state.read().await.selected
    }

    pub async fn timeline(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Unexpired typing indicators for the selected conversation.
    pub async fn typing_users(&self) -> Vec<TypingIndicator> {
        let state = self.state.read().await;
        let now = Utc::now();
        state
            .typing
            .iter()
            .filter(|t| !t.is_expired(now) && state.selected == Some(t.conversation_id))
            .cloned()
            .collect()
    }

    pub async fn presence_of(&self, user_id: Uuid) -> Option<PresenceRecord> {
        self.state.read().await.presence.get(&user_id).cloned()
    }

    pub async fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.state.read().await.queue.snapshot()
    }

    fn owning_conversation(&self, state: &ChatState, message_id: Uuid) -> EngineResult<Uuid> {
        let conversation_id = state
            .selected
            .ok_or_else(|| EngineError::InvalidState("no conversation selected".into()))?;
        if !state.messages.iter().any(|m| m.id == message_id) {
            return Err(EngineError::InvalidState(
                "message does not belong to the selected conversation".into(),
            ));
        }
        Ok(conversation_id)
    }
}

fn apply_presence(state: &mut ChatState, record: PresenceRecord) {
    // Cascade into any conversation whose counterpart matches.
    for conversation in state
        .conversations
        .iter_mut()
        .filter(|c| c.counterpart.id == record.user_id)
    {
        conversation.counterpart.online = record.status.is_online();
        conversation.counterpart.last_active = record.last_seen;
    }
    state.presence.insert(record.user_id, record);
}

/// Merge a REST fetch into the live timeline. The fetch is the base ordering;
/// reactions, derived fields and soft-delete state learned over the transport
/// in the interim are kept, and local-only entries (e.g. fresh echoes) are
/// appended rather than dropped.
fn merge_timeline(local: &mut Vec<Message>, fetched: Vec<Message>) {
    let mut merged: Vec<Message> = Vec::with_capacity(fetched.len());
    for mut incoming in fetched {
        if let Some(existing) = local.iter().find(|m| m.id == incoming.id) {
            for reaction in &existing.reactions {
                if !incoming
                    .reactions
                    .iter()
                    .any(|r| r.user_id == reaction.user_id && r.emoji == reaction.emoji)
                {
                    incoming.reactions.push(reaction.clone());
                }
            }
            if incoming.insights.transcript.is_none() {
                incoming.insights.transcript = existing.insights.transcript.clone();
            }
            if incoming.insights.sentiment.is_none() {
                incoming.insights.sentiment = existing.insights.sentiment.clone();
            }
            if incoming.insights.crisis_level.is_none() {
                incoming.insights.crisis_level = existing.insights.crisis_level;
            }
            if incoming.insights.biomarkers.is_none() {
                incoming.insights.biomarkers = existing.insights.biomarkers.clone();
            }
            if existing.deleted {
                incoming.deleted = true;
                incoming.content = None;
            }
            incoming.edited |= existing.edited;
            if incoming.read_at.is_none() {
                incoming.read_at = existing.read_at;
            }
        }
        merged.push(incoming);
    }
    for leftover in local.drain(..) {
        if !merged.iter().any(|m| m.id == leftover.id) {
            merged.push(leftover);
        }
    }
    *local = merged;
}
