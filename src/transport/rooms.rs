//! Room membership tracking.
//!
//! One slot per [`RoomKind`]: changing the slot always emits a leave for the
//! old room before the join for the new one. Joins are deferred (not queued)
//! while the transport is disconnected; [`RoomMembership::resync`] re-joins
//! the recorded slots after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::protocol::{ClientEvent, RoomKind};
use crate::transport::{ConnectionState, EventSink};

pub struct RoomMembership {
    sink: Arc<dyn EventSink>,
    slots: Mutex<HashMap<RoomKind, Uuid>>,
}

impl RoomMembership {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Move the slot for `kind` to `id`. `None` leaves the current room
    /// without joining another.
    pub fn set_room(&self, kind: RoomKind, id: Option<Uuid>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = slots.get(&kind).copied();
        if previous == id {
            return;
        }

        let connected = self.sink.state() == ConnectionState::Connected;
        if let Some(old) = previous {
            if connected {
                let _ = self.sink.send(ClientEvent::LeaveRoom { kind, id: old });
            }
            slots.remove(&kind);
        }
        if let Some(new) = id {
            slots.insert(kind, new);
            if connected {
                let _ = self.sink.send(ClientEvent::JoinRoom { kind, id: new });
            } else {
                debug!(?kind, %new, "transport not connected, join deferred");
            }
        }
    }

    /// Leave every active slot (e.g. on sign-out).
    pub fn leave_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let connected = self.sink.state() == ConnectionState::Connected;
        for (kind, id) in slots.drain() {
            if connected {
                let _ = self.sink.send(ClientEvent::LeaveRoom { kind, id });
            }
        }
    }

    /// Re-join the recorded slots after a reconnect.
    pub fn resync(&self) {
        if self.sink.state() != ConnectionState::Connected {
            return;
        }
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (kind, id) in slots.iter() {
            let _ = self.sink.send(ClientEvent::JoinRoom {
                kind: *kind,
                id: *id,
            });
        }
    }

    pub fn current(&self, kind: RoomKind) -> Option<Uuid> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .copied()
    }
}
