//! The single shared bidirectional event connection.
//!
//! `TransportConnection` is an owned value injected into the engines behind
//! the [`EventSink`] trait; there is no process-global connection. Connection
//! failures are folded into the observable [`ConnectionState`] so UI layers
//! can degrade gracefully (chat falls back to the offline queue) instead of
//! catching exceptions. Reconnection is explicitly caller-driven: on an
//! unexpected server-initiated disconnect the state becomes `Disconnected`
//! and the caller re-invokes [`TransportConnection::connect`] with a fresh
//! token when it wants the link back.

pub mod rooms;

pub use rooms::RoomMembership;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::protocol::{decode_server_event, encode_client_event, ClientEvent, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

/// The seam the engines talk through. `TransportConnection` is the production
/// implementation; tests substitute a recording fake.
pub trait EventSink: Send + Sync {
    fn send(&self, event: ClientEvent) -> EngineResult<()>;
    fn state(&self) -> ConnectionState;
}

struct TransportInner {
    ws_url: String,
    state: RwLock<ConnectionState>,
    last_error: Mutex<Option<String>>,
    out_tx: Mutex<Option<UnboundedSender<WsMessage>>>,
    events_tx: UnboundedSender<ServerEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every connect/disconnect so a stale reader task from a
    /// previous connection cannot clobber the current state.
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<TransportInner>,
}

impl TransportConnection {
    /// Create the connection handle and the inbound event stream. The
    /// receiver stays valid across reconnects.
    pub fn new(ws_url: impl Into<String>) -> (Self, UnboundedReceiver<ServerEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        let inner = Arc::new(TransportInner {
            ws_url: ws_url.into(),
            state: RwLock::new(ConnectionState::Idle),
            last_error: Mutex::new(None),
            out_tx: Mutex::new(None),
            events_tx,
            tasks: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        });
        (Self { inner }, events_rx)
    }

    /// Establish the websocket exactly once. Calls while already connecting
    /// or connected are no-ops.
    pub async fn connect(&self, auth_token: &str) -> EngineResult<()> {
        {
            let mut state = write_lock(&self.inner.state);
            match *state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                _ => *state = ConnectionState::Connecting,
            }
        }
        self.abort_tasks();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let url = format!("{}?token={}", self.inner.ws_url, auth_token);
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                let reason = e.to_string();
                *write_lock(&self.inner.state) = ConnectionState::Disconnected;
                *lock(&self.inner.last_error) = Some(reason.clone());
                warn!(error = %reason, "transport connect failed");
                return Err(EngineError::Transport(reason));
            }
        };

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Connected must be observable before the reader runs, so a server
        // that closes immediately cannot have its Disconnected write
        // overwritten by this connect call.
        *lock(&self.inner.out_tx) = Some(out_tx);
        *lock(&self.inner.last_error) = None;
        *write_lock(&self.inner.state) = ConnectionState::Connected;

        let inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            let mut close_reason: Option<String> = None;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(raw)) => match decode_server_event(raw.as_str()) {
                        Ok(event) => {
                            if inner.events_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping malformed inbound frame");
                        }
                    },
                    Ok(WsMessage::Close(_)) => {
                        close_reason = Some("connection closed by server".to_string());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        close_reason = Some(e.to_string());
                        break;
                    }
                }
            }
            // Only surface the drop if this is still the live connection.
            if inner.generation.load(Ordering::SeqCst) == generation {
                *write_lock(&inner.state) = ConnectionState::Disconnected;
                *lock(&inner.last_error) =
                    Some(close_reason.unwrap_or_else(|| "connection closed".to_string()));
                lock(&inner.out_tx).take();
                debug!("transport disconnected");
            }
        });

        lock(&self.inner.tasks).extend([writer, reader]);
        debug!("transport connected");
        Ok(())
    }

    /// Tear down and reset synchronously.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.abort_tasks();
        lock(&self.inner.out_tx).take();
        *write_lock(&self.inner.state) = ConnectionState::Idle;
        *lock(&self.inner.last_error) = None;
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    fn abort_tasks(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }
}

impl EventSink for TransportConnection {
    fn send(&self, event: ClientEvent) -> EngineResult<()> {
        if *read_lock(&self.inner.state) != ConnectionState::Connected {
            return Err(EngineError::NotConnected);
        }
        let payload = encode_client_event(&event)?;
        let guard = lock(&self.inner.out_tx);
        match guard.as_ref() {
            Some(tx) if tx.send(WsMessage::text(payload)).is_ok() => Ok(()),
            _ => Err(EngineError::Transport("connection closed".into())),
        }
    }

    fn state(&self) -> ConnectionState {
        *read_lock(&self.inner.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}
