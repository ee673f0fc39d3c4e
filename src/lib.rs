//! Client-side realtime core for one-to-one coaching conversations.
//!
//! Two engines share one owned event transport: [`chat::ChatEngine`] keeps
//! conversation and timeline state consistent across disconnects through a
//! durable offline queue and a polling backstop, and [`call::CallEngine`]
//! drives the WebRTC call lifecycle behind platform trait seams. The embedder
//! owns the [`transport::TransportConnection`], fans its inbound events out to
//! both engines and renders from their snapshots.

pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod rest;
pub mod transport;

pub use call::{CallEngine, CallSnapshot, CALL_ANSWER_TIMEOUT};
pub use chat::ChatEngine;
pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use queue::{JsonFileStore, MemoryStore, OfflineQueue, QueueStatus, QueueStore};
pub use rest::{ApiClient, ConversationApi};
pub use transport::{ConnectionState, EventSink, RoomMembership, TransportConnection};
