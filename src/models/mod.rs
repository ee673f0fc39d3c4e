pub mod call;
pub mod conversation;
pub mod message;
pub mod presence;

pub use call::{CallDirection, CallStatus, MediaStateFlags};
pub use conversation::{Conversation, LastMessage, Participant};
pub use message::{
    DerivedInsights, GroupedReaction, MediaInfo, Message, MessageKind, Reaction, ReplyRef,
    TypingIndicator,
};
pub use presence::{PresenceRecord, PresenceStatus};
