use serde::{Deserialize, Serialize};

/// Call lifecycle states.
///
/// `Idle -> Calling -> Connecting -> Connected -> Reconnecting` on the caller
/// side, `Idle -> Incoming -> Connecting -> ...` on the callee side. The four
/// terminal states only return to `Idle` through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Calling,
    Incoming,
    Connecting,
    Connected,
    Reconnecting,
    Ended,
    Declined,
    Missed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Incoming => "incoming",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Ended => "ended",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Declined | Self::Missed | Self::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Advisory media flags exchanged between peers. Informational only, never
/// enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStateFlags {
    pub muted: bool,
    pub camera_off: bool,
    pub screen_sharing: bool,
}
