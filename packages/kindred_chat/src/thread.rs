//! Conversation thread lifecycle
//!
//! Each open conversation owns one realtime channel. Its lifecycle is a
//! single reducer over tagged phases, so channel callbacks only ever feed
//! events in and never resubscribe on their own:
//!
//! ```text
//!            Open              Subscribed
//!   Idle ──────────▶ Subscribing ─────────▶ Live
//!    ▲                │   ▲                  │
//!    │ Failed         │   └── Disconnected ──┤
//!    ├────────────────┘                      │ Close
//!    │        Closed                         ▼
//!    └──────────────────────────────── Closing
//! ```

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPhase {
    #[default]
    Idle,
    Subscribing,
    Live,
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadEvent {
    /// The view opened the conversation
    Open,
    /// The transport confirmed the channel
    Subscribed,
    /// The transport lost the connection and is reconnecting
    Disconnected,
    /// Opening the channel failed
    Failed,
    /// The view is going away
    Close,
    /// The channel is torn down
    Closed,
}

impl ThreadPhase {
    pub fn is_live(self) -> bool {
        self == ThreadPhase::Live
    }

    /// Whether the thread holds (or is acquiring) a channel
    pub fn is_open(self) -> bool {
        matches!(self, ThreadPhase::Subscribing | ThreadPhase::Live)
    }
}

/// Next phase for `event`. Events that make no sense in a phase leave it unchanged.
pub fn reduce(phase: ThreadPhase, event: ThreadEvent) -> ThreadPhase {
    use ThreadEvent as E;
    use ThreadPhase as P;

    match (phase, event) {
        (P::Idle | P::Closing, E::Open) => P::Subscribing,
        (P::Subscribing, E::Subscribed) => P::Live,
        (P::Subscribing, E::Failed) => P::Idle,
        (P::Live, E::Disconnected) => P::Subscribing,
        (P::Subscribing | P::Live, E::Close) => P::Closing,
        (_, E::Closed) => P::Idle,
        (phase, _) => phase,
    }
}
