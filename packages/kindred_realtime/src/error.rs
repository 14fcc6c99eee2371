/// Errors raised by realtime transports and the components built on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    /// The channel was closed (locally or by the transport)
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The transport refused or failed to open a channel
    #[error("subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    /// An outbound payload could not be delivered
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A background actor is gone
    #[error("actor stopped: {0}")]
    ActorStopped(&'static str),
}

impl RealtimeError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ChannelClosed(_) => "channel_closed",
            Self::SubscribeFailed { .. } => "subscribe_failed",
            Self::SendFailed(_) => "send_failed",
            Self::ActorStopped(_) => "actor_stopped",
        }
    }

    /// Transport hiccups are expected to clear on the transport's own reconnect.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::ActorStopped(_))
    }
}
