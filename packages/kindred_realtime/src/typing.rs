//! Typing Debouncer
//!
//! Collapses bursty keystrokes into at most two signals per typing episode:
//!
//! - `Idle -> Typing` on the first keystroke: fire `Start` once
//! - `Typing -> Typing` on further keystrokes: push the trailing deadline out
//! - `Typing -> Idle` when the deadline passes, or on explicit stop: fire `Stop` once
//!
//! [`TypingState`] is the pure state machine. [`spawn_typing_debouncer`] runs it
//! in a task that owns the timer and delivers signals to a [`TypingSink`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RealtimeError;

/// Quiet period after the last keystroke before typing stops
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_millis(1000);

/// Outbound typing signal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

impl TypingSignal {
    pub fn is_typing(self) -> bool {
        matches!(self, TypingSignal::Start)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Typing { deadline: Instant },
}

/// Idle/Typing state machine with a trailing-edge deadline
#[derive(Clone, Debug)]
pub struct TypingState {
    phase: Phase,
    idle_after: Duration,
}

impl TypingState {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            idle_after,
        }
    }

    pub fn on_keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        let deadline = now + self.idle_after;
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Typing { deadline };
                Some(TypingSignal::Start)
            }
            Phase::Typing { .. } => {
                self.phase = Phase::Typing { deadline };
                None
            }
        }
    }

    /// Timer wake-up. Fires `Stop` only if the deadline has really passed.
    pub fn on_timer(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.phase {
            Phase::Typing { deadline } if deadline <= now => {
                self.phase = Phase::Idle;
                Some(TypingSignal::Stop)
            }
            _ => None,
        }
    }

    /// Force `Typing -> Idle`. No-op when already idle.
    pub fn stop(&mut self) -> Option<TypingSignal> {
        match self.phase {
            Phase::Typing { .. } => {
                self.phase = Phase::Idle;
                Some(TypingSignal::Stop)
            }
            Phase::Idle => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Typing { deadline } => Some(deadline),
            Phase::Idle => None,
        }
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.phase, Phase::Typing { .. })
    }
}

/// Where typing signals go (a broadcast on the conversation channel, usually)
#[async_trait]
pub trait TypingSink: Send + Sync {
    async fn send(&self, is_typing: bool) -> Result<(), RealtimeError>;
}

#[derive(Debug)]
enum TypingCommand {
    Keystroke,
    Stop { respond_to: oneshot::Sender<()> },
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Handle to a running debouncer task
#[derive(Clone)]
pub struct TypingDebouncer {
    sender: mpsc::Sender<TypingCommand>,
}

impl TypingDebouncer {
    /// Report a keystroke-like event
    pub async fn keystroke(&self) -> Result<(), RealtimeError> {
        self.sender
            .send(TypingCommand::Keystroke)
            .await
            .map_err(|_| RealtimeError::ActorStopped("typing debouncer"))
    }

    /// Stop typing now (e.g. on send). Resolves once any `Stop` has been delivered.
    pub async fn stop_typing(&self) -> Result<(), RealtimeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TypingCommand::Stop { respond_to: tx })
            .await
            .map_err(|_| RealtimeError::ActorStopped("typing debouncer"))?;
        rx.await
            .map_err(|_| RealtimeError::ActorStopped("typing debouncer"))
    }

    /// Stop typing if needed and end the task.
    pub async fn shutdown(&self) -> Result<(), RealtimeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TypingCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| RealtimeError::ActorStopped("typing debouncer"))?;
        rx.await
            .map_err(|_| RealtimeError::ActorStopped("typing debouncer"))
    }
}

async fn deliver(sink: &Arc<dyn TypingSink>, signal: TypingSignal) {
    debug!("Typing signal {:?}", signal);
    if let Err(e) = sink.send(signal.is_typing()).await {
        warn!("Failed to deliver typing signal {:?}: {}", signal, e);
    }
}

/// Spawn a debouncer task delivering to `sink`.
pub fn spawn_typing_debouncer(sink: Arc<dyn TypingSink>, idle_after: Duration) -> TypingDebouncer {
    let (sender, mut receiver) = mpsc::channel::<TypingCommand>(64);

    tokio::spawn(async move {
        let mut state = TypingState::new(idle_after);

        loop {
            // A disabled select branch still evaluates its future, so it needs
            // some instant even when idle.
            let deadline = state.deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + idle_after);

            tokio::select! {
                command = receiver.recv() => match command {
                    Some(TypingCommand::Keystroke) => {
                        if let Some(signal) = state.on_keystroke(Instant::now()) {
                            deliver(&sink, signal).await;
                        }
                    }
                    Some(TypingCommand::Stop { respond_to }) => {
                        if let Some(signal) = state.stop() {
                            deliver(&sink, signal).await;
                        }
                        let _ = respond_to.send(());
                    }
                    Some(TypingCommand::Shutdown { respond_to }) => {
                        if let Some(signal) = state.stop() {
                            deliver(&sink, signal).await;
                        }
                        let _ = respond_to.send(());
                        break;
                    }
                    None => {
                        if let Some(signal) = state.stop() {
                            deliver(&sink, signal).await;
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    if let Some(signal) = state.on_timer(Instant::now()) {
                        deliver(&sink, signal).await;
                    }
                }
            }
        }
        debug!("Typing debouncer stopped");
    });

    TypingDebouncer { sender }
}
