//! Activity Monitor
//!
//! Caller-side away detection. The presence tracker never demotes anyone on
//! its own; this monitor watches local interactions (pointer, key, scroll,
//! touch) and tells the tracker when the user has gone quiet for longer than
//! the inactivity threshold, and when they come back.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::PresenceStatus;
use crate::presence::PresenceTracker;

/// Inactivity before the user is announced as away
pub const DEFAULT_AWAY_AFTER: Duration = Duration::from_secs(5 * 60);

/// A local user interaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interaction {
    Pointer,
    Key,
    Scroll,
    Touch,
}

/// Pure Active/Away state machine
#[derive(Debug)]
pub struct ActivityMonitor {
    away_after: Duration,
    last_activity: Instant,
    status: PresenceStatus,
}

impl ActivityMonitor {
    pub fn new(away_after: Duration, now: Instant) -> Self {
        Self {
            away_after,
            last_activity: now,
            status: PresenceStatus::Online,
        }
    }

    /// Record an interaction. Returns `Some(Online)` when this ends an away period.
    pub fn record_activity(&mut self, now: Instant) -> Option<PresenceStatus> {
        self.last_activity = now;
        if self.status == PresenceStatus::Away {
            self.status = PresenceStatus::Online;
            Some(PresenceStatus::Online)
        } else {
            None
        }
    }

    /// Check the inactivity threshold. Returns `Some(Away)` on demotion.
    pub fn poll(&mut self, now: Instant) -> Option<PresenceStatus> {
        let idle = now.saturating_duration_since(self.last_activity);
        if self.status == PresenceStatus::Online && idle >= self.away_after {
            self.status = PresenceStatus::Away;
            Some(PresenceStatus::Away)
        } else {
            None
        }
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }
}

/// Configuration for the activity monitor task
#[derive(Clone, Debug)]
pub struct ActivityConfig {
    pub away_after: Duration,
    /// How often the inactivity threshold is checked
    pub check_every: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            away_after: DEFAULT_AWAY_AFTER,
            check_every: Duration::from_secs(15),
        }
    }
}

/// Spawn the monitor task. Interactions are forwarded to the tracker as
/// debounced touches; status changes are announced explicitly.
///
/// The task ends when `interactions` closes or `cancel` fires.
pub fn spawn_activity_monitor(
    tracker: Arc<PresenceTracker>,
    mut interactions: mpsc::Receiver<Interaction>,
    config: ActivityConfig,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = ActivityMonitor::new(config.away_after, Instant::now());
        let mut check = tokio::time::interval(config.check_every);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                interaction = interactions.recv() => {
                    let Some(interaction) = interaction else {
                        break;
                    };
                    if let Some(status) = monitor.record_activity(Instant::now()) {
                        debug!("Activity ({:?}) ended away period", interaction);
                        tracker.announce(status).await;
                    } else {
                        tracker.record_interaction().await;
                    }
                }
                _ = check.tick() => {
                    if let Some(status) = monitor.poll(Instant::now()) {
                        debug!("No activity for {:?}, announcing away", config.away_after);
                        tracker.announce(status).await;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use crate::presence::PresenceConfig;
    use crate::subscription::SubscriptionManager;

    #[test]
    fn test_demotes_after_threshold() {
        let start = Instant::now();
        let mut monitor = ActivityMonitor::new(DEFAULT_AWAY_AFTER, start);

        assert_eq!(monitor.poll(start + Duration::from_secs(299)), None);
        assert_eq!(
            monitor.poll(start + Duration::from_secs(300)),
            Some(PresenceStatus::Away)
        );
        // Already away: no repeat
        assert_eq!(monitor.poll(start + Duration::from_secs(600)), None);
    }

    #[test]
    fn test_activity_resets_and_returns_online() {
        let start = Instant::now();
        let mut monitor = ActivityMonitor::new(DEFAULT_AWAY_AFTER, start);

        assert_eq!(monitor.record_activity(start + Duration::from_secs(200)), None);
        assert_eq!(monitor.poll(start + Duration::from_secs(400)), None);

        monitor.poll(start + Duration::from_secs(500));
        assert_eq!(monitor.status(), PresenceStatus::Away);
        assert_eq!(
            monitor.record_activity(start + Duration::from_secs(501)),
            Some(PresenceStatus::Online)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_task_announces_away_and_back() {
        let hub = MemoryHub::new();
        let tracker = Arc::new(PresenceTracker::new(
            "alice",
            PresenceConfig::default(),
            Arc::new(hub.clone()),
            Arc::new(SubscriptionManager::new()),
        ));
        tracker.start().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn_activity_monitor(
            tracker.clone(),
            rx,
            ActivityConfig::default(),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(320)).await;
        assert_eq!(tracker.status().await, PresenceStatus::Away);

        tx.send(Interaction::Key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.status().await, PresenceStatus::Online);

        cancel.cancel();
        handle.await.unwrap();
    }
}
