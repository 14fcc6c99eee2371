use kindred_realtime::{ActivityConfig, PresenceConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::store::StoreConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / kindred.toml / env vars)
// =============================================================================
//
//   kindred.toml:    [presence]
//                    heartbeat_secs = 15
//
//   env var:         KINDRED_PRESENCE__HEARTBEAT_SECS=15   (double underscore = nesting)

pub const CONFIG_FILE: &str = "kindred.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub presence: PresenceFileConfig,
    #[serde(default)]
    pub typing: TypingFileConfig,
    #[serde(default)]
    pub chat: ChatFileConfig,
}

/// Presence tunables (lives under `[presence]` in kindred.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceFileConfig {
    /// Topic of the shared presence group
    #[serde(default = "default_presence_channel")]
    pub channel: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_interaction_debounce_secs")]
    pub interaction_debounce_secs: u64,
    /// Inactivity before announcing away
    #[serde(default = "default_away_after_secs")]
    pub away_after_secs: u64,
}

impl Default for PresenceFileConfig {
    fn default() -> Self {
        Self {
            channel: default_presence_channel(),
            heartbeat_secs: default_heartbeat_secs(),
            interaction_debounce_secs: default_interaction_debounce_secs(),
            away_after_secs: default_away_after_secs(),
        }
    }
}

/// Typing tunables (lives under `[typing]` in kindred.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingFileConfig {
    /// Quiet period before an outbound "stopped typing"
    #[serde(default = "default_typing_idle_ms")]
    pub idle_ms: u64,
    /// Age at which an inbound "typing" without a stop is ignored
    #[serde(default = "default_typing_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for TypingFileConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_typing_idle_ms(),
            stale_after_ms: default_typing_stale_after_ms(),
        }
    }
}

/// Chat tunables (lives under `[chat]` in kindred.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ChatFileConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_presence_channel() -> String {
    "online-users".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_interaction_debounce_secs() -> u64 {
    10
}

fn default_away_after_secs() -> u64 {
    300
}

fn default_typing_idle_ms() -> u64 {
    1000
}

fn default_typing_stale_after_ms() -> u64 {
    5000
}

fn default_page_size() -> usize {
    crate::store::DEFAULT_PAGE_SIZE
}

/// Build a figment that layers: defaults → kindred.toml → KINDRED_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `KINDRED_TYPING__IDLE_MS=750`  →  `typing.idle_ms = 750`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE)))
        .merge(Env::prefixed("KINDRED_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub presence: PresenceConfig,
    pub activity: ActivityConfig,
    pub typing_idle: Duration,
    pub typing_stale_after: Duration,
    pub store: StoreConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl SessionConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let away_after = Duration::from_secs(fc.presence.away_after_secs);
        let activity_defaults = ActivityConfig::default();
        Self {
            presence: PresenceConfig {
                topic: fc.presence.channel.clone(),
                heartbeat: Duration::from_secs(fc.presence.heartbeat_secs.max(1)),
                interaction_debounce: Duration::from_secs(fc.presence.interaction_debounce_secs),
            },
            activity: ActivityConfig {
                away_after,
                // Check often enough to notice a short threshold
                check_every: activity_defaults
                    .check_every
                    .min(away_after / 4)
                    .max(Duration::from_secs(1)),
            },
            typing_idle: Duration::from_millis(fc.typing.idle_ms),
            typing_stale_after: Duration::from_millis(fc.typing.stale_after_ms),
            store: StoreConfig {
                page_size: fc.chat.page_size.max(1),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.presence.channel, "online-users");
        assert_eq!(fc.presence.heartbeat_secs, 30);
        assert_eq!(fc.presence.interaction_debounce_secs, 10);
        assert_eq!(fc.presence.away_after_secs, 300);
        assert_eq!(fc.typing.idle_ms, 1000);
        assert_eq!(fc.typing.stale_after_ms, 5000);
        assert_eq!(fc.chat.page_size, 50);
    }

    #[test]
    fn test_session_config_from_file() {
        let sc = SessionConfig::default();
        assert_eq!(sc.presence.heartbeat, Duration::from_secs(30));
        assert_eq!(sc.activity.away_after, Duration::from_secs(300));
        assert_eq!(sc.activity.check_every, Duration::from_secs(15));
        assert_eq!(sc.typing_idle, Duration::from_millis(1000));
        assert_eq!(sc.store.page_size, 50);
    }

    #[test]
    fn test_short_away_threshold_checks_more_often() {
        let mut fc = FileConfig::default();
        fc.presence.away_after_secs = 8;
        let sc = SessionConfig::from_file(&fc);
        assert_eq!(sc.activity.check_every, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let mut fc = FileConfig::default();
        fc.presence.heartbeat_secs = 0;
        fc.chat.page_size = 0;
        let sc = SessionConfig::from_file(&fc);
        assert_eq!(sc.presence.heartbeat, Duration::from_secs(1));
        assert_eq!(sc.store.page_size, 1);
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.presence.heartbeat_secs, 30);
        assert_eq!(fc.chat.page_size, 50);
    }

    #[test]
    fn test_load_config_toml_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "[presence]\nheartbeat_secs = 15\nchannel = \"lobby\"\n\n[typing]\nidle_ms = 750\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.presence.heartbeat_secs, 15);
        assert_eq!(fc.presence.channel, "lobby");
        // Untouched fields keep their defaults
        assert_eq!(fc.presence.away_after_secs, 300);
        assert_eq!(fc.typing.idle_ms, 750);
        assert_eq!(fc.typing.stale_after_ms, 5000);
    }

    #[test]
    fn test_load_config_env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(CONFIG_FILE, "[chat]\npage_size = 20\n")?;
            jail.set_env("KINDRED_CHAT__PAGE_SIZE", "25");
            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.chat.page_size, 25);
            Ok(())
        });
    }
}
