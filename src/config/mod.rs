//! Configuration loading
//!
//! Typed JSON configuration with per-field defaults, environment variable
//! overrides, and startup validation. Every knob has a production-ready
//! default so an empty (or absent) config file yields a working bot.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fetch::FetchPolicy;
use crate::logging::targets;
use crate::transfer::TransferMode;

/// Env var that points directly at a config file.
const ENV_CONFIG_PATH: &str = "CLIPFERRY_CONFIG_PATH";
/// Env var that points at the state directory holding `clipferry.json`.
const ENV_STATE_DIR: &str = "CLIPFERRY_STATE_DIR";
/// Env var override for the Telegram bot token.
const ENV_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
/// Env var override for the session cookie file.
const ENV_COOKIE_FILE: &str = "CLIPFERRY_COOKIE_FILE";
/// Env var that switches logging to the development profile.
const ENV_DEV_MODE: &str = "CLIPFERRY_DEV";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("failed to parse config file {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// Get the config file path.
/// Priority: CLIPFERRY_CONFIG_PATH > CLIPFERRY_STATE_DIR/clipferry.json > ~/.clipferry/clipferry.json
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(ENV_CONFIG_PATH) {
        return PathBuf::from(path);
    }

    if let Ok(state_dir) = env::var(ENV_STATE_DIR) {
        return PathBuf::from(state_dir).join("clipferry.json");
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clipferry")
        .join("clipferry.json")
}

/// Whether the bot runs in development mode (plaintext debug logging).
pub fn dev_mode() -> bool {
    env::var(ENV_DEV_MODE).is_ok()
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub telegram: TelegramSection,
    pub extractor: ExtractorSection,
    pub governor: GovernorSection,
    pub fetch: FetchSection,
    pub transfer: TransferSection,
    pub delivery: DeliverySection,
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelegramSection {
    /// Bot token; normally supplied via TELEGRAM_BOT_TOKEN instead.
    pub bot_token: String,
    /// Bot API base URL, overridable for self-hosted API servers.
    pub api_base_url: String,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: "https://api.telegram.org".to_string(),
        }
    }
}

/// Extraction service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorSection {
    /// Base URL of the metadata extraction service.
    pub base_url: String,
    /// Per-attempt request timeout in milliseconds.
    pub attempt_timeout_ms: u64,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            base_url: "https://extract.clipferry.app".to_string(),
            attempt_timeout_ms: 15_000,
        }
    }
}

impl ExtractorSection {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Concurrency ceilings and slot hygiene.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GovernorSection {
    /// Maximum users served concurrently.
    pub user_slots: usize,
    /// Maximum concurrent media downloads.
    pub download_slots: usize,
    /// Maximum concurrent uploads to the messaging service.
    pub upload_slots: usize,
    /// Age after which a held user slot is considered leaked.
    pub slot_stale_after_secs: u64,
    /// How often the stale-slot sweep runs.
    pub sweep_interval_secs: u64,
    /// TCP connect timeout for the shared HTTP client.
    pub connect_timeout_ms: u64,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            user_slots: 5,
            download_slots: 3,
            upload_slots: 2,
            slot_stale_after_secs: 300,
            sweep_interval_secs: 30,
            connect_timeout_ms: 10_000,
        }
    }
}

impl GovernorSection {
    pub fn slot_stale_after(&self) -> Duration {
        Duration::from_secs(self.slot_stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Metadata fetch tiers, retry budgets, and backoff.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSection {
    /// Attempts against the primary extraction tier.
    pub primary_attempts: u32,
    /// Attempts against the secondary extraction tier.
    pub secondary_attempts: u32,
    /// Whether the secondary tier is consulted at all.
    pub fallback_enabled: bool,
    /// `sequential` tries primary then secondary; `race` runs both.
    pub policy: FetchPolicy,
    /// Head start given to the primary tier when racing.
    pub race_grace_ms: u64,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Ceiling for the retry delay.
    pub backoff_cap_ms: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            primary_attempts: 3,
            secondary_attempts: 2,
            fallback_enabled: true,
            policy: FetchPolicy::Sequential,
            race_grace_ms: 1_500,
            backoff_base_ms: 500,
            backoff_cap_ms: 10_000,
        }
    }
}

impl FetchSection {
    pub fn race_grace(&self) -> Duration {
        Duration::from_millis(self.race_grace_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

/// Media download behavior and payload policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransferSection {
    /// How downloaded payloads are held: `file`, `stream`, or `buffer`.
    pub mode: TransferMode,
    /// Attempts per media URL.
    pub attempts: u32,
    /// Whole-download timeout per attempt in milliseconds.
    pub timeout_ms: u64,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Ceiling for the retry delay.
    pub backoff_cap_ms: u64,
    /// Payloads smaller than this are treated as error pages, not media.
    pub min_payload_bytes: u64,
    /// Hard ceiling on payload size; larger downloads are aborted.
    pub max_payload_bytes: u64,
    /// Directory for file-mode temp files.
    pub media_dir: PathBuf,
    /// Age after which a leftover temp file is swept.
    pub orphan_ttl_secs: u64,
    /// How often the orphan sweep runs.
    pub orphan_sweep_interval_secs: u64,
    /// Optional file holding a session cookie for credentialed retries.
    pub cookie_file: Option<PathBuf>,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            mode: TransferMode::File,
            attempts: 3,
            timeout_ms: 60_000,
            backoff_base_ms: 750,
            backoff_cap_ms: 15_000,
            min_payload_bytes: 1024,
            max_payload_bytes: 50 * 1024 * 1024,
            media_dir: env::temp_dir().join("clipferry-media"),
            orphan_ttl_secs: 3600,
            orphan_sweep_interval_secs: 300,
            cookie_file: None,
        }
    }
}

impl TransferSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_secs)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs)
    }
}

/// Delivery-side behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliverySection {
    /// Upload timeout in milliseconds; uploads run far longer than API calls.
    pub upload_timeout_ms: u64,
    /// Delete the triggering message in group chats after delivery.
    pub auto_delete_trigger: bool,
    /// Delay before the triggering message is deleted.
    pub trigger_delete_delay_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            upload_timeout_ms: 120_000,
            auto_delete_trigger: true,
            trigger_delete_delay_secs: 30,
        }
    }
}

impl DeliverySection {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn trigger_delete_delay(&self) -> Duration {
        Duration::from_secs(self.trigger_delete_delay_secs)
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file is not an error; defaults plus environment overrides
    /// are used instead.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&get_config_path())
    }

    /// Load configuration from a specific path, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let parsed: Config =
                serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            debug!(target: targets::CONFIG, path = %path.display(), "config file loaded");
            parsed
        } else {
            debug!(target: targets::CONFIG, path = %path.display(), "config file absent, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides on top of file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var(ENV_BOT_TOKEN) {
            if !token.trim().is_empty() {
                self.telegram.bot_token = token.trim().to_string();
            }
        }
        if let Ok(path) = env::var(ENV_COOKIE_FILE) {
            if !path.trim().is_empty() {
                self.transfer.cookie_file = Some(PathBuf::from(path.trim()));
            }
        }
    }

    /// Validate invariants that would otherwise surface as confusing runtime
    /// failures.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "telegram.bot_token is empty (set it in the config file or via {ENV_BOT_TOKEN})"
                ),
            });
        }
        if self.governor.user_slots == 0
            || self.governor.download_slots == 0
            || self.governor.upload_slots == 0
        {
            return Err(ConfigError::Invalid {
                message: "governor slot counts must all be at least 1".to_string(),
            });
        }
        if self.fetch.primary_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "fetch.primary_attempts must be at least 1".to_string(),
            });
        }
        if self.fetch.fallback_enabled && self.fetch.secondary_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "fetch.secondary_attempts must be at least 1 when fallback is enabled"
                    .to_string(),
            });
        }
        if self.transfer.attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "transfer.attempts must be at least 1".to_string(),
            });
        }
        if self.transfer.min_payload_bytes >= self.transfer.max_payload_bytes {
            return Err(ConfigError::Invalid {
                message: "transfer.min_payload_bytes must be below max_payload_bytes".to_string(),
            });
        }
        Ok(())
    }

    /// Read the session cookie, if a cookie file is configured and readable.
    ///
    /// Failures are logged, never fatal: the bot degrades to anonymous
    /// downloads.
    pub fn load_cookie(&self) -> Option<String> {
        let path = self.transfer.cookie_file.as_ref()?;
        match fs::read_to_string(path) {
            Ok(raw) => {
                let cookie = raw.trim();
                if cookie.is_empty() {
                    warn!(target: targets::CONFIG, path = %path.display(), "cookie file is empty, ignoring");
                    None
                } else {
                    info!(target: targets::CONFIG, path = %path.display(), "session cookie loaded");
                    Some(cookie.to_string())
                }
            }
            Err(e) => {
                warn!(target: targets::CONFIG, path = %path.display(), error = %e, "failed to read cookie file, continuing without");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Mutex to serialize tests that modify global state (env vars).
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_STATE_DIR);
        env::remove_var(ENV_BOT_TOKEN);
        env::remove_var(ENV_COOKIE_FILE);
    }

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.telegram.api_base_url, "https://api.telegram.org");
        assert_eq!(config.governor.user_slots, 5);
        assert!(config.governor.download_slots < config.governor.user_slots);
        assert!(config.governor.upload_slots < config.governor.user_slots);
        assert_eq!(config.fetch.policy, FetchPolicy::Sequential);
        assert!(config.fetch.fallback_enabled);
        assert_eq!(config.transfer.mode, TransferMode::File);
        assert!(config.transfer.min_payload_bytes < config.transfer.max_payload_bytes);
    }

    #[test]
    fn test_config_path_precedence() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        env::set_var(ENV_CONFIG_PATH, "/tmp/custom.json");
        assert_eq!(get_config_path(), PathBuf::from("/tmp/custom.json"));
        env::remove_var(ENV_CONFIG_PATH);

        env::set_var(ENV_STATE_DIR, "/tmp/state");
        assert_eq!(get_config_path(), PathBuf::from("/tmp/state/clipferry.json"));
        env::remove_var(ENV_STATE_DIR);

        let home_path = get_config_path();
        assert!(home_path.ends_with(".clipferry/clipferry.json"));
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = Config::load_from(Path::new("/nonexistent/clipferry.json")).unwrap();
        assert_eq!(config.governor.user_slots, 5);
        assert!(config.telegram.bot_token.is_empty());
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"governor": {{"user_slots": 9}}, "fetch": {{"policy": "race"}}}}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.governor.user_slots, 9);
        assert_eq!(config.fetch.policy, FetchPolicy::Race);
        // Untouched sections keep defaults
        assert_eq!(config.governor.download_slots, 3);
        assert_eq!(config.transfer.mode, TransferMode::File);
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_env_token_overrides_file() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"telegram": {{"bot_token": "from-file"}}}}"#).unwrap();

        env::set_var(ENV_BOT_TOKEN, "from-env");
        let config = Config::load_from(file.path()).unwrap();
        env::remove_var(ENV_BOT_TOKEN);

        assert_eq!(config.telegram.bot_token, "from-env");
    }

    #[test]
    fn test_validate_requires_token() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bot_token"));
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let mut config = Config::default();
        config.telegram.bot_token = "123:abc".to_string();
        config.governor.download_slots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_payload_bounds() {
        let mut config = Config::default();
        config.telegram.bot_token = "123:abc".to_string();
        config.transfer.min_payload_bytes = 100;
        config.transfer.max_payload_bytes = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        let mut config = Config::default();
        config.telegram.bot_token = "123:abc".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_cookie_trims_and_requires_content() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  sessionid=abc123  ").unwrap();

        let mut config = Config::default();
        config.transfer.cookie_file = Some(file.path().to_path_buf());
        assert_eq!(config.load_cookie().as_deref(), Some("sessionid=abc123"));

        let empty = NamedTempFile::new().unwrap();
        config.transfer.cookie_file = Some(empty.path().to_path_buf());
        assert_eq!(config.load_cookie(), None);

        config.transfer.cookie_file = Some(PathBuf::from("/nonexistent/cookie.txt"));
        assert_eq!(config.load_cookie(), None);
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.fetch.backoff_base(), Duration::from_millis(500));
        assert_eq!(config.governor.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.delivery.upload_timeout(), Duration::from_secs(120));
    }
}
