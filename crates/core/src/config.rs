use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Allowlist of sender user IDs. Empty = allow all.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Upper bound on concurrently running browser processes. Session
    /// starts beyond this queue rather than fail.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub headed: bool,
    /// Explicit browser binary path; auto-detected when unset.
    #[serde(default)]
    pub binary: Option<String>,
}

fn default_max_concurrency() -> usize {
    10
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            headed: false,
            binary: None,
        }
    }
}

/// CSS selectors for the companion app's login flow and message surface.
/// These are the entire contract with the page; a markup change on the
/// far side breaks the integration silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelectors {
    #[serde(default = "default_email_field")]
    pub email_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
    #[serde(default = "default_advance_button")]
    pub advance_button: String,
    /// Shared by the username and password stages; the two are told apart
    /// purely by pipeline position.
    #[serde(default = "default_error_indicator")]
    pub error_indicator: String,
    /// Unique to the authenticated app state; doubles as the login
    /// success indicator and the session-restore verification probe.
    #[serde(default = "default_message_input")]
    pub message_input: String,
    #[serde(default = "default_upload_input")]
    pub upload_input: String,
    /// Message list container, used by the DOM-polling observer.
    #[serde(default = "default_message_list")]
    pub message_list: String,
}

fn default_email_field() -> String {
    "#emailOrPhone".to_string()
}

fn default_password_field() -> String {
    "#login-password".to_string()
}

fn default_advance_button() -> String {
    "button[data-testid=\"login-next-button\"]".to_string()
}

fn default_error_indicator() -> String {
    "[data-testid=\"login-error\"]".to_string()
}

fn default_message_input() -> String {
    "#send-message-textarea".to_string()
}

fn default_upload_input() -> String {
    "#upload-image-to-chat".to_string()
}

fn default_message_list() -> String {
    "div[data-testid=\"chat-messages\"]".to_string()
}

impl Default for TargetSelectors {
    fn default() -> Self {
        Self {
            email_field: default_email_field(),
            password_field: default_password_field(),
            advance_button: default_advance_button(),
            error_indicator: default_error_indicator(),
            message_input: default_message_input(),
            upload_input: default_upload_input(),
            message_list: default_message_list(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default)]
    pub selectors: TargetSelectors,
    /// Short race window for the login error indicator.
    #[serde(default = "default_error_timeout_ms")]
    pub error_timeout_ms: u64,
    /// Longer window for the authenticated-state indicator.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Relay cycle throttle. Removing this would hammer the page.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bounded wait for the upload control to appear before a round of
    /// image uploads is skipped.
    #[serde(default = "default_upload_wait_ms")]
    pub upload_wait_ms: u64,
    /// Wait after initiating an upload before the file is considered sent.
    #[serde(default = "default_upload_settle_ms")]
    pub upload_settle_ms: u64,
    /// Consecutive reload-recovery failures tolerated before the session
    /// is ended instead of looping forever on a broken page.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Incoming-message observation strategy: "socket" or "poll".
    #[serde(default = "default_observer")]
    pub observer: String,
}

fn default_base_url() -> String {
    "https://my.replika.ai".to_string()
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_error_timeout_ms() -> u64 {
    1500
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_upload_wait_ms() -> u64 {
    1500
}

fn default_upload_settle_ms() -> u64 {
    1500
}

fn default_max_recovery_attempts() -> u32 {
    5
}

fn default_observer() -> String {
    "socket".to_string()
}

impl TargetConfig {
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.login_path)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            login_path: default_login_path(),
            selectors: TargetSelectors::default(),
            error_timeout_ms: default_error_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            upload_wait_ms: default_upload_wait_ms(),
            upload_settle_ms: default_upload_settle_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            observer: default_observer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    /// Attachment size cap in bytes.
    #[serde(default = "default_max_media_bytes")]
    pub max_bytes: u64,
}

fn default_max_media_bytes() -> u64 {
    8 * 1024 * 1024
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_media_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.browser.max_concurrency, 10);
        assert!(!config.browser.headed);
        assert_eq!(config.target.poll_interval_ms, 3000);
        assert_eq!(config.target.upload_wait_ms, 1500);
        assert_eq!(config.target.upload_settle_ms, 1500);
        assert_eq!(config.target.observer, "socket");
        assert_eq!(config.target.login_url(), "https://my.replika.ai/login");
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.channels.discord.bot_token = "tok".to_string();
        config.browser.max_concurrency = 3;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.channels.discord.bot_token, "tok");
        assert_eq!(loaded.browser.max_concurrency, 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"channels": {"discord": {"enabled": true, "botToken": "t"}}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.channels.discord.enabled);
        assert_eq!(config.target.selectors.message_input, "#send-message-textarea");
        assert_eq!(config.target.max_recovery_attempts, 5);
    }
}
