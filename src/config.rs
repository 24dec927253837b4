//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! timing constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Gemini API key
    pub gemini_api_key: Option<String>,

    /// Comma-separated list of user IDs allowed to use the bot
    #[serde(rename = "allowed_users", default)]
    pub allowed_users_str: Option<String>,

    /// Comma-separated list of chat IDs (groups) where everyone may use the bot
    #[serde(rename = "allowed_chats", default)]
    pub allowed_chats_str: Option<String>,

    /// Gemini model used for generation and editing
    #[serde(default = "default_imagen_model")]
    pub imagen_model: String,

    /// How long a command waits for the first attachment
    #[serde(default = "default_image_wait_timeout_secs")]
    pub image_wait_timeout_secs: u64,

    /// Quiet period that closes a burst of attachments
    #[serde(default = "default_burst_quiet_window_ms")]
    pub burst_quiet_window_ms: u64,

    /// Refresh period of standing typing indicators
    #[serde(default = "default_typing_refresh_secs")]
    pub typing_refresh_secs: u64,

    /// HTTP timeout for a single Gemini request
    #[serde(default = "default_gemini_http_timeout_secs")]
    pub gemini_http_timeout_secs: u64,
}

fn default_imagen_model() -> String {
    DEFAULT_IMAGEN_MODEL.to_string()
}

const fn default_image_wait_timeout_secs() -> u64 {
    IMAGE_WAIT_TIMEOUT_SECS
}

const fn default_burst_quiet_window_ms() -> u64 {
    BURST_QUIET_WINDOW_MS
}

const fn default_typing_refresh_secs() -> u64 {
    TYPING_REFRESH_SECS
}

const fn default_gemini_http_timeout_secs() -> u64 {
    GEMINI_HTTP_TIMEOUT_SECS
}

/// Parses a list of IDs separated by commas, semicolons or whitespace.
/// Tokens that are not valid integers are skipped.
fn parse_id_list(raw: Option<&String>) -> HashSet<i64> {
    raw.map(|s| {
        s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter_map(|id| id.parse::<i64>().ok())
            .collect()
    })
    .unwrap_or_default()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use imagen_bot::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Eg. `APP__IMAGEN_MODEL=... ./target/app`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE variables; empty values count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?
            .try_deserialize()
    }

    /// Returns the set of user IDs allowed to use the bot
    #[must_use]
    pub fn allowed_users(&self) -> HashSet<i64> {
        parse_id_list(self.allowed_users_str.as_ref())
    }

    /// Returns the set of chat IDs where every member may use the bot
    #[must_use]
    pub fn allowed_chats(&self) -> HashSet<i64> {
        parse_id_list(self.allowed_chats_str.as_ref())
    }

    /// Whether a message from `user_id` in `chat_id` should be handled.
    ///
    /// With no allow-lists configured the bot is open to everyone.
    #[must_use]
    pub fn is_allowed(&self, user_id: i64, chat_id: i64) -> bool {
        let users = self.allowed_users();
        let chats = self.allowed_chats();
        if users.is_empty() && chats.is_empty() {
            return true;
        }
        users.contains(&user_id) || chats.contains(&chat_id)
    }

    /// Long ceiling for the first attachment of a collection.
    #[must_use]
    pub const fn image_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.image_wait_timeout_secs)
    }

    /// Quiet window that ends a burst of attachments.
    #[must_use]
    pub const fn burst_quiet_window(&self) -> Duration {
        Duration::from_millis(self.burst_quiet_window_ms)
    }

    /// Interval at which standing typing indicators are re-sent.
    #[must_use]
    pub const fn typing_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.typing_refresh_secs)
    }

    /// Timeout for one Gemini HTTP request.
    #[must_use]
    pub const fn gemini_http_timeout(&self) -> Duration {
        Duration::from_secs(self.gemini_http_timeout_secs)
    }
}

/// Default Gemini model for image generation
pub const DEFAULT_IMAGEN_MODEL: &str = "gemini-3-pro-image-preview";
/// Default wait for the first attachment (3 minutes)
pub const IMAGE_WAIT_TIMEOUT_SECS: u64 = 180;
/// Default quiet window closing a burst of attachments
pub const BURST_QUIET_WINDOW_MS: u64 = 1000;
/// Default typing indicator refresh period. Telegram expires the indicator after ~5s.
pub const TYPING_REFRESH_SECS: u64 = 4;
/// Default timeout for one Gemini request; image generation is slow
pub const GEMINI_HTTP_TIMEOUT_SECS: u64 = 300;

/// Telegram API retry configuration
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff between Telegram API retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound for the backoff between Telegram API retries
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;

/// Largest file the Bot API lets us download (20 MB)
pub const TELEGRAM_MAX_DOWNLOAD_SIZE: u32 = 20 * 1024 * 1024;
/// Telegram limit for media captions
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;
/// Telegram limit for items in one media group
pub const TELEGRAM_MEDIA_GROUP_LIMIT: usize = 10;
