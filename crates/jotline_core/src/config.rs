//! Runtime configuration.
//!
//! # Responsibility
//! - Resolve endpoints, autosave timing and assistant settings from the
//!   environment, falling back to built-in defaults.
//!
//! # Invariants
//! - Values are trimmed; empty variables count as unset.
//! - Invalid values are reported, never silently replaced by defaults.

use crate::editor::entry_editor::SaveConfig;
use once_cell::sync::Lazy;
use reqwest::Url;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const ENV_API_BASE_URL: &str = "JOTLINE_API_BASE_URL";
pub const ENV_SAVE_DEBOUNCE_MS: &str = "JOTLINE_SAVE_DEBOUNCE_MS";
pub const ENV_CHAT_API_KEY: &str = "GLM_API_KEY";
pub const ENV_CHAT_BASE_URL: &str = "GLM_API_KEY_BASE_URL";
pub const ENV_CHAT_MODEL: &str = "JOTLINE_CHAT_MODEL";

pub const DEFAULT_CHAT_MODEL: &str = "glm-4.7";
const MAX_SAVE_DEBOUNCE_MS: u64 = 60_000;

static DEFAULT_API_BASE_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("http://localhost:3001/").expect("valid default api url"));
static DEFAULT_CHAT_BASE_URL: Lazy<Url> = Lazy::new(|| {
    Url::parse("https://open.bigmodel.cn/api/coding/paas/v4").expect("valid default chat url")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidUrl { var: &'static str, value: String },
    InvalidDuration { var: &'static str, value: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl { var, value } => write!(f, "{var} is not a valid url: `{value}`"),
            Self::InvalidDuration { var, value } => write!(
                f,
                "{var} must be milliseconds between 0 and {MAX_SAVE_DEBOUNCE_MS}: `{value}`"
            ),
        }
    }
}

impl Error for ConfigError {}

/// Assistant endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub base_url: Url,
    /// `None` disables assistant features.
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CHAT_BASE_URL.clone(),
            api_key: None,
            model: DEFAULT_CHAT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Origin serving both the write API and the change feed.
    pub api_base_url: Url,
    pub save: SaveConfig,
    pub chat: ChatSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.clone(),
            save: SaveConfig::default(),
            chat: ChatSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();
        if let Some(value) = read(ENV_API_BASE_URL) {
            config.api_base_url = parse_url(ENV_API_BASE_URL, value)?;
        }
        if let Some(value) = read(ENV_SAVE_DEBOUNCE_MS) {
            config.save.debounce = parse_debounce(value)?;
        }
        if let Some(value) = read(ENV_CHAT_BASE_URL) {
            config.chat.base_url = parse_url(ENV_CHAT_BASE_URL, value)?;
        }
        config.chat.api_key = read(ENV_CHAT_API_KEY);
        if let Some(value) = read(ENV_CHAT_MODEL) {
            config.chat.model = value;
        }
        Ok(config)
    }

    pub fn with_api_base_url(mut self, url: Url) -> Self {
        self.api_base_url = url;
        self
    }
}

fn parse_url(var: &'static str, value: String) -> Result<Url, ConfigError> {
    match Url::parse(&value) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(ConfigError::InvalidUrl { var, value }),
    }
}

fn parse_debounce(value: String) -> Result<Duration, ConfigError> {
    match value.parse::<u64>() {
        Ok(ms) if ms <= MAX_SAVE_DEBOUNCE_MS => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::InvalidDuration {
            var: ENV_SAVE_DEBOUNCE_MS,
            value,
        }),
    }
}
