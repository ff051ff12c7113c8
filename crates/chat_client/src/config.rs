use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::retry::RetryPolicy;

const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub api_base_url: String,
    pub ws_url: Option<String>,
    pub bearer_token: Option<String>,
    pub history_limit: u32,
    pub retry: RetryPolicy,
    pub typing_timeout: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:5000/api".into(),
            ws_url: None,
            bearer_token: None,
            history_limit: 100,
            retry: RetryPolicy::default(),
            typing_timeout: Duration::from_secs(1),
        }
    }
}

impl ChatSettings {
    /// The configured websocket endpoint, or one derived from the API URL.
    pub fn websocket_url(&self) -> Option<String> {
        self.ws_url
            .clone()
            .or_else(|| derive_ws_url(&self.api_base_url))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    ws_url: Option<String>,
    bearer_token: Option<String>,
    history_limit: Option<u32>,
    retry_max_attempts: Option<u32>,
    retry_interval_ms: Option<u64>,
    retry_backoff_factor: Option<f64>,
    typing_timeout_ms: Option<u64>,
}

pub fn load_settings() -> ChatSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Layers `path` (if readable) and then environment overrides on top of the
/// defaults. `env` is injectable so tests do not touch the process environment.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ChatSettings {
    let mut settings = ChatSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), %err, "ignoring malformed chat settings file"),
        }
    }

    if let Some(v) = env("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("CHAT_WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_url = Some(v);
    }

    if let Some(v) = env("APP__BEARER_TOKEN") {
        settings.bearer_token = Some(v);
    }

    if let Some(v) = env("APP__HISTORY_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_limit = parsed;
        }
    }

    if let Some(v) = env("APP__RETRY_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.retry.max_attempts = parsed;
        }
    }

    if let Some(v) = env("APP__RETRY_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.retry.check_interval = Duration::from_millis(parsed);
        }
    }

    if let Some(v) = env("APP__TYPING_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.typing_timeout = Duration::from_millis(parsed);
        }
    }

    settings
}

fn apply_file_settings(settings: &mut ChatSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.ws_url {
        settings.ws_url = Some(v);
    }
    if let Some(v) = file_cfg.bearer_token {
        settings.bearer_token = Some(v);
    }
    if let Some(v) = file_cfg.history_limit {
        settings.history_limit = v;
    }
    if let Some(v) = file_cfg.retry_max_attempts {
        settings.retry.max_attempts = v;
    }
    if let Some(v) = file_cfg.retry_interval_ms {
        settings.retry.check_interval = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.retry_backoff_factor {
        settings.retry = settings.retry.with_backoff(v, settings.retry.max_delay);
    }
    if let Some(v) = file_cfg.typing_timeout_ms {
        settings.typing_timeout = Duration::from_millis(v);
    }
}

/// `http://host:port/api` -> `ws://host:port/ws`.
pub fn derive_ws_url(api_base_url: &str) -> Option<String> {
    let api_base_url = api_base_url.trim();
    let (scheme, rest) = if let Some(rest) = api_base_url.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return None;
    };
    let authority = rest.split('/').next().filter(|host| !host.is_empty())?;
    Some(format!("{scheme}://{authority}/ws"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
