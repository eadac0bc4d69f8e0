use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use url::Url;

use crate::error::ConnectionError;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub auth_url: String,
    pub translation_url: String,
    pub connection: ConnectionSettings,
    pub banner_duration: Duration,
    pub create_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub server_url: String,
    /// Retries after the first failed attempt before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub event_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5001".into(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(3000),
            event_buffer: 256,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5001".into(),
            auth_url: "http://localhost:5001".into(),
            translation_url: "http://127.0.0.1:5000".into(),
            connection: ConnectionSettings::default(),
            banner_duration: Duration::from_secs(20),
            create_timeout: Duration::from_secs(10),
        }
    }
}

/// Loads settings from `client.toml` in the working directory, then applies
/// environment overrides.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new("client.toml"))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, &file_cfg),
            Err(err) => tracing::warn!(path = %path.display(), "config: ignoring unreadable file: {err}"),
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings.connection.server_url = settings.server_url.clone();
    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    let text = |key: &str| file_cfg.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let number = |key: &str| file_cfg.get(key).and_then(|v| v.as_integer()).and_then(|v| u64::try_from(v).ok());

    if let Some(v) = text("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = text("auth_url") {
        settings.auth_url = v;
    }
    if let Some(v) = text("translation_url") {
        settings.translation_url = v;
    }
    if let Some(v) = number("reconnect_attempts") {
        settings.connection.reconnect_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = number("reconnect_delay_ms") {
        settings.connection.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = number("banner_seconds") {
        settings.banner_duration = Duration::from_secs(v);
    }
    if let Some(v) = number("create_timeout_seconds") {
        settings.create_timeout = Duration::from_secs(v);
    }
}

fn apply_env_settings(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__AUTH_URL") {
        settings.auth_url = v;
    }
    if let Some(v) = var("APP__TRANSLATION_URL") {
        settings.translation_url = v;
    }
    if let Some(v) = var("APP__RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.connection.reconnect_attempts = v;
    }
    if let Some(v) = var("APP__RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.connection.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = var("APP__BANNER_SECONDS").and_then(|v| v.parse().ok()) {
        settings.banner_duration = Duration::from_secs(v);
    }
    if let Some(v) = var("APP__CREATE_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
        settings.create_timeout = Duration::from_secs(v);
    }
}

/// Derives the websocket endpoint from the chat server's http(s) base url.
pub fn websocket_url(server_url: &str) -> Result<Url, ConnectionError> {
    let invalid = |reason: &str| ConnectionError::InvalidUrl {
        url: server_url.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(server_url.trim()).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("scheme must be http, https, ws or wss")),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("scheme cannot be changed"))?;

    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Reads settings from an explicit file and fails when it cannot be parsed.
pub fn load_settings_strict(path: &Path) -> anyhow::Result<ClientSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(&raw)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))?;

    let mut settings = ClientSettings::default();
    apply_file_settings(&mut settings, &file_cfg);
    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings.connection.server_url = settings.server_url.clone();
    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
