//! Configuration system (layered: defaults < config file < env < code).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::playback::{DEFAULT_FRAMES_TARGET, DEFAULT_FRAME_INTERVAL};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Connection and playback settings for a chat pipeline.
///
/// Durations are stored in milliseconds so the TOML file stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    #[builder(default = default_base_url())]
    pub base_url: String,
    #[builder(default = "/chat/stream".to_string())]
    pub stream_path: String,
    #[builder(default = "/chat".to_string())]
    pub json_path: String,
    #[builder(default = "/chat/upload".to_string())]
    pub upload_path: String,
    pub api_token: Option<String>,
    #[builder(default = 30_000)]
    pub connect_timeout_ms: u64,
    #[builder(default = 120_000)]
    pub response_timeout_ms: u64,
    #[builder(default = DEFAULT_FRAMES_TARGET)]
    pub frames_target: usize,
    #[builder(default = DEFAULT_FRAME_INTERVAL.as_millis() as u64)]
    pub frame_interval_ms: u64,
    /// Shown when the server answers with nothing at all.
    #[builder(default = default_no_response_text())]
    pub no_response_text: String,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_no_response_text() -> String {
    "No response received.".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ChatConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ChatError> {
        toml::from_str(text).map_err(|e| ChatError::Configuration(format!("Invalid config: {e}")))
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Platform config file location (e.g. `~/.config/chatstream/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "chatstream").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Defaults, then the config file if present, then environment variables.
    pub fn discover() -> Result<Self, ChatError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let config = match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };
        config.apply_env()
    }

    /// Load from environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ChatError> {
        let _ = dotenvy::dotenv();
        Self::default().apply_env()
    }

    /// Override fields from `CHATSTREAM_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ChatError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Override fields from an arbitrary variable lookup.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self, ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHATSTREAM_BASE_URL") {
            self.base_url = url;
        }
        if let Some(token) = lookup("CHATSTREAM_API_TOKEN") {
            self.api_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(text) = lookup("CHATSTREAM_NO_RESPONSE_TEXT") {
            self.no_response_text = text;
        }
        if let Some(ms) = parse_env(&lookup, "CHATSTREAM_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = ms;
        }
        if let Some(frames) = parse_env(&lookup, "CHATSTREAM_FRAMES_TARGET")? {
            self.frames_target = frames;
        }
        if let Some(ms) = parse_env(&lookup, "CHATSTREAM_FRAME_INTERVAL_MS")? {
            self.frame_interval_ms = ms;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.base_url.trim().is_empty() {
            return Err(ChatError::Configuration("base_url must not be empty".into()));
        }
        if self.frames_target == 0 {
            return Err(ChatError::Configuration("frames_target must be at least 1".into()));
        }
        if self.frame_interval_ms == 0 {
            return Err(ChatError::Configuration(
                "frame_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ChatError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ChatError::Configuration(format!("{key}={raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ChatConfig::default();
        assert_eq!(config.frames_target, 40);
        assert_eq!(config.frame_interval_ms, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let config = ChatConfig::from_toml_str("base_url = \"http://file\"\nframes_target = 10")
            .unwrap()
            .apply_env_with(lookup_from(&[
                ("CHATSTREAM_BASE_URL", "http://env"),
                ("CHATSTREAM_FRAME_INTERVAL_MS", "33"),
            ]))
            .unwrap();
        assert_eq!(config.base_url, "http://env");
        assert_eq!(config.frames_target, 10);
        assert_eq!(config.frame_interval_ms, 33);
    }

    #[test]
    fn malformed_env_number_is_a_configuration_error() {
        let err = ChatConfig::default()
            .apply_env_with(lookup_from(&[("CHATSTREAM_FRAMES_TARGET", "many")]))
            .unwrap_err();
        assert!(matches!(err, ChatError::Configuration(_)));
    }

    #[test]
    fn zero_frames_target_is_rejected() {
        let config = ChatConfig::builder().frames_target(0).build();
        assert!(config.validate().is_err());
    }
}
