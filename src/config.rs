use crate::defaults;
use crate::error::{CoraError, Result};
use crate::machine::MachineConfig;
use crate::session::Mood;
use crate::voice::catalog::Quality;
use crate::voice::select::VoicePreference;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `timing.max_speech_retries`.
const RETRY_LIMIT: u32 = 10;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub voice: VoiceConfig,
    pub timing: TimingConfig,
    pub conversation: ConversationConfig,
}

/// Remote endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Session lifecycle HTTP service
    pub base_url: String,
    /// Conversation channel (WebSocket)
    pub channel_url: String,
    pub request_timeout_secs: u64,
}

/// Speech and voice selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoiceConfig {
    pub locale: String,
    pub preference: VoicePreference,
    pub quality: Quality,
    pub auto_speak: bool,
}

/// Turn-taking timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub quiet_period_ms: u64,
    pub retry_backoff_ms: u64,
    pub max_speech_retries: u32,
    pub max_capture_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConversationConfig {
    /// Mood for new sessions
    pub mood: Mood,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::DEFAULT_ENGINE_URL.to_string(),
            channel_url: defaults::DEFAULT_CHANNEL_URL.to_string(),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            locale: defaults::DEFAULT_LOCALE.to_string(),
            preference: VoicePreference::Random,
            quality: Quality::Premium,
            auto_speak: true,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: defaults::QUIET_PERIOD_MS,
            retry_backoff_ms: defaults::RETRY_BACKOFF_MS,
            max_speech_retries: defaults::MAX_SPEECH_RETRIES,
            max_capture_errors: defaults::MAX_CAPTURE_ERRORS,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - CORA_ENGINE_URL → engine.base_url
    /// - CORA_CHANNEL_URL → engine.channel_url
    /// - CORA_VOICE → voice.preference
    /// - CORA_LOCALE → voice.locale
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("CORA_ENGINE_URL")
            && !url.is_empty()
        {
            self.engine.base_url = url;
        }

        if let Ok(url) = std::env::var("CORA_CHANNEL_URL")
            && !url.is_empty()
        {
            self.engine.channel_url = url;
        }

        if let Ok(voice) = std::env::var("CORA_VOICE")
            && let Ok(preference) = voice.parse()
        {
            self.voice.preference = preference;
        }

        if let Ok(locale) = std::env::var("CORA_LOCALE")
            && !locale.is_empty()
        {
            self.voice.locale = locale;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/coravoice/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("coravoice")
            .join("config.toml")
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !has_scheme(&self.engine.base_url, &["http", "https"]) {
            return Err(invalid(
                "engine.base_url",
                format!("expected an http(s) URL, got '{}'", self.engine.base_url),
            ));
        }
        if !has_scheme(&self.engine.channel_url, &["ws", "wss"]) {
            return Err(invalid(
                "engine.channel_url",
                format!("expected a ws(s) URL, got '{}'", self.engine.channel_url),
            ));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(invalid("engine.request_timeout_secs", "must be at least 1"));
        }
        if self.voice.locale.trim().is_empty() {
            return Err(invalid("voice.locale", "must not be empty"));
        }
        if self.timing.quiet_period_ms == 0 {
            return Err(invalid(
                "timing.quiet_period_ms",
                "must be greater than zero or capture would hear its own speech",
            ));
        }
        if self.timing.max_speech_retries > RETRY_LIMIT {
            return Err(invalid(
                "timing.max_speech_retries",
                format!("at most {} retries are allowed", RETRY_LIMIT),
            ));
        }
        if self.timing.max_capture_errors == 0 {
            return Err(invalid("timing.max_capture_errors", "must be at least 1"));
        }
        Ok(())
    }

    /// Turn-taking settings for the voice machine.
    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            quiet_period: Duration::from_millis(self.timing.quiet_period_ms),
            retry_backoff: Duration::from_millis(self.timing.retry_backoff_ms),
            max_speech_retries: self.timing.max_speech_retries,
            max_capture_errors: self.timing.max_capture_errors,
            auto_speak: self.voice.auto_speak,
        }
    }

    /// Read one value by dotted path, e.g. `voice.locale`.
    pub fn get_value_by_path(&self, key: &str) -> Result<String> {
        let tree = toml::Value::try_from(self)
            .map_err(|e| CoraError::Other(format!("failed to serialize config: {}", e)))?;
        let value = lookup(&tree, key).ok_or_else(|| unknown_key(key))?;
        Ok(match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Table(table) => toml::to_string_pretty(table)
                .map_err(|e| CoraError::Other(format!("failed to render {}: {}", key, e)))?,
            other => other.to_string(),
        })
    }

    /// Write one value into the file at `path`, keeping everything else in it.
    ///
    /// The result must still load and validate; otherwise the file is left untouched.
    pub fn set_value_by_path(path: &Path, key: &str, raw: &str) -> Result<()> {
        let defaults = toml::Value::try_from(Config::default())
            .map_err(|e| CoraError::Other(format!("failed to serialize config: {}", e)))?;
        let Some(current) = lookup(&defaults, key) else {
            return Err(unknown_key(key));
        };
        if current.is_table() {
            return Err(invalid(key, "is a section; set one of its keys instead"));
        }

        let mut document: toml::Table = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
            Err(e) => return Err(e.into()),
        };
        insert(&mut document, key, typed_value(current, raw, key)?)?;

        let rendered = toml::to_string_pretty(&document)
            .map_err(|e| CoraError::Other(format!("failed to render config: {}", e)))?;
        let config: Config = toml::from_str(&rendered).map_err(|e| invalid(key, e.message()))?;
        config.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Full configuration as TOML.
    pub fn to_display_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CoraError::Other(format!("failed to render config: {}", e)))
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    url.split_once("://").is_some_and(|(scheme, rest)| {
        schemes.contains(&scheme) && !rest.is_empty() && !rest.starts_with('/')
    })
}

fn invalid(key: &str, message: impl Into<String>) -> CoraError {
    CoraError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn unknown_key(key: &str) -> CoraError {
    invalid(key, "unknown configuration key")
}

fn lookup<'a>(tree: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.').try_fold(tree, |node, part| node.get(part))
}

/// Parse `raw` as the same TOML type as the default at `key`.
fn typed_value(template: &toml::Value, raw: &str, key: &str) -> Result<toml::Value> {
    let value = match template {
        toml::Value::Boolean(_) => raw
            .parse::<bool>()
            .map(toml::Value::Boolean)
            .map_err(|_| invalid(key, format!("expected true or false, got '{}'", raw)))?,
        toml::Value::Integer(_) => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|_| invalid(key, format!("expected an integer, got '{}'", raw)))?,
        toml::Value::Float(_) => raw
            .parse::<f64>()
            .map(toml::Value::Float)
            .map_err(|_| invalid(key, format!("expected a number, got '{}'", raw)))?,
        _ => toml::Value::String(raw.to_string()),
    };
    Ok(value)
}

fn insert(document: &mut toml::Table, key: &str, value: toml::Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let Some(leaf) = parts.pop() else {
        return Err(unknown_key(key));
    };
    let mut table = document;
    for part in parts {
        let entry = table
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        table = entry
            .as_table_mut()
            .ok_or_else(|| invalid(key, format!("'{}' is not a section", part)))?;
    }
    table.insert(leaf.to_string(), value);
    Ok(())
}
