//! User preferences: where the API key and sampling settings come from.

use crate::providers::ProviderError;
use crate::types::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the API key stored in the config file.
pub const API_KEY_ENV: &str = "MINIMAX_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("MiniMax API key is not configured")]
    MissingApiKey,

    #[error("Unsupported temperature {0:?} (expected 0.3, 0.7, 1.0 or 1.5)")]
    InvalidTemperature(String),

    #[error("Unsupported max tokens {0:?} (expected 1024, 2048, 4096 or 8192)")]
    InvalidMaxTokens(String),
}

impl From<ConfigError> for ProviderError {
    fn from(e: ConfigError) -> Self {
        let message = e.to_string();
        match e {
            ConfigError::MissingApiKey => ProviderError::Auth(message),
            _ => ProviderError::generic(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

/// Sampling temperature, limited to the presets the preferences offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Temperature {
    Precise,
    #[default]
    Balanced,
    Creative,
    Wild,
}

impl Temperature {
    pub const ALL: [Temperature; 4] = [
        Temperature::Precise,
        Temperature::Balanced,
        Temperature::Creative,
        Temperature::Wild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Temperature::Precise => "0.3",
            Temperature::Balanced => "0.7",
            Temperature::Creative => "1.0",
            Temperature::Wild => "1.5",
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Temperature::Precise => 0.3,
            Temperature::Balanced => 0.7,
            Temperature::Creative => 1.0,
            Temperature::Wild => 1.5,
        }
    }
}

impl std::str::FromStr for Temperature {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidTemperature(s.to_string()))
    }
}

impl TryFrom<String> for Temperature {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Temperature> for String {
    fn from(t: Temperature) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response length budget, limited to the presets the preferences offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MaxTokens {
    Short,
    Medium,
    #[default]
    Long,
    Extended,
}

impl MaxTokens {
    pub const ALL: [MaxTokens; 4] = [MaxTokens::Short, MaxTokens::Medium, MaxTokens::Long, MaxTokens::Extended];

    pub fn value(&self) -> u64 {
        match self {
            MaxTokens::Short => 1024,
            MaxTokens::Medium => 2048,
            MaxTokens::Long => 4096,
            MaxTokens::Extended => 8192,
        }
    }
}

impl std::str::FromStr for MaxTokens {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        s.parse::<u64>()
            .ok()
            .and_then(|n| Self::ALL.into_iter().find(|m| m.value() == n))
            .ok_or_else(|| ConfigError::InvalidMaxTokens(s.to_string()))
    }
}

impl TryFrom<String> for MaxTokens {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MaxTokens> for String {
    fn from(m: MaxTokens) -> Self {
        m.value().to_string()
    }
}

impl fmt::Display for MaxTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Temperature,
    #[serde(default)]
    pub max_tokens: MaxTokens,
    #[serde(default = "default_stream_responses")]
    pub stream_responses: bool,
}

fn default_stream_responses() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            system_prompt: None,
            temperature: Temperature::default(),
            max_tokens: MaxTokens::default(),
            stream_responses: default_stream_responses(),
        }
    }
}

impl Preferences {
    /// Provider settings for one call. Fails if no API key is set; a blank
    /// system prompt counts as none.
    pub fn provider_config(&self) -> Result<ProviderConfig, ConfigError> {
        let api_key = self.api_key.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        Ok(ProviderConfig {
            api_key: api_key.to_string(),
            temperature: self.temperature.value(),
            max_tokens: self.max_tokens.value(),
            system_prompt: self
                .system_prompt
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from),
        })
    }
}

/// A source of preferences, consulted once at the start of every call.
pub trait PreferenceSource: Send + Sync {
    fn load(&self) -> Result<Preferences, ConfigError>;
}

/// Fixed, in-memory preferences.
#[derive(Debug, Clone)]
pub struct StaticPreferences(pub Preferences);

impl PreferenceSource for StaticPreferences {
    fn load(&self) -> Result<Preferences, ConfigError> {
        Ok(self.0.clone())
    }
}

/// Use `env_key` as the API key when it is set and non-blank.
pub fn apply_env_override(mut prefs: Preferences, env_key: Option<String>) -> Preferences {
    if let Some(key) = env_key.filter(|k| !k.trim().is_empty()) {
        prefs.api_key = key;
    }
    prefs
}

/// Reads and writes preferences as a JSON file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.minichat/config.json`.
    pub fn default_path() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".minichat").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io { path: self.path.clone(), source }
    }

    /// Preferences stored on disk, or defaults if the file doesn't exist.
    /// The environment override is not applied.
    pub fn load_file(&self) -> Result<Preferences, ConfigError> {
        if !self.path.exists() {
            return Ok(Preferences::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Save atomically (temp file, then rename). The file holds an API key,
    /// so it is only readable by the owner on Unix.
    pub fn save(&self, prefs: &Preferences) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
            }
        }

        let json = serde_json::to_string_pretty(prefs).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path).map_err(|e| self.io_error(e))?;
            file.write_all(json.as_bytes()).map_err(|e| self.io_error(e))?;
            file.sync_all().map_err(|e| self.io_error(e))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| self.io_error(e))
    }
}

impl PreferenceSource for ConfigManager {
    fn load(&self) -> Result<Preferences, ConfigError> {
        let prefs = self.load_file()?;
        Ok(apply_env_override(prefs, std::env::var(API_KEY_ENV).ok()))
    }
}
