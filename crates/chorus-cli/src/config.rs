//! Configuration loading from file and environment variables.

use chorus_persona::DEFAULT_LEASE_TIMEOUT;
use chorus_types::{PersonaId, PersonaProfile};
use chorus_voice::VoiceConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration.
///
/// The pipeline sections (`[synthesis]`, `[chunking]`, `[scheduler]`,
/// `[playback]`, `split_mode`, `latency_mode`) sit at the top level of the
/// file next to `[logging]` and `[persona]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub persona: PersonaConfig,

    #[serde(flatten)]
    pub voice: VoiceConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "chorus_voice=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Persona reservation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PersonaConfig {
    /// Directory holding the shared registry and per-session leases.
    /// Defaults to `chorus` under the platform state directory
    /// (`$XDG_STATE_HOME`, else the local data directory).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Seconds without renewal after which a lease may be reclaimed.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    /// Persona used by sessions that hold none, when fallback is allowed.
    #[serde(default)]
    pub default_persona: Option<PersonaId>,

    #[serde(default)]
    pub allow_fallback: bool,

    /// Personas on offer. Empty means "ask the synthesis backend".
    #[serde(default)]
    pub catalog: Vec<PersonaProfile>,
}

impl PersonaConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("chorus")
}

fn default_lease_timeout_secs() -> u64 {
    DEFAULT_LEASE_TIMEOUT.as_secs()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lease_timeout_secs: default_lease_timeout_secs(),
            default_persona: None,
            allow_fallback: false,
            catalog: Vec::new(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CHORUS_HOST` overrides `synthesis.host`
/// - `CHORUS_PORT` overrides `synthesis.port`
/// - `CHORUS_STATE_DIR` overrides `persona.state_dir`
/// - `CHORUS_LOG_LEVEL` overrides `logging.level`
/// - `CHORUS_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Applies `CHORUS_*` overrides read through `lookup`. Unparseable values
/// are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("CHORUS_HOST") {
        config.voice.synthesis.host = host;
    }
    if let Some(port) = lookup("CHORUS_PORT") {
        if let Ok(parsed) = port.parse() {
            config.voice.synthesis.port = parsed;
        }
    }
    if let Some(dir) = lookup("CHORUS_STATE_DIR") {
        config.persona.state_dir = PathBuf::from(dir);
    }
    if let Some(level) = lookup("CHORUS_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("CHORUS_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
