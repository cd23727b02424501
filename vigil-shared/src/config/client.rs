//! Configuration structures, loading and validation.

use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use url::Url;

use crate::{
    errors::ConfigError,
    models::{Position, Viewport},
    staleness::{DEFAULT_HORIZON_MS, StalenessPolicy},
};

/// The main configuration structure for a Vigil client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Coordination server endpoints
    pub server: ServerConfig,

    /// Who this client is when it opens the realtime channel
    pub identity: IdentityConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Reconciliation timings and viewport defaults
    pub reconciler: ReconcilerConfig,

    /// Realtime channel backoff
    pub channel: ChannelConfig,

    /// Token refresh settings
    pub auth: AuthConfig,
}

/// Coordination server location.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the coordination API
    pub base_url: Url,
}

/// Identity announced to the realtime channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Subject id announced in the channel handshake
    pub subject_id: String,
    /// Role announced in the handshake; also the default scope to watch
    pub role: String,
}

/// Output format of the log subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Log filter and format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
    /// Text or JSON output
    pub format: LogFormat,
}

/// Reconciler timings and viewport defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Records older than this leave the active view
    pub staleness_horizon_ms: i64,
    /// Safety-net snapshot poll interval
    pub poll_interval_ms: u64,
    /// Age-out recomputation interval for quiet periods
    pub prune_interval_ms: u64,
    /// Reconnect attempts before the UI is told the channel is down for good
    pub max_reconnect_attempts: u32,
    /// Map centre used while nothing is active
    pub default_center: Position,
    /// Zoom used while nothing is active
    pub default_zoom: u8,
}

/// Reconnect backoff of the realtime channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    /// First reconnect delay
    pub base_delay_ms: u64,
    /// Upper bound of the reconnect delay
    pub max_delay_ms: u64,
}

/// Session token handling.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Refresh this many seconds before the token expires
    pub refresh_skew_secs: u64,
    /// Where the shared token file lives; defaults to the user config dir
    pub token_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8080/").expect("static URL is valid"),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            subject_id: "dispatch-console".to_string(),
            role: "responder".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            staleness_horizon_ms: DEFAULT_HORIZON_MS,
            poll_interval_ms: 30_000,
            prune_interval_ms: 15_000,
            max_reconnect_attempts: 5,
            default_center: Position {
                latitude: 0.0,
                longitude: 0.0,
            },
            default_zoom: 3,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_skew_secs: 30,
            token_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ReconcilerConfig {
    /// Snapshot poll period.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Age-out tick period.
    pub const fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    /// # Errors
    /// Returns an error when the horizon is negative.
    pub fn staleness_policy(&self) -> Result<StalenessPolicy, ConfigError> {
        StalenessPolicy::from_millis(self.staleness_horizon_ms)
    }

    /// Viewport shown while nothing is active.
    pub const fn default_viewport(&self) -> Viewport {
        Viewport::centered(self.default_center, self.default_zoom)
    }
}

impl ChannelConfig {
    /// First reconnect delay.
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Reconnect delay ceiling.
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Config {
    /// Generates a default configuration.
    pub fn with_defaults() -> Self {
        Self {
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            logging: LoggingConfig::default(),
            reconciler: ReconcilerConfig::default(),
            channel: ChannelConfig::default(),
            auth: AuthConfig::default(),
        }
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to a YAML or JSON configuration file.
    /// * `server_override` - Optional base URL taking precedence over everything else.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, an environment
    /// variable holds an invalid value, or the resolved configuration is invalid.
    pub fn load_config(
        config_path: Option<PathBuf>,
        server_override: Option<Url>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => {
                let content = fs::read_to_string(&path)?;
                match path.extension().and_then(|ext| ext.to_str()) {
                    Some("yaml" | "yml") => serde_yml::from_str(&content)?,
                    Some("json") => serde_json::from_str(&content)?,
                    _ => return Err(ConfigError::UnsupportedFormat),
                }
            }
            None => Config::with_defaults(),
        };

        config.apply_env_overrides()?;

        if let Some(url) = server_override {
            config.server.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Applies `VIGIL_*` environment variables on top of the current values.
    ///
    /// # Errors
    /// Returns an error when a numeric or URL variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("VIGIL_SERVER_URL") {
            self.server.base_url = Url::parse(&url).map_err(|err| {
                ConfigError::invalid("VIGIL_SERVER_URL", format!("invalid URL: {err}"))
            })?;
        }
        if let Ok(level) = env::var("VIGIL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("VIGIL_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::invalid(
                        "VIGIL_LOG_FORMAT",
                        format!("expected 'text' or 'json', got '{other}'"),
                    ));
                }
            };
        }
        if let Ok(identity) = env::var("VIGIL_IDENTITY") {
            self.identity.subject_id = identity;
        }
        if let Ok(scope) = env::var("VIGIL_SCOPE") {
            self.identity.role = scope;
        }
        if let Ok(value) = env::var("VIGIL_POLL_INTERVAL_MS") {
            self.reconciler.poll_interval_ms = value.parse().map_err(|_| {
                ConfigError::invalid("VIGIL_POLL_INTERVAL_MS", "must be a positive integer")
            })?;
        }
        if let Ok(value) = env::var("VIGIL_STALENESS_HORIZON_MS") {
            self.reconciler.staleness_horizon_ms = value.parse().map_err(|_| {
                ConfigError::invalid("VIGIL_STALENESS_HORIZON_MS", "must be an integer")
            })?;
        }
        Ok(())
    }

    /// Validates the resolved configuration.
    ///
    /// # Errors
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconciler.staleness_policy()?;

        if self.reconciler.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "reconciler.poll_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.reconciler.prune_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "reconciler.prune_interval_ms",
                "must be greater than 0",
            ));
        }
        if self.channel.base_delay_ms == 0 {
            return Err(ConfigError::invalid(
                "channel.base_delay_ms",
                "must be greater than 0",
            ));
        }
        if self.channel.base_delay_ms > self.channel.max_delay_ms {
            return Err(ConfigError::invalid(
                "channel.max_delay_ms",
                "must not be smaller than channel.base_delay_ms",
            ));
        }
        if self.identity.subject_id.trim().is_empty() {
            return Err(ConfigError::invalid("identity.subject_id", "must not be empty"));
        }
        if self.identity.role.trim().is_empty() {
            return Err(ConfigError::invalid("identity.role", "must not be empty"));
        }
        Position::checked(
            "reconciler.default_center",
            self.reconciler.default_center.latitude,
            self.reconciler.default_center.longitude,
        )
        .map_err(|err| ConfigError::invalid("reconciler.default_center", err.to_string()))?;

        Ok(())
    }
}
