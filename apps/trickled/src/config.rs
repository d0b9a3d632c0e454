// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::Level;

use trickle_core::HubOptions;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default, faster) or "json" (structured)
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./trickled.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_window() -> usize {
    8
}

const fn default_lookahead() -> i64 {
    4
}

const fn default_read_timeout_secs() -> u64 {
    40
}

const fn default_write_timeout_secs() -> u64 {
    45
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    /// Listen address, host:port.
    pub address: String,
    /// Path prefix every stream URL lives under; always starts and ends
    /// with "/".
    pub base_path: String,
    /// Create streams implicitly on first producer write. When disabled,
    /// producers must create streams with an explicit POST first.
    #[serde(default = "default_true")]
    pub autocreate: bool,
    /// Announce stream add/remove events on the CHANGEFEED pseudo-stream.
    #[serde(default = "default_true")]
    pub changefeed: bool,
    /// Segments retained per stream; older seqs are evicted.
    #[serde(default = "default_window")]
    pub window: usize,
    /// How many seqs past the newest a read or preconnected write may reach.
    #[serde(default = "default_lookahead")]
    pub lookahead: i64,
    /// How long a read may long-poll for its first byte before the server
    /// answers with an empty retry marker (seconds).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// How long a producer body may sit idle between chunks (seconds).
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// How long a placeholder segment may wait for its producer before it
    /// is collected and waiting reads are answered not-found (seconds).
    /// Defaults to `read_timeout_secs`.
    pub stale_segment_ttl_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2939".to_string(),
            base_path: "/".to_string(),
            autocreate: true,
            changefeed: true,
            window: default_window(),
            lookahead: default_lookahead(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            stale_segment_ttl_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            window: self.window,
            lookahead: self.lookahead,
            autocreate: self.autocreate,
            changefeed: self.changefeed,
        }
    }

    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub const fn stale_segment_ttl(&self) -> Duration {
        match self.stale_segment_ttl_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.read_timeout(),
        }
    }
}

/// Root configuration for the trickle server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// environment variables.
///
/// # Errors
///
/// Returns an error if the configuration file exists but contains invalid
/// TOML, or if environment overrides fail to parse.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // Try to load the config file, but don't fail if it doesn't exist
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let mut config: Config =
        figment.merge(Env::prefixed("TRICKLE_").split("__")).extract().map_err(Box::new)?;

    config.server.base_path = normalize_base_path(&config.server.base_path);

    Ok(ConfigLoadResult { config, file_missing })
}

/// Base paths always start and end with "/" so stream URLs compose as
/// `{base}{stream}/{seq}`.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    format!("/{trimmed}/")
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base_path("/"), "/");
        assert_eq!(normalize_base_path(""), "/");
        assert_eq!(normalize_base_path("media"), "/media/");
        assert_eq!(normalize_base_path("/media"), "/media/");
        assert_eq!(normalize_base_path("/a/b/"), "/a/b/");
    }

    #[test]
    fn default_config_serializes() {
        let toml_string = generate_default().unwrap();
        assert!(toml_string.contains("address"));
        assert!(toml_string.contains("2939"));
    }

    #[test]
    fn stale_ttl_defaults_to_read_timeout() {
        let server = ServerConfig::default();
        assert_eq!(server.stale_segment_ttl(), server.read_timeout());

        let server = ServerConfig { stale_segment_ttl_secs: Some(5), ..ServerConfig::default() };
        assert_eq!(server.stale_segment_ttl(), Duration::from_secs(5));
    }
}
