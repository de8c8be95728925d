//! Strongly-typed configuration for the BrowserStack plugin.
//!
//! Configuration values can be constructed from defaults, loaded from
//! environment variables (with optional `.env` support), or merged with
//! explicit overrides for programmatic updates. Credentials and the force-kill
//! flag are resolved dynamically so that environment variables always win over
//! configuration fields, matching how CI systems inject them.

use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::path::PathBuf;

use dotenvy::dotenv;
use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};
use thiserror::Error;

use crate::broker::BrowserDefinition;
use crate::logging::LogCallback;

/// Default REST API endpoint used for worker management.
pub const DEFAULT_API_URL: &str = "https://api.browserstack.com/4";

/// Default Automate endpoint used for session status updates.
pub const DEFAULT_AUTOMATE_URL: &str = "https://api.browserstack.com/automate";

/// Default tunnel binary name, resolved through `PATH` when no explicit path
/// is configured.
pub const DEFAULT_TUNNEL_BINARY: &str = "BrowserStackLocal";

pub const USERNAME_ENV: &str = "BROWSER_STACK_USERNAME";
pub const ACCESS_KEY_ENV: &str = "BROWSER_STACK_ACCESS_KEY";
pub const FORCE_KILL_ENV: &str = "FORCE_KILL_ON_COMPLETE";

/// CI build-number variables consulted, in priority order, when no explicit
/// build label is configured.
pub const BUILD_LABEL_ENV_CHAIN: [&str; 7] = [
    "BUILD_NUMBER",
    "BUILD_TAG",
    "CI_BUILD_NUMBER",
    "CI_BUILD_TAG",
    "TRAVIS_BUILD_NUMBER",
    "CIRCLE_BUILD_NUM",
    "DRONE_BUILD_NUMBER",
];

const DEFAULT_BROWSER_VERSION: &str = "latest";
const DEFAULT_RUN_NAME: &str = "Web test";

/// Verbosity level for plugin logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Minimal,
    Medium,
    Detailed,
}

impl Verbosity {
    fn as_u8(self) -> u8 {
        match self {
            Verbosity::Minimal => 0,
            Verbosity::Medium => 1,
            Verbosity::Detailed => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Verbosity::Minimal),
            1 => Some(Verbosity::Medium),
            2 => Some(Verbosity::Detailed),
            _ => None,
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Medium
    }
}

impl Serialize for Verbosity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Verbosity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Verbosity::from_u8(value).ok_or_else(|| {
            DeError::custom(format!(
                "invalid verbosity value {value}; expected 0, 1, or 2"
            ))
        })
    }
}

/// Resolved credential pair for the remote provider.
///
/// Either field may be `None`; missing credentials are not an error here,
/// downstream API calls surface the failure instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub access_key: Option<String>,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        self.username.is_some() && self.access_key.is_some()
    }
}

/// Defaults merged into every browser definition during `configure`.
#[derive(Debug, Clone, Default, PartialEq, Eq, DeriveSerialize, DeriveDeserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrowserDefaults {
    #[serde(alias = "browser_version")]
    pub browser_version: Option<String>,
    pub name: Option<String>,
    pub build: Option<String>,
    pub project: Option<String>,
}

impl BrowserDefaults {
    pub fn browser_version(&self) -> &str {
        self.browser_version
            .as_deref()
            .unwrap_or(DEFAULT_BROWSER_VERSION)
    }

    pub fn run_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_RUN_NAME)
    }
}

/// Options controlling the secure tunnel process.
#[derive(Debug, Clone, DeriveSerialize, DeriveDeserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelOptions {
    /// Access key passed to the tunnel binary. Filled in from the resolved
    /// credentials when absent.
    pub key: Option<String>,
    /// Identifier isolating this run's tunnel; generated when absent.
    #[serde(alias = "local_identifier")]
    pub local_identifier: Option<String>,
    pub verbose: bool,
    #[serde(alias = "binary_path")]
    pub binary_path: PathBuf,
    /// Send a kill signal to the tunnel process before the graceful stop.
    #[serde(alias = "force_kill")]
    pub force_kill: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            key: None,
            local_identifier: None,
            verbose: false,
            binary_path: PathBuf::from(DEFAULT_TUNNEL_BINARY),
            force_kill: false,
        }
    }
}

/// Configuration values for the plugin.
#[derive(DeriveSerialize, DeriveDeserialize, Clone)]
#[serde(default)]
pub struct PluginConfig {
    pub username: Option<String>,
    #[serde(alias = "accessKey")]
    pub access_key: Option<String>,
    #[serde(alias = "apiUrl")]
    pub api_url: String,
    #[serde(alias = "automateUrl")]
    pub automate_url: String,
    pub browsers: Vec<BrowserDefinition>,
    pub defaults: BrowserDefaults,
    pub tunnel: TunnelOptions,
    /// Whether the host runner drives browsers in parallel. When `false`,
    /// every completed browser extends the watchdog of the ones still queued.
    pub parallel: bool,
    #[serde(alias = "forceKillOnComplete")]
    pub force_kill_on_complete: bool,
    pub verbose: Verbosity,
    #[serde(skip_serializing, skip_deserializing)]
    pub logger: Option<LogCallback>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        let api_url =
            env::var("BROWSERSTACK_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let automate_url = env::var("BROWSERSTACK_AUTOMATE_URL")
            .unwrap_or_else(|_| DEFAULT_AUTOMATE_URL.to_string());
        PluginConfig {
            username: None,
            access_key: None,
            api_url,
            automate_url,
            browsers: Vec::new(),
            defaults: BrowserDefaults::default(),
            tunnel: TunnelOptions::default(),
            parallel: true,
            force_kill_on_complete: false,
            verbose: Verbosity::default(),
            logger: None,
        }
    }
}

impl PluginConfig {
    /// Construct a configuration by reading relevant environment variables,
    /// after loading a `.env` file if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        let mut config = PluginConfig::default();

        if let Some(value) = env_var(USERNAME_ENV) {
            config.username = Some(value);
        }

        if let Some(value) = env_var(ACCESS_KEY_ENV) {
            config.access_key = Some(value);
        }

        if let Some(value) = env_var("BROWSERSTACK_VERBOSE") {
            let parsed = parse_u8("BROWSERSTACK_VERBOSE", &value)?;
            config.verbose = Verbosity::from_u8(parsed).ok_or_else(|| {
                ConfigError::invalid_enum("BROWSERSTACK_VERBOSE", parsed.to_string())
            })?;
        }

        if let Some(value) = env_var(FORCE_KILL_ENV) {
            config.force_kill_on_complete = parse_bool(FORCE_KILL_ENV, &value)?;
        }

        if let Some(value) = env_var("BROWSERSTACK_TUNNEL_BINARY") {
            config.tunnel.binary_path = PathBuf::from(value);
        }

        if let Some(value) = env_var("BROWSERSTACK_PARALLEL") {
            config.parallel = parse_bool("BROWSERSTACK_PARALLEL", &value)?;
        }

        Ok(config)
    }

    /// Resolve the credential pair, environment first, configuration second.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: env_var(USERNAME_ENV).or_else(|| self.username.clone()),
            access_key: env_var(ACCESS_KEY_ENV).or_else(|| self.access_key.clone()),
        }
    }

    /// Resolve the force-kill flag, environment first.
    pub fn force_kill(&self) -> bool {
        env_var(FORCE_KILL_ENV)
            .map(|value| is_truthy(&value))
            .unwrap_or(self.force_kill_on_complete)
    }

    /// Resolve the build label from the first non-empty source: explicit
    /// config, then the CI environment chain. `None` when nothing is set.
    pub fn build_label(&self) -> Option<String> {
        self.defaults
            .build
            .clone()
            .or_else(|| BUILD_LABEL_ENV_CHAIN.iter().find_map(|key| env_var(key)))
    }

    /// Create a new configuration with explicit field overrides applied.
    pub fn with_overrides(&self, overrides: PluginConfigOverrides) -> PluginConfig {
        let mut next = self.clone();

        if let Some(value) = overrides.username {
            next.username = value;
        }
        if let Some(value) = overrides.access_key {
            next.access_key = value;
        }
        if let Some(value) = overrides.api_url {
            next.api_url = value;
        }
        if let Some(value) = overrides.automate_url {
            next.automate_url = value;
        }
        if let Some(value) = overrides.browsers {
            next.browsers = value;
        }
        if let Some(value) = overrides.defaults {
            next.defaults = value;
        }
        if let Some(value) = overrides.tunnel {
            next.tunnel = value;
        }
        if let Some(value) = overrides.parallel {
            next.parallel = value;
        }
        if let Some(value) = overrides.force_kill_on_complete {
            next.force_kill_on_complete = value;
        }
        if let Some(value) = overrides.verbose {
            next.verbose = value;
        }
        if let Some(value) = overrides.logger {
            next.logger = value;
        }

        next
    }
}

/// Field-level overrides for [`PluginConfig::with_overrides`].
#[derive(Default, Clone)]
pub struct PluginConfigOverrides {
    pub username: Option<Option<String>>,
    pub access_key: Option<Option<String>>,
    pub api_url: Option<String>,
    pub automate_url: Option<String>,
    pub browsers: Option<Vec<BrowserDefinition>>,
    pub defaults: Option<BrowserDefaults>,
    pub tunnel: Option<TunnelOptions>,
    pub parallel: Option<bool>,
    pub force_kill_on_complete: Option<bool>,
    pub verbose: Option<Verbosity>,
    pub logger: Option<Option<LogCallback>>,
}

impl PluginConfigOverrides {
    /// Builder-style helper to set the `username` override.
    pub fn username<T: Into<Option<String>>>(mut self, username: T) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Builder-style helper to set the `access_key` override.
    pub fn access_key<T: Into<Option<String>>>(mut self, access_key: T) -> Self {
        self.access_key = Some(access_key.into());
        self
    }

    /// Builder-style helper to set the `browsers` override.
    pub fn browsers(mut self, browsers: Vec<BrowserDefinition>) -> Self {
        self.browsers = Some(browsers);
        self
    }
}

impl fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConfig")
            .field("username", &self.username)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url)
            .field("automate_url", &self.automate_url)
            .field("browsers", &self.browsers)
            .field("defaults", &self.defaults)
            .field("tunnel", &self.tunnel)
            .field("parallel", &self.parallel)
            .field("force_kill_on_complete", &self.force_kill_on_complete)
            .field("verbose", &self.verbose)
            .field("logger_present", &self.logger.is_some())
            .finish()
    }
}

impl fmt::Debug for PluginConfigOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConfigOverrides")
            .field("username", &self.username)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("api_url", &self.api_url)
            .field("automate_url", &self.automate_url)
            .field("browsers", &self.browsers)
            .field("defaults", &self.defaults)
            .field("tunnel", &self.tunnel)
            .field("parallel", &self.parallel)
            .field("force_kill_on_complete", &self.force_kill_on_complete)
            .field("verbose", &self.verbose)
            .field("logger", &self.logger.as_ref().map(|inner| inner.is_some()))
            .finish()
    }
}

/// Errors that can arise while constructing a [`PluginConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {field}")]
    InvalidEnumVariant { field: &'static str, value: String },
    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: &'static str, value: String },
    #[error("invalid number '{value}' for {field}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

impl ConfigError {
    fn invalid_enum(field: &'static str, value: String) -> Self {
        ConfigError::InvalidEnumVariant { field, value }
    }
}

pub(crate) fn env_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            field,
            value: value.to_string(),
        }),
    }
}

fn parse_u8(field: &'static str, value: &str) -> Result<u8, ConfigError> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|source| ConfigError::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}
