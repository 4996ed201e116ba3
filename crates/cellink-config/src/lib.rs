//! Configuration for cellink stations.
//!
//! TOML profiles merged with `CELLINK_` environment variables, user
//! identity resolution (env + keyring + plaintext), translation to
//! `cellink_core::StationConfig`, and the tracing subscriber setup in
//! [`logging`].

pub mod logging;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use cellink_api::UserIdentity;
use cellink_core::{ClientConfig, MonitoringConfig, PollIntervals, RunMode, StationConfig, TagMap};

pub use logging::{LoggingConfig, init_tracing};

const KEYRING_SERVICE: &str = "cellink";
const PASSWORD_ENV: &str = "CELLINK_PASSWORD";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no password configured for user '{user}' of profile '{profile}'")]
    NoCredentials { profile: String, user: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named station profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Settings shared by every profile unless the profile overrides them.
#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_port")]
    pub port: u16,

    /// URI of the namespace holding the station tags.
    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    /// Upper bound for one background request, e.g. "5s".
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Subscription reconciliation tick, e.g. "1s".
    #[serde(default = "default_monitor_tick")]
    pub monitor_tick: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            port: default_port(),
            application_uri: default_application_uri(),
            request_timeout: default_request_timeout(),
            monitor_tick: default_monitor_tick(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    4840
}
fn default_application_uri() -> String {
    ClientConfig::default().application_uri
}
fn default_request_timeout() -> String {
    "5s".into()
}
fn default_monitor_tick() -> String {
    "1s".into()
}
fn default_device_type() -> u16 {
    1
}

/// Poll cadence overrides, as humantime strings.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct PollSettings {
    pub require_data: Option<String>,
    pub upload: Option<String>,
    pub plan_respond: Option<String>,
    pub execute_command: Option<String>,
    pub init_finish: Option<String>,
    pub connect: Option<String>,
}

/// A named station profile.
#[derive(Debug, Deserialize, Serialize)]
pub struct Profile {
    /// Station host name or address.
    pub host: String,

    /// Override the default port.
    pub port: Option<u16>,

    /// Override the default application namespace URI.
    pub application_uri: Option<String>,

    /// Device type the station must report.
    #[serde(default = "default_device_type")]
    pub expected_device_type: u16,

    /// Run one transfer at a time without the existing-error check.
    #[serde(default)]
    pub manual: bool,

    /// User name for the session. Anonymous when unset.
    pub username: Option<String>,

    /// Plaintext password. Env var and keyring take precedence.
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// Override the default request timeout.
    pub request_timeout: Option<String>,

    #[serde(default)]
    pub poll: PollSettings,

    /// Tag name overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagMap>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "cellink", "cellink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("cellink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` + environment.
///
/// Nested keys use a double underscore, e.g.
/// `CELLINK_PROFILES__PRESS__HOST=10.0.0.7`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading config");
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("CELLINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Profile selection ───────────────────────────────────────────────

impl Config {
    /// The profile called `name`, or the default profile.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .ok_or_else(|| ConfigError::Validation {
                field: "default_profile".into(),
                reason: "no profile named and no default profile set".into(),
            })?;
        let profile = self.profiles.get(name).ok_or_else(|| ConfigError::Validation {
            field: "profile".into(),
            reason: format!("unknown profile '{name}'"),
        })?;
        Ok((name, profile))
    }
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the session identity of a profile.
///
/// Without a user name the session is anonymous. With one, the password
/// comes from the profile's env var (or `CELLINK_PASSWORD`), then the
/// system keyring, then the plaintext field.
pub fn resolve_identity(profile: &Profile, profile_name: &str) -> Result<UserIdentity, ConfigError> {
    let Some(user) = profile.username.clone() else {
        return Ok(UserIdentity::Anonymous);
    };

    // 1. Env var
    let env_name = profile.password_env.as_deref().unwrap_or(PASSWORD_ENV);
    if let Ok(pw) = std::env::var(env_name) {
        return Ok(UserIdentity::UserName {
            user,
            password: SecretString::from(pw),
        });
    }

    // 2. Keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{user}")) {
        if let Ok(pw) = entry.get_password() {
            return Ok(UserIdentity::UserName {
                user,
                password: SecretString::from(pw),
            });
        }
    }

    // 3. Plaintext in config
    if let Some(ref pw) = profile.password {
        return Ok(UserIdentity::UserName {
            user,
            password: SecretString::from(pw.clone()),
        });
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
        user,
    })
}

// ── Translation ─────────────────────────────────────────────────────

fn duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("'{value}' is not a duration: {e}"),
    })
}

fn poll_intervals(settings: &PollSettings) -> Result<PollIntervals, ConfigError> {
    let mut poll = PollIntervals::default();
    let slots = [
        ("poll.require_data", &settings.require_data, &mut poll.require_data),
        ("poll.upload", &settings.upload, &mut poll.upload),
        ("poll.plan_respond", &settings.plan_respond, &mut poll.plan_respond),
        ("poll.execute_command", &settings.execute_command, &mut poll.execute_command),
        ("poll.init_finish", &settings.init_finish, &mut poll.init_finish),
        ("poll.connect", &settings.connect, &mut poll.connect),
    ];
    for (field, value, slot) in slots {
        if let Some(value) = value {
            let period = duration(field, value)?;
            if period.is_zero() {
                return Err(ConfigError::Validation {
                    field: field.into(),
                    reason: "must be greater than zero".into(),
                });
            }
            *slot = period;
        }
    }
    Ok(poll)
}

/// Build a `StationConfig` from a profile and the shared defaults.
pub fn profile_to_station_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<StationConfig, ConfigError> {
    let host = profile.host.trim();
    if host.is_empty() {
        return Err(ConfigError::Validation {
            field: "host".into(),
            reason: format!("profile '{profile_name}' has no host"),
        });
    }
    let port = profile.port.unwrap_or(defaults.port);
    cellink_api::endpoint_url(host, port).map_err(|e| ConfigError::Validation {
        field: "host".into(),
        reason: e.to_string(),
    })?;

    let timeout = profile
        .request_timeout
        .as_deref()
        .unwrap_or(&defaults.request_timeout);

    let client = ClientConfig {
        application_uri: profile
            .application_uri
            .clone()
            .unwrap_or_else(|| defaults.application_uri.clone()),
        identity: resolve_identity(profile, profile_name)?,
        request_timeout: duration("request_timeout", timeout)?,
        monitoring: MonitoringConfig {
            tick: duration("monitor_tick", &defaults.monitor_tick)?,
            ..MonitoringConfig::default()
        },
    };

    Ok(StationConfig {
        name: profile_name.to_owned(),
        host: host.to_owned(),
        port,
        expected_device_type: profile.expected_device_type,
        client,
        tags: profile.tags.clone().unwrap_or_default(),
        poll: poll_intervals(&profile.poll)?,
        run_mode: if profile.manual {
            RunMode::Manual
        } else {
            RunMode::Auto
        },
    })
}

/// Load the config and build the station of profile `name` (or the default).
pub fn load_station_config(name: Option<&str>) -> Result<StationConfig, ConfigError> {
    let config = load_config()?;
    let (name, profile) = config.profile(name)?;
    profile_to_station_config(profile, name, &config.defaults)
}
