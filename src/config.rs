use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::engine::EngineSettings;
use crate::model::BookingWindow;
use crate::retry::RetryPolicy;

/// Process settings, read from `FIELDTIME_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub window: BookingWindow,
    pub lock_timeout: Duration,
    pub retry_attempts: usize,
    pub allow_past: bool,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// JSON catalog; the built-in fields when unset.
    pub catalog_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; set but
    /// unparseable keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let open_hour = parse_or(&lookup, "FIELDTIME_OPEN_HOUR", 6u32)?;
        let close_hour = parse_or(&lookup, "FIELDTIME_CLOSE_HOUR", 22u32)?;
        let tz_name = lookup("FIELDTIME_TIMEZONE").unwrap_or_else(|| "Europe/Bucharest".into());
        let tz: Tz = tz_name.parse().map_err(|_| ConfigError::Invalid {
            key: "FIELDTIME_TIMEZONE",
            value: tz_name.clone(),
        })?;
        let window = BookingWindow::new(open_hour, close_hour, tz)
            .ok_or(ConfigError::BadWindow { open_hour, close_hour })?;

        Ok(Self {
            port: parse_or(&lookup, "FIELDTIME_PORT", 5433)?,
            bind: lookup("FIELDTIME_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("FIELDTIME_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("FIELDTIME_PASSWORD").unwrap_or_else(|| "fieldtime".into()),
            max_connections: parse_or(&lookup, "FIELDTIME_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "FIELDTIME_COMPACT_THRESHOLD", 1000)?,
            window,
            lock_timeout: Duration::from_millis(parse_or(&lookup, "FIELDTIME_LOCK_TIMEOUT_MS", 2000)?),
            retry_attempts: parse_or(&lookup, "FIELDTIME_RETRY_ATTEMPTS", 3)?,
            allow_past: parse_flag(&lookup, "FIELDTIME_ALLOW_PAST")?,
            metrics_port: parse_opt(&lookup, "FIELDTIME_METRICS_PORT")?,
            tls_cert: lookup("FIELDTIME_TLS_CERT"),
            tls_key: lookup("FIELDTIME_TLS_KEY"),
            catalog_path: lookup("FIELDTIME_CATALOG").map(PathBuf::from),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            window: self.window,
            lock_timeout: self.lock_timeout,
            allow_past: self.allow_past,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, 25, 500, 0.2)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    BadWindow { open_hour: u32, close_hour: u32 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::BadWindow {
                open_hour,
                close_hour,
            } => write!(
                f,
                "bookable window {open_hour}:00-{close_hour}:00 is empty or past midnight"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
