use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::propagation::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {var}={value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Daemon settings, read from `CLINICD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// WAL directory; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub compact_threshold: u64,
    pub max_connections: usize,
    pub tokens_file: Option<PathBuf>,
    pub seed_file: Option<PathBuf>,
    pub utc_offset: FixedOffset,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let offset_minutes: i32 = parse(&get, "CLINICD_UTC_OFFSET_MINUTES")?.unwrap_or(0);
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::Invalid {
                var: "CLINICD_UTC_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
                reason: "must be within ±24 hours".into(),
            })?;

        let delay = Duration::from_secs(parse(&get, "CLINICD_RETRY_DELAY_SECS")?.unwrap_or(5));
        let retry = match parse::<u64>(&get, "CLINICD_RETRY_MAX_SECS")? {
            Some(max) => RetryPolicy::Exponential {
                initial: delay,
                max: Duration::from_secs(max).max(delay),
            },
            None => RetryPolicy::Fixed(delay),
        };

        let max_connections: usize = parse(&get, "CLINICD_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "CLINICD_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        Ok(Self {
            bind: get("CLINICD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "CLINICD_PORT")?.unwrap_or(7400),
            data_dir: get("CLINICD_DATA_DIR").map(PathBuf::from),
            compact_threshold: parse(&get, "CLINICD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            max_connections,
            tokens_file: get("CLINICD_TOKENS_FILE").map(PathBuf::from),
            seed_file: get("CLINICD_SEED_FILE").map(PathBuf::from),
            utc_offset,
            retry,
            shutdown_grace: Duration::from_secs(parse(&get, "CLINICD_SHUTDOWN_GRACE_SECS")?.unwrap_or(10)),
            metrics_port: parse(&get, "CLINICD_METRICS_PORT")?,
            tls_cert: get("CLINICD_TLS_CERT"),
            tls_key: get("CLINICD_TLS_KEY"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("clinicd.wal"))
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
