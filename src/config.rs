use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::limits::{DEFAULT_BOOKING_TIMEOUT_SECS, MAX_BOOKING_TIMEOUT_SECS};

/// Server settings, read from `CINESEAT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub booking_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "cineseat".into(),
            max_connections: 256,
            compact_threshold: 1000,
            booking_timeout: Duration::from_secs(DEFAULT_BOOKING_TIMEOUT_SECS),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parse_or("CINESEAT_PORT", lookup("CINESEAT_PORT"), defaults.port),
            bind: lookup("CINESEAT_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("CINESEAT_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("CINESEAT_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or("CINESEAT_MAX_CONNECTIONS", lookup("CINESEAT_MAX_CONNECTIONS"), defaults.max_connections),
            compact_threshold: parse_or("CINESEAT_COMPACT_THRESHOLD", lookup("CINESEAT_COMPACT_THRESHOLD"), defaults.compact_threshold),
            booking_timeout: booking_timeout(parse_or(
                "CINESEAT_BOOKING_TIMEOUT_SECS",
                lookup("CINESEAT_BOOKING_TIMEOUT_SECS"),
                DEFAULT_BOOKING_TIMEOUT_SECS,
            )),
            metrics_port: lookup("CINESEAT_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: lookup("CINESEAT_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("CINESEAT_TLS_KEY").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("cineseat.wal")
    }
}

fn booking_timeout(secs: u64) -> Duration {
    if secs > MAX_BOOKING_TIMEOUT_SECS {
        warn!("CINESEAT_BOOKING_TIMEOUT_SECS={secs} is above {MAX_BOOKING_TIMEOUT_SECS}, capping");
    }
    Duration::from_secs(secs.min(MAX_BOOKING_TIMEOUT_SECS))
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(s) => s.parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {key}={s:?}, using default");
            default
        }),
    }
}
