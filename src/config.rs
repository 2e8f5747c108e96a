use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings read from `DUET_*` environment variables. Unparseable
/// values fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5434,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "duet".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(2000),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "DUET_PORT").unwrap_or(defaults.port),
            bind: lookup("DUET_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("DUET_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("DUET_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "DUET_MAX_CONNECTIONS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "DUET_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            lock_timeout: parsed(&lookup, "DUET_LOCK_TIMEOUT_MS")
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            tls_cert: lookup("DUET_TLS_CERT"),
            tls_key: lookup("DUET_TLS_KEY"),
            metrics_port: parsed(&lookup, "DUET_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("duet.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
