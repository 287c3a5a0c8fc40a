//! Process configuration, read from `SLOTBOOK_*` environment variables.
//!
//! Numbers that fail to parse, and a zero reconcile interval, fall back to
//! their defaults. An unknown store kind or half a TLS pair is an error.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which [`crate::store::ReservationStore`] backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// In-memory state recovered from a WAL in `data_dir`.
    Durable,
    /// Nothing survives a restart.
    Memory,
    Redis,
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "durable" | "wal" => Ok(StoreKind::Durable),
            "memory" => Ok(StoreKind::Memory),
            "redis" => Ok(StoreKind::Redis),
            other => Err(ConfigError::UnknownStore(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown SLOTBOOK_STORE {0:?} (expected durable, memory or redis)")]
    UnknownStore(String),
    #[error("both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub store: StoreKind,
    pub redis_url: String,
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            store: StoreKind::Durable,
            redis_url: "redis://127.0.0.1:6379".into(),
            reconcile_interval: Duration::from_millis(5000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("SLOTBOOK_{name}")).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let store = match var("STORE") {
            Some(kind) => kind.parse()?,
            None => defaults.store,
        };

        let tls_cert = var("TLS_CERT");
        let tls_key = var("TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            port: parse_num(var("PORT")).unwrap_or(defaults.port),
            bind: var("BIND").unwrap_or(defaults.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: var("PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_num(var("MAX_CONNECTIONS")).unwrap_or(defaults.max_connections),
            compact_threshold: parse_num(var("COMPACT_THRESHOLD")).unwrap_or(defaults.compact_threshold),
            metrics_port: parse_num(var("METRICS_PORT")),
            tls_cert,
            tls_key,
            store,
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            reconcile_interval: parse_num(var("RECONCILE_INTERVAL_MS"))
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconcile_interval),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

fn parse_num<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn overrides_apply() {
        let cfg = config(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_MAX_CONNECTIONS", "8"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_STORE", "Redis"),
            ("SLOTBOOK_REDIS_URL", "redis://cache:6379"),
            ("SLOTBOOK_RECONCILE_INTERVAL_MS", "250"),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/slotbook"));
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.store, StoreKind::Redis);
        assert_eq!(cfg.redis_url, "redis://cache:6379");
        assert_eq!(cfg.reconcile_interval, Duration::from_millis(250));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let cfg = config(&[("SLOTBOOK_PORT", "http"), ("SLOTBOOK_COMPACT_THRESHOLD", "-1")]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.compact_threshold, 1000);
    }

    #[test]
    fn zero_reconcile_interval_uses_default() {
        let cfg = config(&[("SLOTBOOK_RECONCILE_INTERVAL_MS", "0")]).unwrap();
        assert_eq!(cfg.reconcile_interval, Config::default().reconcile_interval);
        assert!(!cfg.reconcile_interval.is_zero());
    }

    #[test]
    fn unknown_store_is_an_error() {
        assert!(matches!(
            config(&[("SLOTBOOK_STORE", "postgres")]),
            Err(ConfigError::UnknownStore(s)) if s == "postgres"
        ));
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(matches!(config(&[("SLOTBOOK_TLS_CERT", "cert.pem")]), Err(ConfigError::PartialTls)));
        let cfg = config(&[("SLOTBOOK_TLS_CERT", "cert.pem"), ("SLOTBOOK_TLS_KEY", "key.pem")]).unwrap();
        assert_eq!(cfg.tls_key.as_deref(), Some("key.pem"));
    }
}
