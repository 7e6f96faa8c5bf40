use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub storage_backend: StorageBackend,
    pub postgres_dsn: Option<String>,
    pub jwt_secret: String,
    pub ring_timeout_secs: i64,
    pub ring_sweep_secs: u64,
    pub metrics_interval_secs: u64,
    pub send_queue: usize,
}

/// Loads Palaver server configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = override_env("PALAVER_BIND", map.remove("server.bind"))?
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let backend_raw = override_env("PALAVER_STORAGE", map.remove("storage.backend"))?
        .unwrap_or_else(|| "postgres".to_string());
    let storage_backend = match backend_raw.as_str() {
        "postgres" => StorageBackend::Postgres,
        "memory" => StorageBackend::Memory,
        _ => return Err(ConfigError::Invalid),
    };
    let postgres_dsn = override_env("PALAVER_PG_DSN", map.remove("storage.postgres_dsn"))?;
    if storage_backend == StorageBackend::Postgres && postgres_dsn.is_none() {
        return Err(ConfigError::Missing);
    }
    let jwt_secret = required(override_env(
        "PALAVER_JWT_SECRET",
        map.remove("auth.jwt_secret"),
    )?)?;
    let ring_timeout_secs =
        override_env("PALAVER_RING_TIMEOUT", map.remove("realtime.ring_timeout"))?
            .unwrap_or_else(|| "45".to_string())
            .parse::<i64>()
            .map_err(|_| ConfigError::Invalid)?;
    if ring_timeout_secs <= 0 {
        return Err(ConfigError::Invalid);
    }
    let ring_sweep_secs = override_env("PALAVER_RING_SWEEP", map.remove("realtime.ring_sweep"))?
        .unwrap_or_else(|| "5".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let metrics_interval_secs = override_env(
        "PALAVER_METRICS_INTERVAL",
        map.remove("realtime.metrics_interval"),
    )?
    .unwrap_or_else(|| "60".to_string())
    .parse::<u64>()
    .map_err(|_| ConfigError::Invalid)?;
    let send_queue = override_env("PALAVER_SEND_QUEUE", map.remove("realtime.send_queue"))?
        .unwrap_or_else(|| "128".to_string())
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid)?;
    if send_queue == 0 {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        storage_backend,
        postgres_dsn,
        jwt_secret,
        ring_timeout_secs,
        ring_sweep_secs,
        metrics_interval_secs,
        send_queue,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}
