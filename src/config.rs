use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub udp_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub flush_interval: Duration,
    pub backend: BackendKind,
    pub redis_url: String,
    pub verbosity: u8,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process
    /// environment, tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let udp_addr = parse_var(&lookup, "COUNTER_UDP_ADDR", "0.0.0.0:8125")?;
        let http_addr = parse_var(&lookup, "COUNTER_HTTP_ADDR", "0.0.0.0:3000")?;

        let flush_secs: u64 = parse_var(&lookup, "COUNTER_FLUSH_INTERVAL_SECS", "10")?;
        if flush_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "COUNTER_FLUSH_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        let backend_str = lookup("COUNTER_BACKEND").unwrap_or_else(|| "redis".into());
        let backend = match backend_str.to_lowercase().as_str() {
            "redis" => BackendKind::Redis,
            "memory" => BackendKind::Memory,
            _ => {
                return Err(ConfigError::InvalidValue {
                    var: "COUNTER_BACKEND",
                    value: backend_str,
                    reason: "expected redis or memory".into(),
                })
            }
        };

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379/".into());
        let verbosity = parse_var(&lookup, "COUNTER_VERBOSITY", "0")?;

        Ok(Self {
            udp_addr,
            http_addr,
            flush_interval: Duration::from_secs(flush_secs),
            backend,
            redis_url,
            verbosity,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = lookup(var).unwrap_or_else(|| default.to_owned());
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        reason: e.to_string(),
        value,
    })
}
