use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub max_message_len: usize,
    pub search_limit: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let heartbeat_secs: u64 = parse(&lookup, "PARLEY_HEARTBEAT_SECS", 15)?;
        if heartbeat_secs == 0 {
            anyhow::bail!("PARLEY_HEARTBEAT_SECS must be at least 1");
        }

        Ok(Self {
            jwt_secret: var("PARLEY_JWT_SECRET", "dev-secret-change-me"),
            db_path: PathBuf::from(var("PARLEY_DB_PATH", "parley.db")),
            host: var("PARLEY_HOST", "0.0.0.0"),
            port: parse(&lookup, "PARLEY_PORT", 3000)?,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_message_len: parse(&lookup, "PARLEY_MAX_MESSAGE_LEN", 4000)?,
            search_limit: parse(&lookup, "PARLEY_SEARCH_LIMIT", 20)?,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn falls_back_to_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("parley.db"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.max_message_len, 4000);
        assert_eq!(config.search_limit, 20);
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[("PARLEY_PORT", "8080"), ("PARLEY_SEARCH_LIMIT", "5")]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.search_limit, 5);
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = config(&[("PARLEY_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_PORT"));

        assert!(config(&[("PARLEY_HEARTBEAT_SECS", "0")]).is_err());
    }
}
