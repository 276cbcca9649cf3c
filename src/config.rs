//! Konfiguration aus Umgebungsvariablen

use crate::call_engine::{default_ice_servers, DEFAULT_RING_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const ENV_USER_ID: &str = "DOORBELL_USER_ID";
pub const ENV_SIGNALING_URL: &str = "DOORBELL_SIGNALING_URL";
pub const ENV_RING_TIMEOUT_SECS: &str = "DOORBELL_RING_TIMEOUT_SECS";
pub const ENV_ENDED_GRACE_MS: &str = "DOORBELL_ENDED_GRACE_MS";
pub const ENV_STUN_URLS: &str = "DOORBELL_STUN_URLS";
pub const ENV_DB_PATH: &str = "DOORBELL_DB_PATH";

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787";

/// Wie lange `ended`-Einträge sichtbar bleiben
pub const DEFAULT_ENDED_GRACE: Duration = Duration::from_millis(2000);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub user_id: String,
    pub signaling_url: String,
    pub ring_timeout: Duration,
    pub ended_grace: Duration,
    pub ice_urls: Vec<String>,
    /// `None` = Standardpfad aus `directories`
    pub db_path: Option<PathBuf>,
}

impl Config {
    /// Konfiguration mit Standardwerten für einen Teilnehmer
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ring_timeout: DEFAULT_RING_TIMEOUT,
            ended_grace: DEFAULT_ENDED_GRACE,
            ice_urls: default_ice_servers(),
            db_path: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Liest die Konfiguration über eine beliebige Lookup-Funktion
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user_id = lookup(ENV_USER_ID)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(ENV_USER_ID))?;

        let mut config = Self::new(user_id);

        if let Some(url) = lookup(ENV_SIGNALING_URL) {
            if url.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    name: ENV_SIGNALING_URL,
                    value: url,
                });
            }
            config.signaling_url = url.trim().to_string();
        }

        if let Some(secs) = lookup(ENV_RING_TIMEOUT_SECS) {
            config.ring_timeout = Duration::from_secs(parse_positive(ENV_RING_TIMEOUT_SECS, secs)?);
        }

        if let Some(ms) = lookup(ENV_ENDED_GRACE_MS) {
            config.ended_grace = Duration::from_millis(parse_number(ENV_ENDED_GRACE_MS, ms)?);
        }

        if let Some(urls) = lookup(ENV_STUN_URLS) {
            config.ice_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            config.db_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

fn parse_number(name: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn parse_positive(name: &'static str, value: String) -> Result<u64, ConfigError> {
    match parse_number(name, value.clone())? {
        0 => Err(ConfigError::Invalid { name, value }),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[(ENV_USER_ID, "door-1")])).unwrap();
        assert_eq!(config.user_id, "door-1");
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.ended_grace, Duration::from_millis(2000));
        assert_eq!(config.ice_urls, default_ice_servers());
        assert_eq!(config.db_path, None);
    }

    #[test]
    fn test_user_id_is_required() {
        assert_eq!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::Missing(ENV_USER_ID))
        );
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (ENV_USER_ID, "resident"),
            (ENV_RING_TIMEOUT_SECS, "10"),
            (ENV_ENDED_GRACE_MS, "0"),
            (ENV_STUN_URLS, "stun:a:3478, stun:b:3478,"),
            (ENV_DB_PATH, "/tmp/calls.db"),
        ]))
        .unwrap();

        assert_eq!(config.ring_timeout, Duration::from_secs(10));
        assert_eq!(config.ended_grace, Duration::ZERO);
        assert_eq!(config.ice_urls, vec!["stun:a:3478", "stun:b:3478"]);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/calls.db")));
    }

    #[test]
    fn test_invalid_numbers() {
        let result = Config::from_lookup(lookup(&[
            (ENV_USER_ID, "resident"),
            (ENV_RING_TIMEOUT_SECS, "soon"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));

        let result = Config::from_lookup(lookup(&[
            (ENV_USER_ID, "resident"),
            (ENV_RING_TIMEOUT_SECS, "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }
}
