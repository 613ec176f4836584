//! Environment-driven configuration.

use std::time::Duration;

use thiserror::Error;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DRAIN_INTERVAL_MS: &str = "CIVITAS_DRAIN_INTERVAL_MS";
pub const DRAIN_BATCH_SIZE: &str = "CIVITAS_DRAIN_BATCH_SIZE";
pub const POLICY_MAX_ATTEMPTS: &str = "CIVITAS_POLICY_MAX_ATTEMPTS";
pub const PG_MAX_CONNECTIONS: &str = "CIVITAS_PG_MAX_CONNECTIONS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: expected {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Tuning of the outbox drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainConfig {
    /// Upper bound on how long a worker sleeps without a commit notice.
    pub poll_interval: Duration,
    /// Records fetched per round trip.
    pub batch_size: usize,
    /// Failed attempts before a record is dead-lettered. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_attempts: None,
        }
    }
}

impl DrainConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraConfig {
    /// Postgres when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub pg_max_connections: u32,
    pub drain: DrainConfig,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pg_max_connections: 5,
            drain: DrainConfig::default(),
        }
    }
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let mut drain = defaults.drain;
        if let Some(ms) = parse_positive::<u64>(DRAIN_INTERVAL_MS, get(DRAIN_INTERVAL_MS))? {
            drain = drain.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(size) = parse_positive::<usize>(DRAIN_BATCH_SIZE, get(DRAIN_BATCH_SIZE))? {
            drain = drain.with_batch_size(size);
        }
        if let Some(max) = parse_positive::<u32>(POLICY_MAX_ATTEMPTS, get(POLICY_MAX_ATTEMPTS))? {
            drain = drain.with_max_attempts(max);
        }

        Ok(Self {
            database_url: get(DATABASE_URL),
            pg_max_connections: parse_positive::<u32>(PG_MAX_CONNECTIONS, get(PG_MAX_CONNECTIONS))?
                .unwrap_or(defaults.pg_max_connections),
            drain,
        })
    }
}

fn parse_positive<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(Some(parsed)),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            expected: "a positive integer",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = InfraConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, InfraConfig::default());
        assert_eq!(config.drain.poll_interval, Duration::from_millis(500));
        assert_eq!(config.drain.batch_size, 100);
        assert_eq!(config.drain.max_attempts, None);
    }

    #[test]
    fn reads_every_variable() {
        let config = InfraConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://localhost/civitas"),
            (DRAIN_INTERVAL_MS, "50"),
            (DRAIN_BATCH_SIZE, "10"),
            (POLICY_MAX_ATTEMPTS, "3"),
            (PG_MAX_CONNECTIONS, "12"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/civitas"));
        assert_eq!(config.pg_max_connections, 12);
        assert_eq!(
            config.drain,
            DrainConfig::default()
                .with_poll_interval(Duration::from_millis(50))
                .with_batch_size(10)
                .with_max_attempts(3)
        );
    }

    #[test]
    fn blank_database_url_means_in_memory() {
        let config = InfraConfig::from_lookup(lookup(&[(DATABASE_URL, "  ")])).unwrap();
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let err = InfraConfig::from_lookup(lookup(&[(DRAIN_BATCH_SIZE, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: DRAIN_BATCH_SIZE, .. }));

        let err = InfraConfig::from_lookup(lookup(&[(POLICY_MAX_ATTEMPTS, "many")])).unwrap_err();
        assert_eq!(err.to_string(), "CIVITAS_POLICY_MAX_ATTEMPTS: expected a positive integer, got \"many\"");
    }
}
