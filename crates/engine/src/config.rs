//! Engine configuration.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration of one management node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Identity of this management node; recorded on jobs it initiates or executes.
    pub node_id: u64,
    /// How often the wakeup scheduler sweeps waiting async joins.
    pub sweep_interval: Duration,
    /// How often a blocked sync join re-checks the stores (liveness/cross-node pickup).
    pub sync_join_check_interval: Duration,
    /// How often idle executor workers poll for runnable jobs.
    pub executor_poll_interval: Duration,
    /// Number of executor worker threads.
    pub executor_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            sweep_interval: Duration::from_millis(500),
            sync_join_check_interval: Duration::from_millis(1000),
            executor_poll_interval: Duration::from_millis(100),
            executor_workers: 4,
        }
    }
}

impl EngineConfig {
    /// Load from `JOBWEAVE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            node_id: parse_or(&lookup, "JOBWEAVE_NODE_ID", defaults.node_id)?,
            sweep_interval: millis_or(&lookup, "JOBWEAVE_SWEEP_INTERVAL_MS", defaults.sweep_interval)?,
            sync_join_check_interval: millis_or(
                &lookup,
                "JOBWEAVE_SYNC_JOIN_CHECK_MS",
                defaults.sync_join_check_interval,
            )?,
            executor_poll_interval: millis_or(
                &lookup,
                "JOBWEAVE_EXECUTOR_POLL_MS",
                defaults.executor_poll_interval,
            )?,
            executor_workers: parse_or(&lookup, "JOBWEAVE_EXECUTOR_WORKERS", defaults.executor_workers)?,
        })
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sync_join_check_interval(mut self, interval: Duration) -> Self {
        self.sync_join_check_interval = interval;
        self
    }

    pub fn with_executor_workers(mut self, workers: usize) -> Self {
        self.executor_workers = workers;
        self
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.sweep_interval, Duration::from_millis(500));
        assert_eq!(cfg.executor_workers, 4);
    }

    #[test]
    fn values_are_read_from_lookup() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("JOBWEAVE_NODE_ID", "7"),
            ("JOBWEAVE_SWEEP_INTERVAL_MS", "250"),
            ("JOBWEAVE_SYNC_JOIN_CHECK_MS", " 50 "),
            ("JOBWEAVE_EXECUTOR_WORKERS", "2"),
        ]))
        .unwrap();

        assert_eq!(cfg.node_id, 7);
        assert_eq!(cfg.sweep_interval, Duration::from_millis(250));
        assert_eq!(cfg.sync_join_check_interval, Duration::from_millis(50));
        assert_eq!(cfg.executor_poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.executor_workers, 2);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("JOBWEAVE_NODE_ID", "seven")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOBWEAVE_NODE_ID",
                value: "seven".to_string()
            }
        );

        let err = EngineConfig::from_lookup(lookup(&[("JOBWEAVE_SWEEP_INTERVAL_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "JOBWEAVE_SWEEP_INTERVAL_MS", .. }));
    }
}
