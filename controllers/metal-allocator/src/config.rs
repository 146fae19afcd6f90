//! Runtime configuration read from the environment.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Allocator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Namespace to watch for MetalMachines (`None` = all namespaces)
    pub namespace: Option<String>,
    /// Concurrent reconciliations per resource kind
    pub concurrency: u16,
    /// Fixed delay before re-checking a soft condition
    pub requeue_after: Duration,
    /// Debounce applied to watch events
    pub debounce: Duration,
    /// Listen address for `/metrics` and `/healthz`
    pub metrics_addr: SocketAddr,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 10,
            requeue_after: Duration::from_secs(20),
            debounce: Duration::from_secs(1),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl AllocatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        Ok(Self {
            namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            concurrency: parse_or(&lookup, "RECONCILE_CONCURRENCY", defaults.concurrency)?,
            requeue_after: Duration::from_secs(parse_or(
                &lookup,
                "REQUEUE_AFTER_SECS",
                defaults.requeue_after.as_secs(),
            )?),
            debounce: Duration::from_secs(parse_or(&lookup, "DEBOUNCE_SECS", defaults.debounce.as_secs())?),
            metrics_addr: parse_or(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
        })
    }

    /// Log the effective configuration
    pub fn log(&self) {
        info!("Configuration:");
        info!("  Namespace: {}", self.namespace.as_deref().unwrap_or("all namespaces"));
        info!("  Concurrency: {}", self.concurrency);
        info!("  Requeue after: {:?}", self.requeue_after);
        info!("  Debounce: {:?}", self.debounce);
        info!("  Metrics address: {}", self.metrics_addr);
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AllocatorConfig::default());
        assert_eq!(config.requeue_after, Duration::from_secs(20));
    }

    #[test]
    fn test_overrides() {
        let config = AllocatorConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "clusters"),
            ("RECONCILE_CONCURRENCY", "4"),
            ("REQUEUE_AFTER_SECS", "5"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("clusters"));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.requeue_after, Duration::from_secs(5));
        assert_eq!(config.metrics_addr.port(), 9090);
    }

    #[test]
    fn test_malformed_value_is_invalid_config() {
        let err = AllocatorConfig::from_lookup(lookup(&[("REQUEUE_AFTER_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_namespace_means_all() {
        let config = AllocatorConfig::from_lookup(lookup(&[("WATCH_NAMESPACE", "")])).unwrap();
        assert!(config.namespace.is_none());
    }
}
