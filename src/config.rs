//! Server configuration from environment variables

use crate::conversation::TipPolicy;
use std::time::Duration;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub port: u16,
    /// Interval between SSE keepalive comments and WebSocket pings
    pub keepalive: Duration,
    /// Per-subscriber outbound queue capacity
    pub queue_capacity: usize,
    pub tip_policy: TipPolicy,
    /// Response engine endpoint; generation is disabled when unset
    pub engine_url: Option<String>,
    pub generation_timeout: Duration,
    pub generation_workers: usize,
    pub generation_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "branchline.db".to_string(),
            port: 8000,
            keepalive: Duration::from_secs(30),
            queue_capacity: 64,
            tip_policy: TipPolicy::ExtendTip,
            engine_url: None,
            generation_timeout: Duration::from_secs(300),
            generation_workers: 4,
            generation_queue: 128,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let db_path = lookup("BRANCHLINE_DB_PATH").unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            format!("{home}/.branchline/branchline.db")
        });

        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let positive = |key: &str| parsed(key).filter(|v| *v > 0);

        let tip_policy = match lookup("BRANCHLINE_SYNC_TIP_POLICY") {
            Some(raw) => TipPolicy::parse(&raw).unwrap_or_else(|| {
                tracing::warn!(value = %raw, "Unknown sync tip policy, using extend_tip");
                defaults.tip_policy
            }),
            None => defaults.tip_policy,
        };

        Self {
            db_path,
            port: lookup("BRANCHLINE_PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            keepalive: positive("BRANCHLINE_KEEPALIVE_SECS").map_or(defaults.keepalive, Duration::from_secs),
            queue_capacity: positive("BRANCHLINE_QUEUE_CAPACITY")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.queue_capacity),
            tip_policy,
            engine_url: lookup("BRANCHLINE_ENGINE_URL").filter(|u| !u.trim().is_empty()),
            generation_timeout: positive("BRANCHLINE_GENERATION_TIMEOUT_SECS")
                .map_or(defaults.generation_timeout, Duration::from_secs),
            generation_workers: positive("BRANCHLINE_GENERATION_WORKERS")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.generation_workers),
            generation_queue: positive("BRANCHLINE_GENERATION_QUEUE")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.generation_queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[("HOME", "/home/ada")]));
        assert_eq!(config.db_path, "/home/ada/.branchline/branchline.db");
        assert_eq!(config.port, 8000);
        assert_eq!(config.keepalive, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.tip_policy, TipPolicy::ExtendTip);
        assert!(config.engine_url.is_none());
        assert_eq!(config.generation_timeout, Duration::from_secs(300));
    }

    #[test]
    fn overrides_and_bad_values() {
        let config = Config::from_lookup(lookup_from(&[
            ("BRANCHLINE_PORT", "9001"),
            ("BRANCHLINE_QUEUE_CAPACITY", "0"),
            ("BRANCHLINE_KEEPALIVE_SECS", "five"),
            ("BRANCHLINE_SYNC_TIP_POLICY", "last_attached"),
            ("BRANCHLINE_ENGINE_URL", "http://engine.local/generate"),
        ]));
        assert_eq!(config.port, 9001);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.keepalive, Duration::from_secs(30));
        assert_eq!(config.tip_policy, TipPolicy::LastAttached);
        assert_eq!(config.engine_url.as_deref(), Some("http://engine.local/generate"));
    }
}
