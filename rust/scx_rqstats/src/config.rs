// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::rq::DEFAULT_DEF_TIMER_MS;
use crate::rq::DEFAULT_RQ_POLL_MS;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualBoostConfig {
    pub enabled: bool,
    /// CPU kept online while boost is locked.
    pub secondary_cpu: usize,
    /// Bring the secondary CPU up from a worker thread instead of blocking
    /// the caller.
    pub deferred: bool,
}

impl Default for DualBoostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secondary_cpu: 1,
            deferred: false,
        }
    }
}

/// Engine configuration. Missing fields take their defaults so partial
/// config files are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RqStatsConfig {
    pub rq_poll_ms: u32,
    pub def_timer_ms: u32,
    pub dual_boost: DualBoostConfig,
}

impl Default for RqStatsConfig {
    fn default() -> Self {
        Self {
            rq_poll_ms: DEFAULT_RQ_POLL_MS,
            def_timer_ms: DEFAULT_DEF_TIMER_MS,
            dual_boost: DualBoostConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_takes_defaults() {
        let config: RqStatsConfig =
            serde_json::from_str(r#"{ "rq_poll_ms": 20, "dual_boost": { "enabled": true } }"#)
                .unwrap();
        assert_eq!(config.rq_poll_ms, 20);
        assert_eq!(config.def_timer_ms, DEFAULT_DEF_TIMER_MS);
        assert!(config.dual_boost.enabled);
        assert_eq!(config.dual_boost.secondary_cpu, 1);
        assert!(!config.dual_boost.deferred);
    }

    #[test]
    fn empty_config_is_default() {
        let config: RqStatsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RqStatsConfig::default());
    }
}
