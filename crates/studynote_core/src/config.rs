//! Engine configuration.
//!
//! # Responsibility
//! - Hold tunables for autosave, undo and reparenting with stable defaults.
//! - Deserialize from host-provided settings (JSON/TOML) with per-field
//!   fallback to defaults.
//!
//! # Invariants
//! - `EngineConfig::default()` is always a valid configuration.

use crate::outline::resolver::ReparentScope;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_IDLE_THRESHOLD_MS: u64 = 3_000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
const DEFAULT_UNDO_CAPACITY: usize = 50;

/// Top-level outline engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub autosave: AutosaveConfig,
    /// Maximum number of undo steps kept in memory. `0` disables undo.
    pub undo_capacity: usize,
    /// Reparent walk scope after structural edits.
    pub reparent_scope: ReparentScope,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            autosave: AutosaveConfig::default(),
            undo_capacity: DEFAULT_UNDO_CAPACITY,
            reparent_scope: ReparentScope::default(),
        }
    }
}

/// Idle-triggered autosave policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Quiet period after the last edit before an incremental flush runs.
    pub idle_threshold_ms: u64,
    /// Failed flush transactions tolerated in a row before the session
    /// reports persistence as failing.
    pub max_consecutive_failures: u32,
}

impl AutosaveConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AutosaveConfig, EngineConfig};
    use crate::outline::resolver::ReparentScope;
    use std::time::Duration;

    #[test]
    fn partial_settings_fall_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "autosave": { "idle_threshold_ms": 750 }, "reparent_scope": "until_stable" }"#,
        )
        .expect("partial config should parse");

        assert_eq!(config.autosave.idle_threshold(), Duration::from_millis(750));
        assert_eq!(
            config.autosave.max_consecutive_failures,
            AutosaveConfig::default().max_consecutive_failures
        );
        assert_eq!(config.undo_capacity, EngineConfig::default().undo_capacity);
        assert_eq!(config.reparent_scope, ReparentScope::UntilStable);
    }

    #[test]
    fn empty_settings_equal_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("empty config should parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.reparent_scope, ReparentScope::ToEnd);
    }
}
