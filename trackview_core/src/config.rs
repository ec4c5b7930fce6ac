//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use trackview_env::EntityScope;

use crate::error::EngineError;
use crate::window_index::WindowSpec;

/// Who drives the playback clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickSource {
    /// `play()` spawns a periodic timer task on the context
    #[default]
    Timer,
    
    /// The host calls `ReplayEngine::tick()` itself (e.g. once per frame)
    External,
}

/// Configuration for a replay engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of each fetch unit in seconds (default: 80)
    pub window_duration_secs: u32,
    
    /// Windows to prefetch ahead of the cursor (default: 2)
    pub lookahead_windows: usize,
    
    /// Hard cap on resident windows (default: 5, must be >= lookahead + 1)
    pub max_loaded_windows: usize,
    
    /// Timer period between ticks in ms (default: 100)
    pub tick_period_ms: u64,
    
    /// Cursor advance per tick in ms (default: 1000)
    pub time_step_ms: u64,
    
    /// Fetch attempts per window before giving up (default: unbounded)
    pub max_fetch_attempts: Option<u32>,
    
    /// Clock driver (default: Timer)
    pub tick_source: TickSource,
    
    /// Entities requested from the source (default: All)
    pub entity_scope: EntityScope,
    
    /// Subsampling target for bounds estimation (default: 1000)
    pub bounds_sample_target: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_duration_secs: 80,
            lookahead_windows: 2,
            max_loaded_windows: 5,
            tick_period_ms: 100,
            time_step_ms: 1000,
            max_fetch_attempts: None,
            tick_source: TickSource::Timer,
            entity_scope: EntityScope::All,
            bounds_sample_target: 1000,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("malformed config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
    
    /// Rejects inconsistent settings. Never clamps.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.window_duration_secs == 0 {
            return Err(EngineError::config("window_duration_secs must be positive"));
        }
        if self.max_loaded_windows < self.lookahead_windows + 1 {
            return Err(EngineError::config(format!(
                "max_loaded_windows ({}) must be at least lookahead_windows + 1 ({})",
                self.max_loaded_windows,
                self.lookahead_windows + 1
            )));
        }
        if self.tick_period_ms == 0 {
            return Err(EngineError::config("tick_period_ms must be positive"));
        }
        if self.time_step_ms == 0 {
            return Err(EngineError::config("time_step_ms must be positive"));
        }
        if self.max_fetch_attempts == Some(0) {
            return Err(EngineError::config("max_fetch_attempts must be positive when set"));
        }
        Ok(())
    }
    
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            duration_secs: self.window_duration_secs,
        }
    }
    
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.window_duration_secs, 80);
        assert_eq!(config.lookahead_windows, 2);
        assert_eq!(config.max_loaded_windows, 5);
        assert_eq!(config.tick_period_ms, 100);
        assert_eq!(config.time_step_ms, 1000);
        assert!(config.validate().is_ok());
    }
    
    #[test]
    fn test_budget_below_retention_rejected() {
        let config = EngineConfig {
            lookahead_windows: 4,
            max_loaded_windows: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
        
        let exact = EngineConfig {
            lookahead_windows: 4,
            max_loaded_windows: 5,
            ..Default::default()
        };
        assert!(exact.validate().is_ok());
    }
    
    #[test]
    fn test_zero_values_rejected() {
        for config in [
            EngineConfig { window_duration_secs: 0, ..Default::default() },
            EngineConfig { tick_period_ms: 0, ..Default::default() },
            EngineConfig { time_step_ms: 0, ..Default::default() },
            EngineConfig { max_fetch_attempts: Some(0), ..Default::default() },
        ] {
            assert!(config.validate().is_err());
        }
    }
    
    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{"lookahead_windows": 1, "time_step_ms": 4000}"#).unwrap();
        assert_eq!(config.lookahead_windows, 1);
        assert_eq!(config.time_step_ms, 4000);
        assert_eq!(config.window_duration_secs, 80);
        
        assert!(EngineConfig::from_json(r#"{"max_loaded_windows": 1}"#).is_err());
        assert!(EngineConfig::from_json("nope").is_err());
    }
}
