use crate::core::errors::{LiveCacheError, Result, StageKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Coordinator configuration
///
/// Stage timeouts are off by default: a stage that never resolves then holds
/// its key's queue slot forever. Set them (or use [`CoordinatorConfig::bounded`])
/// when stages talk to anything remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Time budget for the estimate stage
    pub estimate_timeout_ms: Option<u64>,
    /// Time budget for the reconcile stage
    pub reconcile_timeout_ms: Option<u64>,
    /// Stages running longer than this are logged as slow
    pub slow_stage_warn_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            estimate_timeout_ms: None,
            reconcile_timeout_ms: None,
            slow_stage_warn_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.estimate_timeout_ms == Some(0) {
            return Err(LiveCacheError::configuration_field(
                "estimate_timeout_ms must be greater than 0",
                "estimate_timeout_ms",
            ));
        }
        if self.reconcile_timeout_ms == Some(0) {
            return Err(LiveCacheError::configuration_field(
                "reconcile_timeout_ms must be greater than 0",
                "reconcile_timeout_ms",
            ));
        }
        if self.slow_stage_warn_ms == 0 {
            return Err(LiveCacheError::configuration_field(
                "slow_stage_warn_ms must be greater than 0",
                "slow_stage_warn_ms",
            ));
        }
        Ok(())
    }

    /// Timeouts suitable for stages that call a remote API
    pub fn bounded() -> Self {
        Self {
            estimate_timeout_ms: Some(10_000),
            reconcile_timeout_ms: Some(30_000),
            slow_stage_warn_ms: 2_000,
        }
    }

    /// Set the same timeout on both stages
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        self.estimate_timeout_ms = Some(ms);
        self.reconcile_timeout_ms = Some(ms);
        self
    }

    pub fn timeout_for(&self, stage: StageKind) -> Option<Duration> {
        let ms = match stage {
            StageKind::Estimate => self.estimate_timeout_ms,
            StageKind::Reconcile => self.reconcile_timeout_ms,
        };
        ms.map(Duration::from_millis)
    }

    pub fn slow_stage_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_stage_warn_ms)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LiveCacheError::io(format!("read {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }
}
