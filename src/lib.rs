// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod stats;

    pub use config::CoordinatorConfig;
    pub use errors::{LiveCacheError, Result, StageKind};
    pub use stats::{PipelineStats, PipelineStatsSnapshot};
}

// Versioned per-key pipelines
pub mod coord;

// Re-exports for convenience
pub use crate::core::errors::{LiveCacheError, Result};
pub use crate::core::{CoordinatorConfig, PipelineStatsSnapshot};
pub use coord::{
    Checkpoint, Coordinator, KeyedQueue, LoggingObserver, PipelineEvent, PipelineHandle,
    PipelineObserver, PipelineOutcome, PipelinePhase, StageKind, Stamp, Trigger,
};
