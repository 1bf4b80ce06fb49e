//! Observer hooks for pipeline execution
//!
//! Observers are awaited inside the pipeline, while it holds its key's slot.
//! Keep them quick; a slow observer delays the next pipeline for that key.

use async_trait::async_trait;
use std::sync::Arc;

use super::types::{PipelineEvent, PipelinePhase};

/// Receives every pipeline event
#[async_trait]
pub trait PipelineObserver: Send + Sync {
    async fn on_event(&self, event: &PipelineEvent);
}

/// Fans one event out to several observers, in order
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn PipelineObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

#[async_trait]
impl PipelineObserver for CompositeObserver {
    async fn on_event(&self, event: &PipelineEvent) {
        for observer in &self.observers {
            observer.on_event(event).await;
        }
    }
}

/// Logs terminal transitions and failures through `tracing`
pub struct LoggingObserver;

#[async_trait]
impl PipelineObserver for LoggingObserver {
    async fn on_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Transition { key, version, to, .. } => match to {
                PipelinePhase::Completed => {
                    tracing::info!("Pipeline completed: {} v{}", key, version);
                }
                PipelinePhase::Superseded(at) => {
                    tracing::info!("Pipeline superseded: {} v{} ({})", key, version, at);
                }
                _ => {
                    tracing::debug!("Pipeline {} v{} -> {}", key, version, to);
                }
            },
            PipelineEvent::StageFailed {
                key,
                version,
                stage,
                error,
                ..
            } => {
                tracing::error!("Pipeline {} v{} {} stage failed: {}", key, version, stage, error);
            }
        }
    }
}
