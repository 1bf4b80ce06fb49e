//! Core types for versioned pipelines
//!
//! A pipeline is stamped once, at submit time, and every later decision it
//! makes is a comparison of that stamp against the table.

use chrono::{DateTime, Utc};
use std::fmt;

pub use crate::core::errors::StageKind;

/// Identity of one trigger for one key
///
/// `version` counts triggers per key and restarts at 1 after cleanup.
/// `token` is unique across the whole coordinator, so two stamps are equal
/// only if they came from the same submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stamp {
    pub version: u64,
    pub token: u64,
}

impl Stamp {
    pub(crate) fn first(token: u64) -> Self {
        Self { version: 1, token }
    }

    pub(crate) fn next(self, token: u64) -> Self {
        Self {
            version: self.version + 1,
            token,
        }
    }
}

/// Latest folded state for a key
#[derive(Debug, Clone)]
pub struct Entry<S> {
    pub stamp: Stamp,
    pub state: S,
}

/// Freshness checkpoints inside a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    BeforeEstimate,
    BeforeReconcile,
    BeforeCleanup,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeEstimate => f.write_str("before estimate"),
            Self::BeforeReconcile => f.write_str("before reconcile"),
            Self::BeforeCleanup => f.write_str("before cleanup"),
        }
    }
}

/// Phase of a running pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelinePhase {
    /// Queued, waiting for the key's slot
    Created,
    EstimateRunning,
    Reconciling,
    /// Reconcile ran and the entry was removed
    Completed,
    /// A newer trigger took over at this checkpoint
    Superseded(Checkpoint),
    /// A stage errored or timed out
    Failed(StageKind),
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Superseded(_) | Self::Failed(_))
    }

    /// Whether `next` is a legal successor of this phase
    pub fn can_transition_to(&self, next: PipelinePhase) -> bool {
        use PipelinePhase::*;

        matches!(
            (self, next),
            (Created, EstimateRunning)
                | (Created, Superseded(Checkpoint::BeforeEstimate))
                | (EstimateRunning, Superseded(Checkpoint::BeforeEstimate))
                | (EstimateRunning, Reconciling)
                | (EstimateRunning, Superseded(Checkpoint::BeforeReconcile))
                | (EstimateRunning, Failed(StageKind::Estimate))
                | (Reconciling, Superseded(Checkpoint::BeforeReconcile))
                | (Reconciling, Completed)
                | (Reconciling, Superseded(Checkpoint::BeforeCleanup))
                | (Reconciling, Failed(StageKind::Reconcile))
        )
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::EstimateRunning => f.write_str("estimating"),
            Self::Reconciling => f.write_str("reconciling"),
            Self::Completed => f.write_str("completed"),
            Self::Superseded(at) => write!(f, "superseded ({})", at),
            Self::Failed(stage) => write!(f, "failed ({})", stage),
        }
    }
}

/// How a pipeline ended when no stage failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Superseded(Checkpoint),
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Events emitted while a pipeline runs
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Transition {
        key: String,
        version: u64,
        from: PipelinePhase,
        to: PipelinePhase,
        at: DateTime<Utc>,
    },
    StageFailed {
        key: String,
        version: u64,
        stage: StageKind,
        error: String,
        at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Transition { key, .. } | Self::StageFailed { key, .. } => key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Transition { version, .. } | Self::StageFailed { version, .. } => *version,
        }
    }
}
