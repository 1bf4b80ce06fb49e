//! Coordinator - versioned per-key pipelines
//!
//! Every trigger is folded into the key's entry before `submit` returns, so
//! the next trigger always sees it. The async stages then run on the key's
//! queue and re-check the entry's stamp before each stage and before cleanup.
//! A pipeline whose stamp no longer matches stops at that checkpoint.
//!
//! Effects a stage already performed are not undone when its pipeline is
//! superseded. Stages must tolerate being overwritten by the next pipeline's
//! effects.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::coord::hooks::PipelineObserver;
use crate::coord::keyed_queue::KeyedQueue;
use crate::coord::trigger::Trigger;
use crate::coord::types::{
    Checkpoint, Entry, PipelineEvent, PipelineOutcome, PipelinePhase, StageKind, Stamp,
};
use crate::core::{CoordinatorConfig, LiveCacheError, PipelineStats, PipelineStatsSnapshot, Result};

struct Inner<S> {
    table: DashMap<String, Entry<S>>,
    queue: KeyedQueue<String>,
    observers: Vec<Arc<dyn PipelineObserver>>,
    config: CoordinatorConfig,
    stats: PipelineStats,
    next_token: AtomicU64,
}

impl<S> Inner<S> {
    fn is_current(&self, key: &str, stamp: Stamp) -> bool {
        self.table
            .get(key)
            .is_some_and(|entry| entry.stamp == stamp)
    }
}

/// Collapses bursts of triggers on the same key into one effective pipeline
///
/// Clones share the same table and queues.
pub struct Coordinator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Coordinator<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create a coordinator that runs pipelines on the current tokio runtime
    pub fn new(config: CoordinatorConfig, observers: Vec<Arc<dyn PipelineObserver>>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| LiveCacheError::runtime(e.to_string()))?;
        Self::with_runtime(config, observers, runtime)
    }

    /// Create a coordinator that runs pipelines on `runtime`
    pub fn with_runtime(
        config: CoordinatorConfig,
        observers: Vec<Arc<dyn PipelineObserver>>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                table: DashMap::new(),
                queue: KeyedQueue::new(runtime),
                observers,
                config,
                stats: PipelineStats::new(),
                next_token: AtomicU64::new(0),
            }),
        })
    }

    /// Fold a trigger into `key`'s state and schedule its stages
    ///
    /// `fold` runs on the calling thread before this returns, with the key's
    /// slot in the table locked; it must not call back into this coordinator.
    /// The returned handle may be dropped to fire and forget.
    pub fn submit<F, E, EFut, R, RFut>(
        &self,
        key: impl Into<String>,
        fold: F,
        estimate: E,
        reconcile: R,
    ) -> PipelineHandle
    where
        F: FnOnce(Option<&S>) -> S,
        E: FnOnce(S) -> EFut + Send + 'static,
        EFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce() -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = key.into();
        let (stamp, state) = match self.write_entry(&key, |previous| Ok::<_, Infallible>(fold(previous))) {
            Ok(written) => written,
            Err(never) => match never {},
        };
        self.schedule(key, stamp, state, estimate, reconcile)
    }

    /// Like [`submit`](Self::submit), with a fold that may reject the trigger
    ///
    /// On a fold error the table is left as it was and nothing is scheduled.
    pub fn try_submit<F, E, EFut, R, RFut>(
        &self,
        key: impl Into<String>,
        fold: F,
        estimate: E,
        reconcile: R,
    ) -> Result<PipelineHandle>
    where
        F: FnOnce(Option<&S>) -> anyhow::Result<S>,
        E: FnOnce(S) -> EFut + Send + 'static,
        EFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce() -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = key.into();
        let (stamp, state) = match self.write_entry(&key, fold) {
            Ok(written) => written,
            Err(e) => {
                self.inner.stats.record_fold_failure();
                warn!("Fold rejected trigger for {}: {:#}", key, e);
                return Err(LiveCacheError::fold(key, e));
            }
        };
        Ok(self.schedule(key, stamp, state, estimate, reconcile))
    }

    /// Submit a [`Trigger`] implementation
    pub fn submit_trigger<T>(&self, key: impl Into<String>, trigger: T) -> Result<PipelineHandle>
    where
        T: Trigger<S>,
    {
        let trigger = Arc::new(trigger);
        let estimator = Arc::clone(&trigger);
        let reconciler = Arc::clone(&trigger);

        self.try_submit(
            key,
            |previous| trigger.fold(previous),
            move |state| async move { estimator.estimate(state).await },
            move || async move { reconciler.reconcile().await },
        )
    }

    /// Version of the entry currently tracked for `key`
    pub fn current_version(&self, key: &str) -> Option<u64> {
        self.inner.table.get(key).map(|entry| entry.stamp.version)
    }

    /// Latest folded state for `key`
    pub fn snapshot(&self, key: &str) -> Option<S> {
        self.inner.table.get(key).map(|entry| entry.state.clone())
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.inner.table.contains_key(key)
    }

    /// Keys with an entry in the table
    pub fn tracked_keys(&self) -> usize {
        self.inner.table.len()
    }

    /// Keys with a pipeline queued or running
    pub fn queued_keys(&self) -> usize {
        self.inner.queue.active_keys()
    }

    /// Pipelines queued or running for `key`
    pub fn pending(&self, key: &str) -> usize {
        self.inner.queue.pending(&key.to_string())
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Stamp the next version for `key` and store the folded state
    fn write_entry<Er>(
        &self,
        key: &str,
        fold: impl FnOnce(Option<&S>) -> std::result::Result<S, Er>,
    ) -> std::result::Result<(Stamp, S), Er> {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed) + 1;

        match self.inner.table.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let state = fold(Some(&entry.state))?;
                let stamp = entry.stamp.next(token);
                entry.stamp = stamp;
                entry.state = state.clone();
                Ok((stamp, state))
            }
            MapEntry::Vacant(vacant) => {
                let state = fold(None)?;
                let stamp = Stamp::first(token);
                vacant.insert(Entry {
                    stamp,
                    state: state.clone(),
                });
                Ok((stamp, state))
            }
        }
    }

    fn schedule<E, EFut, R, RFut>(
        &self,
        key: String,
        stamp: Stamp,
        state: S,
        estimate: E,
        reconcile: R,
    ) -> PipelineHandle
    where
        E: FnOnce(S) -> EFut + Send + 'static,
        EFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce() -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.stats.record_submitted(self.inner.table.len());
        debug!("Scheduled pipeline {} v{}", key, stamp.version);

        let pipeline = Pipeline {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            stamp,
            phase: PipelinePhase::Created,
        };
        let join = self
            .inner
            .queue
            .enqueue(key.clone(), pipeline.run(state, estimate, reconcile));

        PipelineHandle {
            key,
            version: stamp.version,
            join,
        }
    }
}

/// One submitted trigger working through its stages
struct Pipeline<S> {
    inner: Arc<Inner<S>>,
    key: String,
    stamp: Stamp,
    phase: PipelinePhase,
}

impl<S> Pipeline<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn run<E, EFut, R, RFut>(
        mut self,
        state: S,
        estimate: E,
        reconcile: R,
    ) -> Result<PipelineOutcome>
    where
        E: FnOnce(S) -> EFut + Send + 'static,
        EFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: FnOnce() -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self
            .checkpoint(Checkpoint::BeforeEstimate, PipelinePhase::EstimateRunning)
            .await
        {
            return Ok(PipelineOutcome::Superseded(Checkpoint::BeforeEstimate));
        }
        self.run_stage(StageKind::Estimate, move || estimate(state))
            .await?;

        if !self
            .checkpoint(Checkpoint::BeforeReconcile, PipelinePhase::Reconciling)
            .await
        {
            return Ok(PipelineOutcome::Superseded(Checkpoint::BeforeReconcile));
        }
        self.run_stage(StageKind::Reconcile, reconcile).await?;

        // Compare and remove in one step so a submit landing in between wins
        let stamp = self.stamp;
        let removed = self
            .inner
            .table
            .remove_if(&self.key, |_, entry| entry.stamp == stamp)
            .is_some();

        if removed {
            self.inner.stats.record_completed();
            self.transition(PipelinePhase::Completed).await;
            Ok(PipelineOutcome::Completed)
        } else {
            self.inner.stats.record_superseded();
            self.transition(PipelinePhase::Superseded(Checkpoint::BeforeCleanup))
                .await;
            Ok(PipelineOutcome::Superseded(Checkpoint::BeforeCleanup))
        }
    }

    /// Move to `next` if this pipeline is still the latest for its key
    ///
    /// Observers are awaited during the transition, so the stamp is compared
    /// again afterwards; the last comparison happens with no await between it
    /// and the start of the stage.
    async fn checkpoint(&mut self, at: Checkpoint, next: PipelinePhase) -> bool {
        if self.inner.is_current(&self.key, self.stamp) {
            self.transition(next).await;
            if self.inner.is_current(&self.key, self.stamp) {
                return true;
            }
        }

        self.inner.stats.record_superseded();
        self.transition(PipelinePhase::Superseded(at)).await;
        false
    }

    /// Start and await one stage; panics in either part count as stage errors
    async fn run_stage<St, Fut>(&mut self, stage: StageKind, start: St) -> Result<()>
    where
        St: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let started = Instant::now();
        let guarded = AssertUnwindSafe(async move { start().await }).catch_unwind();

        let outcome = match self.inner.config.timeout_for(stage) {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => Some(outcome),
                Err(_) => None,
            },
            None => Some(guarded.await),
        };

        let result = match outcome {
            Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(LiveCacheError::stage(&self.key, stage, self.stamp.version, e)),
            Some(Err(panic)) => Err(LiveCacheError::stage(
                &self.key,
                stage,
                self.stamp.version,
                anyhow::anyhow!("stage panicked: {}", panic_message(panic.as_ref())),
            )),
            None => {
                let timeout_ms = self
                    .inner
                    .config
                    .timeout_for(stage)
                    .map(|limit| limit.as_millis() as u64)
                    .unwrap_or_default();
                Err(LiveCacheError::timeout(
                    format!("{} stage for {} v{}", stage, self.key, self.stamp.version),
                    timeout_ms,
                ))
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.inner.config.slow_stage_threshold() {
            warn!(
                "Slow {} stage for {} v{}: {:?}",
                stage, self.key, self.stamp.version, elapsed
            );
        }

        if let Err(e) = &result {
            let message = describe(e);
            let timed_out = matches!(e, LiveCacheError::Timeout { .. });
            self.inner.stats.record_failed(timed_out);
            error!(
                "Pipeline {} v{} failed in {} stage: {}",
                self.key, self.stamp.version, stage, message
            );
            self.notify(PipelineEvent::StageFailed {
                key: self.key.clone(),
                version: self.stamp.version,
                stage,
                error: message,
                at: chrono::Utc::now(),
            })
            .await;
            self.transition(PipelinePhase::Failed(stage)).await;
        }

        result
    }

    async fn transition(&mut self, next: PipelinePhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal pipeline transition {} -> {}",
            self.phase,
            next
        );
        let from = std::mem::replace(&mut self.phase, next);
        debug!(
            "Pipeline {} v{}: {} -> {}",
            self.key, self.stamp.version, from, next
        );

        self.notify(PipelineEvent::Transition {
            key: self.key.clone(),
            version: self.stamp.version,
            from,
            to: next,
            at: chrono::Utc::now(),
        })
        .await;
    }

    async fn notify(&self, event: PipelineEvent) {
        for observer in &self.inner.observers {
            observer.on_event(&event).await;
        }
    }
}

/// Error text including the caller's cause
fn describe(err: &LiveCacheError) -> String {
    match std::error::Error::source(err) {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Completion of one submitted pipeline
///
/// Awaiting yields the pipeline's outcome or its stage error. Dropping the
/// handle detaches the pipeline; it keeps running.
#[derive(Debug)]
pub struct PipelineHandle {
    key: String,
    version: u64,
    join: JoinHandle<Result<PipelineOutcome>>,
}

impl PipelineHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Per-key version this pipeline was stamped with
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Let the pipeline run unobserved
    pub fn detach(self) {}
}

impl Future for PipelineHandle {
    type Output = Result<PipelineOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.join).poll(cx);
        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(LiveCacheError::internal_with_source(
                format!("pipeline {} v{} did not finish", self.key, self.version),
                join_error,
            ))),
        }
    }
}
