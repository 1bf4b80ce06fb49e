//! Behavioral tests for the coordinator
//!
//! Ordering-sensitive tests run on the default current-thread runtime and
//! synchronize with oneshot gates, so "before the stages start" is exact.

use async_trait::async_trait;
use futures::future::{join_all, ready, Ready};
use livecache::{
    Checkpoint, Coordinator, CoordinatorConfig, LiveCacheError, PipelineEvent, PipelineObserver,
    PipelineOutcome, PipelinePhase, StageKind, Trigger,
};
use pretty_assertions::assert_eq;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{sleep, timeout};

type Roles = BTreeSet<&'static str>;
type Log = Arc<Mutex<Vec<String>>>;

fn coordinator<S: Clone + Send + Sync + 'static>() -> Coordinator<S> {
    Coordinator::new(CoordinatorConfig::default(), Vec::new()).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn record(log: &Log, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Estimate stage that only records that it ran
fn estimate_step<S: 'static>(
    log: &Log,
    name: &'static str,
) -> impl FnOnce(S) -> Ready<anyhow::Result<()>> + Send + 'static {
    let log = log.clone();
    move |_: S| {
        record(&log, name);
        ready(Ok(()))
    }
}

/// Reconcile stage that only records that it ran
fn reconcile_step(
    log: &Log,
    name: &'static str,
) -> impl FnOnce() -> Ready<anyhow::Result<()>> + Send + 'static {
    let log = log.clone();
    move || {
        record(&log, name);
        ready(Ok(()))
    }
}

fn toggle(previous: Option<&Roles>, role: &'static str) -> Roles {
    let mut roles = previous.cloned().unwrap_or_default();
    if !roles.remove(role) {
        roles.insert(role);
    }
    roles
}

#[tokio::test]
async fn test_versions_increase_from_one() {
    let coord = coordinator::<u32>();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            coord.submit(
                "k",
                |previous| previous.copied().unwrap_or(0) + 1,
                |_| async { Ok(()) },
                || async { Ok(()) },
            )
        })
        .collect();

    let versions: Vec<u64> = handles.iter().map(|h| h.version()).collect();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert_eq!(coord.current_version("k"), Some(4));
    assert_eq!(coord.snapshot("k"), Some(4));

    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            PipelineOutcome::Superseded(Checkpoint::BeforeEstimate),
            PipelineOutcome::Superseded(Checkpoint::BeforeEstimate),
            PipelineOutcome::Superseded(Checkpoint::BeforeEstimate),
            PipelineOutcome::Completed,
        ]
    );
}

#[tokio::test]
async fn test_second_fold_sees_first_fold_immediately() {
    let coord = coordinator::<Roles>();

    let first = coord.submit(
        "u1",
        |previous| {
            assert!(previous.is_none());
            toggle(previous, "red")
        },
        |_| async { Ok(()) },
        || async { Ok(()) },
    );
    let second = coord.submit(
        "u1",
        |previous| {
            assert_eq!(previous, Some(&Roles::from(["red"])));
            toggle(previous, "blue")
        },
        |_| async { Ok(()) },
        || async { Ok(()) },
    );

    // Neither pipeline has been polled yet
    assert_eq!(coord.pending("u1"), 2);
    assert_eq!(coord.snapshot("u1"), Some(Roles::from(["blue", "red"])));

    first.await.unwrap();
    second.await.unwrap();
}

#[tokio::test]
async fn test_burst_runs_only_the_last_pipeline() {
    let coord = coordinator::<Roles>();
    let log = Log::default();

    let fold_log = log.clone();
    let first = coord.submit(
        "u1",
        move |previous| {
            record(&fold_log, "f1");
            toggle(previous, "red")
        },
        estimate_step(&log, "e1"),
        reconcile_step(&log, "r1"),
    );
    assert_eq!(coord.current_version("u1"), Some(1));
    assert_eq!(coord.snapshot("u1"), Some(Roles::from(["red"])));

    let fold_log = log.clone();
    let second = coord.submit(
        "u1",
        move |previous| {
            record(&fold_log, "f2");
            toggle(previous, "blue")
        },
        estimate_step(&log, "e2"),
        reconcile_step(&log, "r2"),
    );
    assert_eq!(coord.current_version("u1"), Some(2));
    assert_eq!(coord.snapshot("u1"), Some(Roles::from(["blue", "red"])));

    assert_eq!(
        first.await.unwrap(),
        PipelineOutcome::Superseded(Checkpoint::BeforeEstimate)
    );
    assert_eq!(second.await.unwrap(), PipelineOutcome::Completed);
    assert_eq!(entries(&log), vec!["f1", "f2", "e2", "r2"]);
    assert!(!coord.is_tracked("u1"));
}

#[tokio::test]
async fn test_superseded_during_estimate_skips_reconcile() {
    let coord = coordinator::<Roles>();
    let log = Log::default();
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let stage_log = log.clone();
    let first = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        move |_| async move {
            record(&stage_log, "e1 start");
            let _ = started_tx.send(());
            let _ = release_rx.await;
            record(&stage_log, "e1 end");
            Ok(())
        },
        reconcile_step(&log, "r1"),
    );

    started_rx.await.unwrap();
    let second = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        estimate_step(&log, "e2"),
        reconcile_step(&log, "r2"),
    );

    // The second pipeline must wait for the first to leave the key's slot
    sleep(Duration::from_millis(20)).await;
    assert_eq!(entries(&log), vec!["e1 start"]);

    release_tx.send(()).unwrap();
    assert_eq!(
        first.await.unwrap(),
        PipelineOutcome::Superseded(Checkpoint::BeforeReconcile)
    );
    assert_eq!(second.await.unwrap(), PipelineOutcome::Completed);
    assert_eq!(entries(&log), vec!["e1 start", "e1 end", "e2", "r2"]);
    assert!(!coord.is_tracked("u1"));
}

#[tokio::test]
async fn test_superseded_during_reconcile_leaves_entry() {
    let coord = coordinator::<Roles>();
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (second_gate_tx, second_gate_rx) = oneshot::channel::<()>();

    let first = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        |_| async { Ok(()) },
        move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        },
    );

    started_rx.await.unwrap();
    let second = coord.submit(
        "u1",
        |previous| toggle(previous, "blue"),
        move |_| async move {
            let _ = second_gate_rx.await;
            Ok(())
        },
        || async { Ok(()) },
    );

    release_tx.send(()).unwrap();
    assert_eq!(
        first.await.unwrap(),
        PipelineOutcome::Superseded(Checkpoint::BeforeCleanup)
    );
    // The newer pipeline owns cleanup
    assert_eq!(coord.current_version("u1"), Some(2));

    second_gate_tx.send(()).unwrap();
    assert_eq!(second.await.unwrap(), PipelineOutcome::Completed);
    assert!(!coord.is_tracked("u1"));
}

#[tokio::test]
async fn test_distinct_keys_interleave() {
    let coord = coordinator::<Roles>();
    let (k2_started_tx, k2_started_rx) = oneshot::channel::<()>();
    let (k1_reconciled_tx, k1_reconciled_rx) = oneshot::channel::<()>();

    // k1's estimate waits on k2, k2's reconcile waits on k1
    let k1 = coord.submit(
        "k1",
        |previous| toggle(previous, "red"),
        move |_| async move {
            let _ = k2_started_rx.await;
            Ok(())
        },
        move || async move {
            let _ = k1_reconciled_tx.send(());
            Ok(())
        },
    );
    let k2 = coord.submit(
        "k2",
        |previous| toggle(previous, "red"),
        move |_| async move {
            let _ = k2_started_tx.send(());
            Ok(())
        },
        move || async move {
            let _ = k1_reconciled_rx.await;
            Ok(())
        },
    );

    let (k1, k2) = timeout(Duration::from_secs(2), async { (k1.await, k2.await) })
        .await
        .expect("pipelines for different keys must not block each other");
    assert_eq!(k1.unwrap(), PipelineOutcome::Completed);
    assert_eq!(k2.unwrap(), PipelineOutcome::Completed);
    assert_eq!(coord.tracked_keys(), 0);
}

#[tokio::test]
async fn test_failed_estimate_does_not_block_key() {
    init_tracing();
    let coord = coordinator::<Roles>();
    let log = Log::default();

    let failing = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        |_| async { Err::<(), _>(anyhow::anyhow!("message edit rejected")) },
        reconcile_step(&log, "r1"),
    );

    match failing.await {
        Err(LiveCacheError::Stage { stage, version, .. }) => {
            assert_eq!(stage, StageKind::Estimate);
            assert_eq!(version, 1);
        }
        other => panic!("expected stage error, got {:?}", other),
    }
    // A failed pipeline does not clean up after itself
    assert_eq!(coord.current_version("u1"), Some(1));

    let retry = coord.submit(
        "u1",
        |previous| {
            assert_eq!(previous, Some(&Roles::from(["red"])));
            toggle(previous, "blue")
        },
        estimate_step(&log, "e2"),
        reconcile_step(&log, "r2"),
    );
    assert_eq!(retry.version(), 2);
    assert_eq!(retry.await.unwrap(), PipelineOutcome::Completed);
    assert_eq!(entries(&log), vec!["e2", "r2"]);
    assert_eq!(coord.stats().failed, 1);
}

#[tokio::test]
async fn test_failed_fold_writes_nothing() {
    let coord = coordinator::<Roles>();
    let log = Log::default();

    let kept = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        estimate_step(&log, "e1"),
        reconcile_step(&log, "r1"),
    );

    let rejected = coord.try_submit(
        "u1",
        |_| Err(anyhow::anyhow!("unknown role")),
        estimate_step(&log, "e2"),
        reconcile_step(&log, "r2"),
    );
    assert!(matches!(rejected, Err(LiveCacheError::Fold { ref key, .. }) if key == "u1"));
    assert_eq!(coord.current_version("u1"), Some(1));
    assert_eq!(coord.snapshot("u1"), Some(Roles::from(["red"])));
    assert_eq!(coord.pending("u1"), 1);

    assert_eq!(kept.await.unwrap(), PipelineOutcome::Completed);
    assert_eq!(entries(&log), vec!["e1", "r1"]);

    let stats = coord.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.fold_failures, 1);
}

#[tokio::test]
async fn test_completed_pipeline_restarts_versioning() {
    let coord = coordinator::<Roles>();

    let first = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        |_| async { Ok(()) },
        || async { Ok(()) },
    );
    assert_eq!(first.await.unwrap(), PipelineOutcome::Completed);

    let saw_absent = Arc::new(Mutex::new(false));
    let flag = saw_absent.clone();
    let again = coord.submit(
        "u1",
        move |previous| {
            *flag.lock().unwrap() = previous.is_none();
            toggle(previous, "red")
        },
        |_| async { Ok(()) },
        || async { Ok(()) },
    );

    assert!(*saw_absent.lock().unwrap());
    assert_eq!(again.version(), 1);
    assert_eq!(again.await.unwrap(), PipelineOutcome::Completed);
}

#[tokio::test]
async fn test_stage_timeout_releases_key() {
    init_tracing();
    let config = CoordinatorConfig {
        estimate_timeout_ms: Some(50),
        ..Default::default()
    };
    let coord: Coordinator<Roles> = Coordinator::new(config, Vec::new()).unwrap();

    let stuck = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        |_| std::future::pending::<anyhow::Result<()>>(),
        || async { Ok(()) },
    );
    match stuck.await {
        Err(LiveCacheError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
        other => panic!("expected timeout, got {:?}", other),
    }

    let next = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        |_| async { Ok(()) },
        || async { Ok(()) },
    );
    assert_eq!(next.await.unwrap(), PipelineOutcome::Completed);

    let stats = coord.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.completed, 1);
}

struct ToggleRole {
    role: &'static str,
    log: Log,
}

#[async_trait]
impl Trigger<Roles> for ToggleRole {
    fn fold(&self, previous: Option<&Roles>) -> anyhow::Result<Roles> {
        if self.role.is_empty() {
            anyhow::bail!("empty role id");
        }
        Ok(toggle(previous, self.role))
    }

    async fn estimate(&self, state: Roles) -> anyhow::Result<()> {
        record(&self.log, &format!("render {:?}", state));
        Ok(())
    }

    async fn reconcile(&self) -> anyhow::Result<()> {
        record(&self.log, &format!("apply {}", self.role));
        Ok(())
    }
}

#[tokio::test]
async fn test_trigger_trait_submission() {
    let coord = coordinator::<Roles>();
    let log = Log::default();

    let first = coord
        .submit_trigger("u1", ToggleRole { role: "red", log: log.clone() })
        .unwrap();
    let second = coord
        .submit_trigger("u1", ToggleRole { role: "blue", log: log.clone() })
        .unwrap();
    assert!(coord
        .submit_trigger("u1", ToggleRole { role: "", log: log.clone() })
        .is_err());

    assert!(!first.await.unwrap().is_completed());
    assert!(second.await.unwrap().is_completed());
    assert_eq!(
        entries(&log),
        vec![r#"render {"blue", "red"}"#, "apply blue"]
    );
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl PipelineObserver for RecordingObserver {
    async fn on_event(&self, event: &PipelineEvent) {
        let line = match event {
            PipelineEvent::Transition { to, .. } => to.to_string(),
            PipelineEvent::StageFailed { stage, .. } => format!("{} error", stage),
        };
        self.events.lock().unwrap().push((event.version(), line));
    }
}

#[tokio::test]
async fn test_observer_sees_state_machine() {
    let observer = Arc::new(RecordingObserver::default());
    let coord: Coordinator<Roles> =
        Coordinator::new(CoordinatorConfig::default(), vec![observer.clone() as Arc<dyn PipelineObserver>]).unwrap();

    let first = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        |_| async { Ok(()) },
        || async { Ok(()) },
    );
    let second = coord.submit(
        "u1",
        |previous| toggle(previous, "blue"),
        |_| async { Ok(()) },
        || async { Err(anyhow::anyhow!("member left the guild")) },
    );
    first.await.unwrap();
    assert!(second.await.is_err());

    let events = observer.events.lock().unwrap().clone();
    let expected: Vec<(u64, String)> = vec![
        (1, PipelinePhase::Superseded(Checkpoint::BeforeEstimate).to_string()),
        (2, "estimating".to_string()),
        (2, "reconciling".to_string()),
        (2, "reconcile error".to_string()),
        (2, "failed (reconcile)".to_string()),
    ];
    assert_eq!(events, expected);
}

/// Parks version 1 as it enters reconcile until the test releases it
struct ParkingObserver {
    parked: Mutex<Option<oneshot::Sender<()>>>,
    release: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl PipelineObserver for ParkingObserver {
    async fn on_event(&self, event: &PipelineEvent) {
        if let PipelineEvent::Transition {
            version: 1,
            to: PipelinePhase::Reconciling,
            ..
        } = event
        {
            let parked = self.parked.lock().unwrap().take();
            if let Some(parked) = parked {
                let _ = parked.send(());
            }
            let release = self.release.lock().await.take();
            if let Some(release) = release {
                let _ = release.await;
            }
        }
    }
}

#[tokio::test]
async fn test_slow_observer_cannot_revive_stale_reconcile() {
    let (parked_tx, parked_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let observer = Arc::new(ParkingObserver {
        parked: Mutex::new(Some(parked_tx)),
        release: tokio::sync::Mutex::new(Some(release_rx)),
    });
    let coord: Coordinator<Roles> =
        Coordinator::new(CoordinatorConfig::default(), vec![observer as Arc<dyn PipelineObserver>]).unwrap();
    let log = Log::default();

    let first = coord.submit(
        "u1",
        |previous| toggle(previous, "red"),
        estimate_step(&log, "e1"),
        reconcile_step(&log, "r1"),
    );
    parked_rx.await.unwrap();

    // v1 already passed its reconcile check and is stuck in the observer
    let second = coord.submit(
        "u1",
        |previous| toggle(previous, "blue"),
        estimate_step(&log, "e2"),
        reconcile_step(&log, "r2"),
    );
    release_tx.send(()).unwrap();

    assert_eq!(
        first.await.unwrap(),
        PipelineOutcome::Superseded(Checkpoint::BeforeReconcile)
    );
    assert_eq!(second.await.unwrap(), PipelineOutcome::Completed);
    assert_eq!(entries(&log), vec!["e1", "e2", "r2"]);

    let stats = coord.stats();
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_are_linearized() {
    let coord = coordinator::<u64>();
    let gate = Arc::new(Semaphore::new(0));
    let submitters = 8;
    let per_submitter = 25;

    let handles = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..submitters)
            .map(|_| {
                let coord = coord.clone();
                let gate = gate.clone();
                scope.spawn(move || {
                    (0..per_submitter)
                        .map(|_| {
                            let gate = gate.clone();
                            coord.submit(
                                "shared",
                                |previous| previous.copied().unwrap_or(0) + 1,
                                move |_| async move {
                                    let _permit = gate.acquire().await;
                                    Ok(())
                                },
                                || async { Ok(()) },
                            )
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect::<Vec<_>>()
    });

    let total = (submitters * per_submitter) as u64;
    assert_eq!(coord.snapshot("shared"), Some(total));
    let mut versions: Vec<u64> = handles.iter().map(|h| h.version()).collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=total).collect::<Vec<_>>());

    gate.add_permits(submitters * per_submitter);
    let outcomes = join_all(handles).await;
    let completed = outcomes
        .into_iter()
        .filter(|outcome| matches!(outcome, Ok(PipelineOutcome::Completed)))
        .count();
    assert_eq!(completed, 1);
    assert!(!coord.is_tracked("shared"));
    assert_eq!(coord.queued_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stages_never_overlap_per_key() {
    let coord = coordinator::<u32>();
    let keys = ["a", "b", "c", "d"];
    let active: Arc<HashMap<&'static str, AtomicUsize>> =
        Arc::new(keys.iter().map(|k| (*k, AtomicUsize::new(0))).collect());
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut last_per_key = HashMap::new();
    let mut all = Vec::new();
    for round in 0..30u64 {
        for key in keys {
            let (active_e, overlaps_e) = (active.clone(), overlaps.clone());
            let (active_r, overlaps_r) = (active.clone(), overlaps.clone());
            let handle = coord.submit(
                key,
                |previous| previous.copied().unwrap_or(0) + 1,
                move |_| async move {
                    if active_e[key].fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps_e.fetch_add(1, Ordering::SeqCst);
                    }
                    sleep(Duration::from_millis(round % 3)).await;
                    active_e[key].fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
                move || async move {
                    if active_r[key].fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps_r.fetch_add(1, Ordering::SeqCst);
                    }
                    sleep(Duration::from_millis(1)).await;
                    active_r[key].fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                },
            );
            if let Some(previous) = last_per_key.insert(key, handle) {
                all.push(previous);
            }
        }
        sleep(Duration::from_millis(round % 4)).await;
    }

    for outcome in join_all(all).await {
        outcome.unwrap();
    }
    for (_, last) in last_per_key {
        // Nothing was submitted after it, so it must win
        assert_eq!(last.await.unwrap(), PipelineOutcome::Completed);
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(coord.tracked_keys(), 0);
    assert_eq!(coord.queued_keys(), 0);
}
