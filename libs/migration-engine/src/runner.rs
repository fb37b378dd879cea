use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use kv_api::{ConnectionParams, HashStore, RecordKey};

use crate::error::{MigrationError, RunFailed};
use crate::patcher::{PatchResult, RecordPatcher};
use crate::plan::{Direction, FieldMigrationPlan};
use crate::reporter::MigrationReporter;
use crate::scanner::{KeyspaceScanner, ScanOptions};

/// Idle → Scanning → (Patching → Scanning)* → Completed.
/// `Failed` is reachable from any state on a fatal error,
/// `Cancelled` on external cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scanning,
    Patching,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled | RunState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scan: ScanOptions,
    /// Records patched in parallel. `1` keeps the run strictly sequential.
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            concurrency: 1,
        }
    }
}

/// A key that could not be migrated, with the reason.
#[derive(Debug)]
pub struct RecordFailure {
    pub key: RecordKey,
    pub error: MigrationError,
}

/// Итог прогона миграции.
#[derive(Debug)]
pub struct MigrationSummary {
    pub direction: Direction,
    pub keys_scanned: u64,
    /// Records that had at least one field added or removed.
    pub records_patched: u64,
    /// Records already in the target shape.
    pub records_unchanged: u64,
    pub fields_added: u64,
    pub fields_removed: u64,
    /// Per-key failures in completion order.
    pub errors: Vec<RecordFailure>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl MigrationSummary {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            keys_scanned: 0,
            records_patched: 0,
            records_unchanged: 0,
            fields_added: 0,
            fields_removed: 0,
            errors: Vec::new(),
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Completed without per-key errors and without interruption.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }

    fn absorb(&mut self, result: &PatchResult) {
        if result.is_noop() {
            self.records_unchanged += 1;
        } else {
            self.records_patched += 1;
        }
        self.fields_added += result.fields_added;
        self.fields_removed += result.fields_removed;
    }
}

type PatchOutcome = (RecordKey, Result<PatchResult, MigrationError>);

// ═══════════════════════════════════════════════════════════════
//  MigrationRunner
// ═══════════════════════════════════════════════════════════════

/// Оркестрирует scan + patch по всему keyspace.
///
/// Ошибки отдельных записей копятся в summary и не прерывают прогон;
/// потеря соединения со store завершает прогон в `Failed`. Каждый patch
/// идемпотентен, поэтому прерванный прогон можно просто запустить заново.
pub struct MigrationRunner {
    store: Arc<dyn HashStore>,
    reporter: Arc<dyn MigrationReporter>,
    options: RunOptions,
    state: watch::Sender<RunState>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn HashStore>, reporter: Arc<dyn MigrationReporter>, options: RunOptions) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            store,
            reporter,
            options,
            state,
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Observe state transitions of this runner.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: RunState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Run `plan` over every key matching the scan pattern.
    ///
    /// `params` identify the store for reporting; the connection itself is
    /// owned by the `HashStore` given at construction.
    pub async fn run(
        &self,
        direction: Direction,
        plan: &FieldMigrationPlan,
        params: &ConnectionParams,
        cancel: &CancellationToken,
    ) -> Result<MigrationSummary, RunFailed> {
        let started = Instant::now();
        let mut summary = MigrationSummary::new(direction);
        self.reporter.run_started(direction, plan, params);

        let plan = Arc::new(plan.clone());
        let patcher = RecordPatcher::new(self.store.clone());
        let mut keys = KeyspaceScanner::new(self.store.clone(), self.options.scan.clone())
            .with_reporter(self.reporter.clone())
            .keys();

        let limit = self.options.concurrency.max(1);
        let mut inflight: JoinSet<PatchOutcome> = JoinSet::new();
        let mut fatal: Option<MigrationError> = None;

        'scan: loop {
            // Bounded pool: wait for a free slot before pulling the next key.
            while inflight.len() >= limit {
                let Some(joined) = inflight.join_next().await else { break };
                if let Err(e) = self.fold_outcome(joined, &mut summary) {
                    fatal = Some(e);
                    break 'scan;
                }
            }

            self.set_state(RunState::Scanning);
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break 'scan;
                }
                next = keys.next() => next,
            };

            match next {
                Ok(Some(key)) => {
                    summary.keys_scanned += 1;
                    self.set_state(RunState::Patching);
                    let patcher = patcher.clone();
                    let plan = plan.clone();
                    inflight.spawn(async move {
                        let result = patcher.patch(&key, &plan).await;
                        (key, result)
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }

        // Already issued patches run to completion; nothing new is started.
        while let Some(joined) = inflight.join_next().await {
            if let Err(e) = self.fold_outcome(joined, &mut summary) {
                fatal.get_or_insert(e);
            }
        }
        summary.elapsed = started.elapsed();

        match fatal {
            Some(error) => {
                self.set_state(RunState::Failed);
                let failure = RunFailed { error, partial: summary };
                self.reporter.run_failed(&failure);
                Err(failure)
            }
            None => {
                self.set_state(if summary.cancelled {
                    RunState::Cancelled
                } else {
                    RunState::Completed
                });
                self.reporter.run_finished(&summary);
                Ok(summary)
            }
        }
    }

    /// Fold one finished patch into the summary. Returns the error only if
    /// it must stop the run.
    fn fold_outcome(
        &self,
        joined: Result<PatchOutcome, JoinError>,
        summary: &mut MigrationSummary,
    ) -> Result<(), MigrationError> {
        match joined {
            Ok((key, Ok(result))) => {
                summary.absorb(&result);
                self.reporter.record_patched(&key, &result);
                Ok(())
            }
            Ok((_, Err(error))) if error.is_fatal() => Err(error),
            Ok((key, Err(error))) => {
                self.reporter.record_failed(&key, &error);
                summary.errors.push(RecordFailure { key, error });
                Ok(())
            }
            Err(e) => Err(MigrationError::Worker(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use kv_api::{FieldMap, FieldValue, StoreError};
    use storage_memory::MemoryHashStore;

    use crate::plan::builtin;
    use crate::reporter::NoopReporter;

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MigrationReporter for RecordingReporter {
        fn run_started(&self, direction: Direction, _plan: &FieldMigrationPlan, _params: &ConnectionParams) {
            self.events.lock().unwrap().push(format!("start {direction}"));
        }

        fn record_failed(&self, key: &RecordKey, _error: &MigrationError) {
            self.events.lock().unwrap().push(format!("failed {key}"));
        }

        fn scan_retry(&self, cursor: u64, attempt: u32, _error: &StoreError) {
            self.events.lock().unwrap().push(format!("retry {cursor} #{attempt}"));
        }

        fn run_finished(&self, summary: &MigrationSummary) {
            self.events.lock().unwrap().push(format!("finished {}", summary.keys_scanned));
        }

        fn run_failed(&self, _failure: &RunFailed) {
            self.events.lock().unwrap().push("failed run".into());
        }
    }

    fn options(concurrency: usize) -> RunOptions {
        RunOptions {
            scan: ScanOptions {
                count: 4,
                retry_backoff: Duration::from_millis(5),
                ..Default::default()
            },
            concurrency,
        }
    }

    async fn legacy_store(n: usize) -> Arc<MemoryHashStore> {
        let store = Arc::new(MemoryHashStore::new());
        for i in 0..n {
            store
                .insert_hash(
                    format!("hk{i:02}"),
                    [
                        ("subtensor_successes", FieldValue::Int(i as i64)),
                        ("subtensor_attempts", FieldValue::Int(10)),
                        ("tier", FieldValue::from("Silver")),
                    ],
                )
                .await;
        }
        store
    }

    fn runner(store: Arc<MemoryHashStore>, reporter: Arc<dyn MigrationReporter>, concurrency: usize) -> MigrationRunner {
        MigrationRunner::new(store, reporter, options(concurrency))
    }

    #[tokio::test]
    async fn rollout_migrates_whole_keyspace() {
        let store = legacy_store(10).await;
        let reporter = Arc::new(RecordingReporter::default());
        let runner = runner(store.clone(), reporter.clone(), 1);

        let summary = runner
            .run(Direction::Rollout, &builtin::rollout(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.keys_scanned, 10);
        assert_eq!(summary.records_patched, 10);
        assert_eq!(summary.fields_removed, 30);
        assert_eq!(summary.fields_added, 100);
        assert!(summary.is_clean());
        assert_eq!(runner.state(), RunState::Completed);

        let record = store.hash("hk03").await.unwrap();
        assert!(!record.contains_key("tier"));
        assert_eq!(record["challenge_attempts"], FieldValue::Int(0));
        assert_eq!(reporter.events(), vec!["start rollout", "finished 10"]);
    }

    #[tokio::test]
    async fn rerun_is_a_noop() {
        let store = legacy_store(6).await;
        let runner = runner(store.clone(), Arc::new(NoopReporter), 1);
        let params = ConnectionParams::default();
        let token = CancellationToken::new();

        runner.run(Direction::Rollout, &builtin::rollout(), &params, &token).await.unwrap();
        let snapshot: Vec<FieldMap> = {
            let mut v = Vec::new();
            for i in 0..6 {
                v.push(store.hash(format!("hk{i:02}")).await.unwrap());
            }
            v
        };

        let second = runner.run(Direction::Rollout, &builtin::rollout(), &params, &token).await.unwrap();
        assert_eq!(second.records_unchanged, 6);
        assert_eq!(second.fields_added + second.fields_removed, 0);
        for (i, before) in snapshot.iter().enumerate() {
            assert_eq!(&store.hash(format!("hk{i:02}")).await.unwrap(), before);
        }
    }

    #[tokio::test]
    async fn rollback_after_rollout() {
        let store = legacy_store(3).await;
        let runner = runner(store.clone(), Arc::new(NoopReporter), 2);
        let params = ConnectionParams::default();
        let token = CancellationToken::new();

        runner.run(Direction::Rollout, &builtin::rollout(), &params, &token).await.unwrap();
        let summary = runner
            .run(Direction::Rollback, &builtin::rollback(), &params, &token)
            .await
            .unwrap();
        assert_eq!(summary.fields_removed, 3 * 8);

        let record = store.hash("hk01").await.unwrap();
        assert_eq!(record["tier"], FieldValue::from("Bronze"));
        assert_eq!(record["subtensor_successes"], FieldValue::Int(0));
        // Asymmetry: rollback keeps the challenge counters rollout introduced.
        assert!(record.contains_key("challenge_successes"));
        assert!(!record.contains_key("uid"));
    }

    #[tokio::test]
    async fn vanished_record_does_not_abort() {
        let store = legacy_store(8).await;
        store.vanish_after_scan("hk04").await;
        let reporter = Arc::new(RecordingReporter::default());
        let runner = runner(store.clone(), reporter.clone(), 1);

        let summary = runner
            .run(Direction::Rollout, &builtin::rollout(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.keys_scanned, 8);
        assert_eq!(summary.records_patched, 7);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].key, RecordKey::from("hk04"));
        assert!(matches!(summary.errors[0].error, MigrationError::RecordNotFound(_)));
        assert!(!summary.is_clean());
        assert!(reporter.events().contains(&"failed hk04".to_string()));
        assert!(store.hash("hk07").await.unwrap().contains_key("uid"));
    }

    #[tokio::test]
    async fn non_hash_keys_are_reported_not_fatal() {
        let store = legacy_store(2).await;
        store.insert_value("selection:hk00", "1, 2, 3").await;
        let runner = runner(store.clone(), Arc::new(NoopReporter), 1);

        let summary = runner
            .run(Direction::Rollout, &builtin::rollout(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.keys_scanned, 3);
        assert_eq!(summary.errors.len(), 1);
        assert!(matches!(summary.errors[0].error, MigrationError::Store { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_scan_failures_are_retried() {
        let store = legacy_store(5).await;
        store.fail_next_scans(2).await;
        let reporter = Arc::new(RecordingReporter::default());
        let runner = runner(store, reporter.clone(), 1);

        let summary = runner
            .run(Direction::Rollout, &builtin::rollout(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.keys_scanned, 5);
        let events = reporter.events();
        assert!(events.contains(&"retry 0 #1".to_string()));
        assert!(events.contains(&"retry 0 #2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_fails_the_run() {
        let store = legacy_store(5).await;
        store.set_disconnected(true).await;
        let reporter = Arc::new(RecordingReporter::default());
        let runner = runner(store, reporter.clone(), 1);
        let mut states = runner.subscribe_state();

        let failure = runner
            .run(Direction::Rollout, &builtin::rollout(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, MigrationError::Connection(_)));
        assert_eq!(failure.partial.keys_scanned, 0);
        assert_eq!(runner.state(), RunState::Failed);
        assert_eq!(*states.borrow_and_update(), RunState::Failed);
        assert_eq!(reporter.events().last().map(String::as_str), Some("failed run"));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_mid_patch_fails_the_run() {
        let store = legacy_store(1).await;
        store.set_latency(Duration::from_millis(20)).await;
        let runner = runner(store.clone(), Arc::new(NoopReporter), 1);
        let token = CancellationToken::new();
        let params = ConnectionParams::default();

        // SCAN answers at t=20ms, the store dies at t=30ms, HGETALL lands at t=40ms.
        let migration = builtin::rollout();
        let run = runner.run(Direction::Rollout, &migration, &params, &token);
        let kill = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.set_disconnected(true).await;
        };
        let (result, _) = tokio::join!(run, kill);

        let failure = result.unwrap_err();
        assert!(matches!(failure.error, MigrationError::Connection(_)));
        assert_eq!(failure.partial.keys_scanned, 1);
        assert_eq!(failure.partial.records_patched, 0);
        assert_eq!(runner.state(), RunState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_promptly() {
        let store = legacy_store(50).await;
        store.set_latency(Duration::from_millis(10)).await;
        let runner = runner(store.clone(), Arc::new(NoopReporter), 1);
        let token = CancellationToken::new();

        let migration = builtin::rollout();
        let params = ConnectionParams::default();
        let run = runner.run(Direction::Rollout, &migration, &params, &token);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        };
        let (result, _) = tokio::join!(run, cancel);

        let summary = result.unwrap();
        assert!(summary.cancelled);
        assert!(summary.keys_scanned < 50);
        assert_eq!(runner.state(), RunState::Cancelled);

        // Every record is either untouched or fully migrated.
        let plan = builtin::rollout();
        for i in 0..50 {
            let record = store.hash(format!("hk{i:02}")).await.unwrap();
            let migrated = record.contains_key("uid");
            if migrated {
                assert!(plan.removals().iter().all(|f| !record.contains_key(f)));
            } else {
                assert!(record.contains_key("tier"));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_workers_cover_every_key() {
        let store = legacy_store(40).await;
        store.set_latency(Duration::from_millis(1)).await;
        let runner = runner(store.clone(), Arc::new(NoopReporter), 8);

        let summary = runner
            .run(Direction::Rollout, &builtin::rollout(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.keys_scanned, 40);
        assert_eq!(summary.records_patched, 40);
        for i in 0..40 {
            let record = store.hash(format!("hk{i:02}")).await.unwrap();
            let (expected, _) = builtin::rollout().apply(&record);
            assert_eq!(record, expected);
        }
    }

    #[tokio::test]
    async fn empty_keyspace_completes() {
        let store = Arc::new(MemoryHashStore::new());
        let runner = runner(store, Arc::new(NoopReporter), 1);
        assert_eq!(runner.state(), RunState::Idle);

        let summary = runner
            .run(Direction::Rollback, &builtin::rollback(), &ConnectionParams::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.keys_scanned, 0);
        assert!(summary.is_clean());
        assert!(runner.state().is_terminal());
    }
}
