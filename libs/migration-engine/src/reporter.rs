use std::sync::atomic::{AtomicU64, Ordering};

use kv_api::{ConnectionParams, RecordKey, StoreError};

use crate::error::{MigrationError, RunFailed};
use crate::patcher::PatchResult;
use crate::plan::{Direction, FieldMigrationPlan};
use crate::runner::MigrationSummary;

/// Observer of a migration run, injected into the runner.
///
/// All methods default to no-ops so implementations pick what they need.
pub trait MigrationReporter: Send + Sync {
    fn run_started(&self, _direction: Direction, _plan: &FieldMigrationPlan, _params: &ConnectionParams) {}

    fn record_patched(&self, _key: &RecordKey, _result: &PatchResult) {}

    fn record_failed(&self, _key: &RecordKey, _error: &MigrationError) {}

    fn scan_retry(&self, _cursor: u64, _attempt: u32, _error: &StoreError) {}

    fn run_finished(&self, _summary: &MigrationSummary) {}

    fn run_failed(&self, _failure: &RunFailed) {}
}

/// Reporter that stays silent.
pub struct NoopReporter;

impl MigrationReporter for NoopReporter {}

/// Structured `tracing` events. Progress is logged every `progress_every`
/// processed records (0 disables progress lines).
pub struct TracingReporter {
    progress_every: u64,
    processed: AtomicU64,
}

impl TracingReporter {
    pub fn new(progress_every: u64) -> Self {
        Self {
            progress_every,
            processed: AtomicU64::new(0),
        }
    }

    fn tick(&self) {
        let n = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.progress_every > 0 && n % self.progress_every == 0 {
            tracing::info!(processed = n, "migration progress");
        }
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MigrationReporter for TracingReporter {
    fn run_started(&self, direction: Direction, plan: &FieldMigrationPlan, params: &ConnectionParams) {
        self.processed.store(0, Ordering::Relaxed);
        tracing::info!(
            %direction,
            host = %params.host,
            port = params.port,
            database = params.database,
            removals = ?plan.removals(),
            additions = plan.additions().len(),
            "{direction} starting"
        );
    }

    fn record_patched(&self, key: &RecordKey, result: &PatchResult) {
        if !result.is_noop() {
            tracing::debug!(%key, added = result.fields_added, removed = result.fields_removed, "patched");
        }
        self.tick();
    }

    fn record_failed(&self, key: &RecordKey, error: &MigrationError) {
        match error {
            MigrationError::RecordNotFound(_) => tracing::warn!(%key, "record vanished, skipping"),
            other => tracing::error!(%key, error = %other, "record not migrated"),
        }
        self.tick();
    }

    fn scan_retry(&self, cursor: u64, attempt: u32, error: &StoreError) {
        tracing::warn!(cursor, attempt, error = ?error, "scan failed, retrying from last cursor");
    }

    fn run_finished(&self, summary: &MigrationSummary) {
        let direction = summary.direction;
        if summary.cancelled {
            tracing::warn!(
                keys = summary.keys_scanned,
                added = summary.fields_added,
                removed = summary.fields_removed,
                "{direction} interrupted"
            );
            return;
        }
        tracing::info!(
            keys = summary.keys_scanned,
            patched = summary.records_patched,
            unchanged = summary.records_unchanged,
            added = summary.fields_added,
            removed = summary.fields_removed,
            errors = summary.errors.len(),
            elapsed_s = format_args!("{:.1}", summary.elapsed.as_secs_f64()),
            "{direction} done"
        );
    }

    fn run_failed(&self, failure: &RunFailed) {
        tracing::error!(
            error = %failure.error,
            keys = failure.partial.keys_scanned,
            "error converting to new schema"
        );
    }
}
