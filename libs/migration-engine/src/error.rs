use kv_api::{RecordKey, StoreError};

use crate::runner::MigrationSummary;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("store unreachable: {0}")]
    Connection(StoreError),

    #[error("scan failed: {0}")]
    Scan(StoreError),

    #[error("record '{0}' vanished before it could be patched")]
    RecordNotFound(RecordKey),

    #[error("record '{key}': {source}")]
    Store {
        key: RecordKey,
        #[source]
        source: StoreError,
    },

    #[error("patch worker failed: {0}")]
    Worker(String),
}

impl MigrationError {
    /// Classify a store error raised while working on one record.
    ///
    /// Connection errors stay run-level; everything else is pinned to the key.
    pub fn from_store(key: &RecordKey, e: StoreError) -> Self {
        if e.is_connection() {
            MigrationError::Connection(e.with_context(format!("record '{key}'")))
        } else {
            MigrationError::Store { key: key.clone(), source: e }
        }
    }

    /// Fatal errors terminate the run; the rest are recorded per key.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::Connection(_) | MigrationError::Scan(_) | MigrationError::Worker(_)
        )
    }
}

/// A run that hit a fatal error. `partial` holds whatever was counted
/// before the failure; already patched records stay patched.
#[derive(Debug, thiserror::Error)]
#[error("{} run failed after {} keys: {error}", .partial.direction, .partial.keys_scanned)]
pub struct RunFailed {
    #[source]
    pub error: MigrationError,
    pub partial: MigrationSummary,
}
