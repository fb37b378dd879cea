use kv_api::StoreError;
use migration_engine::{MigrationError, RunFailed};

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Plan(#[from] MigrationError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Run(#[from] RunFailed),
}
