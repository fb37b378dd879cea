//! Идемпотентная миграция схемы hash-записей в key-value store.
//!
//! `FieldMigrationPlan` описывает изменение полей, `KeyspaceScanner`
//! обходит keyspace курсором, `RecordPatcher` применяет план к одной записи,
//! `MigrationRunner` связывает всё вместе и возвращает `MigrationSummary`.

pub mod error;
pub mod patcher;
pub mod plan;
pub mod reporter;
pub mod runner;
pub mod scanner;

pub use error::{MigrationError, RunFailed};
pub use patcher::{FieldPatch, PatchResult, RecordPatcher};
pub use plan::{builtin, Direction, FieldMigrationPlan};
pub use reporter::{MigrationReporter, NoopReporter, TracingReporter};
pub use runner::{MigrationRunner, MigrationSummary, RecordFailure, RunOptions, RunState};
pub use scanner::{KeyStream, KeyspaceScanner, ScanOptions};
