use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kv_api::HashStore;
use migration_engine::{MigrationRunner, MigrationSummary, TracingReporter};
use storage_redis::{read_requirepass, resolve_password, RedisStore};

use super::config::Effective;
use super::error::MigrateError;

/// Process exit status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    /// Finished, but some records were not migrated.
    PartialFailure,
    Interrupted,
}

impl Outcome {
    pub fn of(summary: &MigrationSummary) -> Self {
        if summary.cancelled {
            Outcome::Interrupted
        } else if summary.errors.is_empty() {
            Outcome::Clean
        } else {
            Outcome::PartialFailure
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Clean => 0,
            Outcome::PartialFailure => 2,
            Outcome::Interrupted => 130,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Environment check
// ═══════════════════════════════════════════════════════════════

/// Проверка окружения перед запуском. Ничего не блокирует, только
/// возвращает предупреждения.
pub fn check_environment(explicit_password: Option<&str>, conf_path: &Path) -> Vec<String> {
    if explicit_password.is_some_and(|p| !p.is_empty()) {
        return Vec::new();
    }
    if !conf_path.exists() {
        return vec![format!(
            "{} not found and no --redis_password given, connecting without AUTH",
            conf_path.display()
        )];
    }
    match read_requirepass(conf_path) {
        Ok(Some(_)) => Vec::new(),
        Ok(None) => vec![format!(
            "no requirepass in {}, connecting without AUTH",
            conf_path.display()
        )],
        Err(e) => vec![format!("{e}, connecting without AUTH")],
    }
}

// ═══════════════════════════════════════════════════════════════
//  Main dispatch
// ═══════════════════════════════════════════════════════════════

pub async fn run(eff: &Effective) -> Result<MigrationSummary, MigrateError> {
    // --- Environment ---
    for warning in check_environment(eff.redis_password.as_deref(), &eff.redis_conf_path) {
        tracing::warn!("{warning}");
    }
    let password = match resolve_password(eff.redis_password.as_deref(), &eff.redis_conf_path) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "password lookup failed");
            None
        }
    };

    // --- Connect ---
    let mut params = eff.params.clone();
    params.password = password;
    let store = RedisStore::connect(params.clone(), eff.redis.clone())
        .await
        .map_err(|e| e.with_context(format!("redis at {}", params.addr())))?;
    store.ping().await?;
    let store = Arc::new(store);

    // --- Ctrl+C → cooperative cancel ---
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, waiting for in-flight records");
            signal_token.cancel();
        }
    });

    // --- Run ---
    let reporter = Arc::new(TracingReporter::new(eff.progress_every));
    let runner = MigrationRunner::new(store, reporter, eff.run.clone());
    let summary = runner.run(eff.direction, &eff.plan, &params, &token).await?;

    print_summary(&summary);
    Ok(summary)
}

fn print_summary(summary: &MigrationSummary) {
    println!(
        "{}: {} keys scanned, {} patched, {} unchanged, +{} / -{} fields, {} errors in {:.1}s",
        summary.direction,
        summary.keys_scanned,
        summary.records_patched,
        summary.records_unchanged,
        summary.fields_added,
        summary.fields_removed,
        summary.errors.len(),
        summary.elapsed.as_secs_f64(),
    );
    for failure in &summary.errors {
        println!("  {}: {}", failure.key, failure.error);
    }
}
