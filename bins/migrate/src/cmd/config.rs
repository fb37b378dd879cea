use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::Deserialize;

use kv_api::{ConnectionParams, FieldValue};
use migration_engine::{Direction, FieldMigrationPlan, RunOptions, ScanOptions};
use storage_redis::{RedisOptions, DEFAULT_REDIS_CONF};

use super::error::MigrateError;

// ═══════════════════════════════════════════════════════════════
//  Config file (TOML)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct MigrateConfig {
    pub run_type: Option<Direction>,
    pub redis_password: Option<String>,
    pub redis_conf_path: Option<PathBuf>,
    pub database_host: Option<String>,
    pub database_port: Option<u16>,
    pub database_index: Option<u32>,
    pub pattern: Option<String>,
    pub concurrency: Option<usize>,
    pub scan_count: Option<usize>,
    pub scan_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub progress_every: Option<u64>,
    /// Таймауты и размер пула клиента.
    #[serde(default)]
    pub redis: RedisOptions,
    #[serde(default)]
    pub plans: PlanOverrides,
}

/// `[plans.rollout]` / `[plans.rollback]` — замена встроенного плана.
/// Таблицы читаются как есть и проверяются в `Effective`, чтобы ошибка
/// плана отличалась от синтаксической ошибки файла.
#[derive(Debug, Default, Deserialize)]
pub struct PlanOverrides {
    pub rollout: Option<PlanTable>,
    pub rollback: Option<PlanTable>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlanTable {
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub add: BTreeMap<String, FieldValue>,
}

impl PlanTable {
    fn build(self) -> Result<FieldMigrationPlan, MigrateError> {
        Ok(FieldMigrationPlan::new(self.remove, self.add)?)
    }
}

impl PlanOverrides {
    /// Validate both overrides, then pick the one for `direction`.
    fn resolve(self, direction: Direction) -> Result<Option<FieldMigrationPlan>, MigrateError> {
        let rollout = self.rollout.map(PlanTable::build).transpose()?;
        let rollback = self.rollback.map(PlanTable::build).transpose()?;
        Ok(match direction {
            Direction::Rollout => rollout,
            Direction::Rollback => rollback,
        })
    }
}

pub fn load_config(path: &str) -> Result<MigrateConfig, MigrateError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| MigrateError::Config(format!("cannot read config {path}: {e}")))?;
    toml::from_str(&content).map_err(|e| MigrateError::Config(format!("bad config {path}: {e}")))
}

// ═══════════════════════════════════════════════════════════════
//  CLI args
// ═══════════════════════════════════════════════════════════════

#[derive(Args, Clone, Debug)]
pub struct MigrateArgs {
    /// Путь к kv-migrate.toml (необязательный)
    #[arg(long, default_value = "kv-migrate.toml", env = "KV_MIGRATE_CONFIG")]
    pub config: String,

    /// Направление: rollout или rollback
    #[arg(long = "run-type", visible_alias = "run_type")]
    pub run_type: Option<Direction>,

    /// Пароль Redis. Без указания берётся requirepass из redis.conf
    #[arg(long = "redis_password", visible_alias = "redis-password", env = "REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// Путь к redis.conf
    #[arg(long = "redis_conf_path", visible_alias = "redis-conf-path")]
    pub redis_conf_path: Option<PathBuf>,

    /// Хост Redis
    #[arg(long = "database_host", visible_alias = "database-host")]
    pub database_host: Option<String>,

    /// Порт Redis
    #[arg(long = "database_port", visible_alias = "database-port")]
    pub database_port: Option<u16>,

    /// Номер базы (SELECT)
    #[arg(long = "database_index", visible_alias = "database-index")]
    pub database_index: Option<u32>,

    /// Glob для SCAN MATCH
    #[arg(long)]
    pub pattern: Option<String>,

    /// Сколько записей патчится параллельно
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Подсказка COUNT для SCAN
    #[arg(long = "scan-count")]
    pub scan_count: Option<usize>,
}

// ═══════════════════════════════════════════════════════════════
//  Effective — merged config
// ═══════════════════════════════════════════════════════════════

/// Итоговая конфигурация после мержа: kv-migrate.toml < env/CLI
#[derive(Debug)]
pub struct Effective {
    pub direction: Direction,
    pub plan: FieldMigrationPlan,
    /// `password` is left empty here; it is resolved against redis.conf at run time.
    pub params: ConnectionParams,
    pub redis_password: Option<String>,
    pub redis_conf_path: PathBuf,
    pub run: RunOptions,
    pub redis: RedisOptions,
    pub progress_every: u64,
}

impl Effective {
    pub fn new(args: &MigrateArgs) -> Result<Self, MigrateError> {
        let cfg = match load_config(&args.config) {
            Ok(c) => c,
            Err(e) => {
                if Path::new(&args.config).exists() {
                    return Err(e);
                }
                MigrateConfig::default()
            }
        };
        Self::merge(args, cfg)
    }

    fn merge(args: &MigrateArgs, cfg: MigrateConfig) -> Result<Self, MigrateError> {
        let direction = args.run_type.or(cfg.run_type).unwrap_or_default();
        let plan = cfg.plans.resolve(direction)?.unwrap_or_else(|| direction.builtin_plan());

        let defaults = ConnectionParams::default();
        let params = ConnectionParams {
            host: args.database_host.clone().or(cfg.database_host).unwrap_or(defaults.host),
            port: args.database_port.or(cfg.database_port).unwrap_or(defaults.port),
            database: args.database_index.or(cfg.database_index).unwrap_or(defaults.database),
            password: None,
        };
        if params.host.is_empty() {
            return Err(MigrateError::Config("database_host must not be empty".into()));
        }
        if params.port == 0 {
            return Err(MigrateError::Config("database_port must be in 1..=65535".into()));
        }

        let concurrency = args.concurrency.or(cfg.concurrency).unwrap_or(1);
        if concurrency == 0 {
            return Err(MigrateError::Config("concurrency must be at least 1".into()));
        }
        let scan_defaults = ScanOptions::default();
        let scan = ScanOptions {
            pattern: args.pattern.clone().or(cfg.pattern).unwrap_or(scan_defaults.pattern),
            count: args.scan_count.or(cfg.scan_count).unwrap_or(scan_defaults.count),
            retries: cfg.scan_retries.unwrap_or(scan_defaults.retries),
            retry_backoff: cfg
                .retry_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(scan_defaults.retry_backoff),
        };
        if scan.count == 0 {
            return Err(MigrateError::Config("scan-count must be at least 1".into()));
        }

        // One connection per patch worker plus one for the scan.
        let mut redis = cfg.redis;
        redis.pool_size = redis.pool_size.max(concurrency + 1);

        Ok(Self {
            direction,
            plan,
            params,
            redis_password: args.redis_password.clone().or(cfg.redis_password),
            redis_conf_path: args
                .redis_conf_path
                .clone()
                .or(cfg.redis_conf_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REDIS_CONF)),
            run: RunOptions { scan, concurrency },
            redis,
            progress_every: cfg.progress_every.unwrap_or(1000),
        })
    }
}
