use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use kv_api::StoreError;

/// Default location of the server config holding `requirepass`.
pub const DEFAULT_REDIS_CONF: &str = "/etc/redis/redis.conf";

/// Параметры клиента, не относящиеся к адресу сервера.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    /// TCP connect + AUTH + SELECT.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Один round-trip команды.
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    /// Количество соединений в пуле. Минимум 1.
    pub pool_size: usize,
    /// Максимальный размер bulk-строки в ответе.
    pub max_bulk: usize,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            pool_size: 2,
            max_bulk: 512 * 1024 * 1024,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ═══════════════════════════════════════════════════════════════
//  redis.conf
// ═══════════════════════════════════════════════════════════════

/// Значение `requirepass` из redis.conf.
///
/// `Ok(None)` — директивы нет или она пустая. Последняя директива в файле
/// побеждает, как и у самого сервера.
pub fn read_requirepass(path: &Path) -> Result<Option<String>, StoreError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| StoreError::logic(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_requirepass(&text))
}

fn parse_requirepass(text: &str) -> Option<String> {
    let mut found = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (directive, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        if !directive.eq_ignore_ascii_case("requirepass") {
            continue;
        }
        let value = unquote(rest.trim());
        found = (!value.is_empty()).then(|| value.to_string());
    }
    found
}

fn unquote(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Пароль для AUTH: явный из CLI, иначе `requirepass` из redis.conf,
/// иначе без пароля. Отсутствующий файл не ошибка.
pub fn resolve_password(explicit: Option<&str>, conf_path: &Path) -> Result<Option<String>, StoreError> {
    if let Some(pw) = explicit.filter(|p| !p.is_empty()) {
        return Ok(Some(pw.to_string()));
    }
    if !conf_path.exists() {
        return Ok(None);
    }
    read_requirepass(conf_path)
}
