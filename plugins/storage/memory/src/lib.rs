use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::RwLock;

use kv_api::{glob_match, FieldMap, FieldValue, HashStore, RecordKey, ScanPage, StoreError, StoreFuture};

// ═══════════════════════════════════════════════════════════════
//  Entries
// ═══════════════════════════════════════════════════════════════

/// Значение под ключом. Не-hash значения нужны, чтобы воспроизводить
/// смешанный keyspace (например, `selection:<hotkey>` строки рядом с hash'ами).
#[derive(Debug, Clone)]
enum Entry {
    Hash(FieldMap),
    Value(Vec<u8>),
}

struct Slot {
    key: RecordKey,
    entry: Entry,
}

/// Счётчики вызовов — тесты проверяют по ним количество round-trip'ов.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub scans: u64,
    pub hgetall: u64,
    pub hdel: u64,
    pub hsetnx: u64,
}

#[derive(Default)]
struct Inner {
    /// Slot id → entry. Ids grow monotonically and are never reused,
    /// so a cursor (next slot id) stays valid across inserts and deletes.
    slots: BTreeMap<u64, Slot>,
    index: HashMap<RecordKey, u64>,
    next_slot: u64,

    // Fault injection.
    scan_failures: u32,
    disconnected: bool,
    vanish_after_scan: HashSet<RecordKey>,
    latency: Option<Duration>,

    stats: MemoryStats,
}

impl Inner {
    fn insert(&mut self, key: RecordKey, entry: Entry) {
        if let Some(id) = self.index.get(&key) {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.entry = entry;
                return;
            }
        }
        self.next_slot += 1;
        let id = self.next_slot;
        self.index.insert(key.clone(), id);
        self.slots.insert(id, Slot { key, entry });
    }

    fn remove(&mut self, key: &RecordKey) -> bool {
        match self.index.remove(key) {
            Some(id) => self.slots.remove(&id).is_some(),
            None => false,
        }
    }

    fn entry_mut(&mut self, key: &RecordKey) -> Option<&mut Entry> {
        let id = self.index.get(key)?;
        self.slots.get_mut(id).map(|s| &mut s.entry)
    }

    fn check_connected(&self) -> Result<(), StoreError> {
        if self.disconnected {
            return Err(StoreError::connection("memory store disconnected"));
        }
        Ok(())
    }
}

fn wrong_type(key: &RecordKey) -> StoreError {
    StoreError::wrong_type(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value ({key})"
    ))
}

// ═══════════════════════════════════════════════════════════════
//  MemoryHashStore
// ═══════════════════════════════════════════════════════════════

/// In-memory `HashStore` с семантикой Redis: hash без полей не существует,
/// SCAN возвращает курсор, ключи сопоставляются glob-паттерном.
///
/// Используется как mock в тестах движка: умеет имитировать обрывы
/// соединения, исчезновение ключей между SCAN и HGETALL и задержки.
#[derive(Default)]
pub struct MemoryHashStore {
    inner: RwLock<Inner>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a hash record. An empty field map removes the key,
    /// matching Redis where a hash with no fields does not exist.
    pub async fn insert_hash<K, I, F, V>(&self, key: K, fields: I)
    where
        K: Into<RecordKey>,
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<FieldValue>,
    {
        let key = key.into();
        let map: FieldMap = fields.into_iter().map(|(f, v)| (f.into(), v.into())).collect();
        let mut inner = self.inner.write().await;
        if map.is_empty() {
            inner.remove(&key);
        } else {
            inner.insert(key, Entry::Hash(map));
        }
    }

    /// Insert a plain (non-hash) value, like Redis `SET`.
    pub async fn insert_value(&self, key: impl Into<RecordKey>, value: impl Into<Vec<u8>>) {
        self.inner
            .write()
            .await
            .insert(key.into(), Entry::Value(value.into()));
    }

    /// Snapshot of a hash record, `None` if absent or not a hash.
    pub async fn hash(&self, key: impl Into<RecordKey>) -> Option<FieldMap> {
        let key = key.into();
        let inner = self.inner.read().await;
        let id = inner.index.get(&key)?;
        match &inner.slots.get(id)?.entry {
            Entry::Hash(map) => Some(map.clone()),
            Entry::Value(_) => None,
        }
    }

    pub async fn remove(&self, key: impl Into<RecordKey>) -> bool {
        self.inner.write().await.remove(&key.into())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> MemoryStats {
        self.inner.read().await.stats
    }

    /// The next `n` scan calls fail with a connection error.
    pub async fn fail_next_scans(&self, n: u32) {
        self.inner.write().await.scan_failures = n;
    }

    /// While disconnected every call fails with a connection error.
    pub async fn set_disconnected(&self, disconnected: bool) {
        self.inner.write().await.disconnected = disconnected;
    }

    /// Delete `key` right after a scan page has returned it, simulating a
    /// record that expires between SCAN and HGETALL.
    pub async fn vanish_after_scan(&self, key: impl Into<RecordKey>) {
        self.inner.write().await.vanish_after_scan.insert(key.into());
    }

    /// Sleep this long inside every call.
    pub async fn set_latency(&self, latency: Duration) {
        self.inner.write().await.latency = Some(latency);
    }

    async fn delay(&self) {
        let latency = self.inner.read().await.latency;
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

impl HashStore for MemoryHashStore {
    fn scan<'a>(&'a self, cursor: u64, pattern: &'a str, count: usize) -> StoreFuture<'a, ScanPage> {
        Box::pin(async move {
            self.delay().await;
            let mut inner = self.inner.write().await;
            inner.stats.scans += 1;
            inner.check_connected()?;
            if inner.scan_failures > 0 {
                inner.scan_failures -= 1;
                return Err(StoreError::connection("connection reset during SCAN"));
            }

            // COUNT is the number of slots examined, not the number matched,
            // so a page may come back empty with a non-zero cursor.
            let count = count.max(1);
            let mut keys = Vec::new();
            let mut next_cursor = 0;
            for (examined, (id, slot)) in inner.slots.range(cursor..).enumerate() {
                if examined == count {
                    next_cursor = *id;
                    break;
                }
                if glob_match(pattern.as_bytes(), slot.key.as_bytes()) {
                    keys.push(slot.key.clone());
                }
            }

            let vanished: Vec<RecordKey> = keys
                .iter()
                .filter(|k| inner.vanish_after_scan.contains(*k))
                .cloned()
                .collect();
            for key in vanished {
                inner.vanish_after_scan.remove(&key);
                inner.remove(&key);
            }

            Ok(ScanPage { cursor: next_cursor, keys })
        })
    }

    fn hgetall<'a>(&'a self, key: &'a RecordKey) -> StoreFuture<'a, FieldMap> {
        Box::pin(async move {
            self.delay().await;
            let mut inner = self.inner.write().await;
            inner.stats.hgetall += 1;
            inner.check_connected()?;
            match inner.entry_mut(key) {
                None => Ok(FieldMap::new()),
                Some(Entry::Hash(map)) => Ok(map.clone()),
                Some(Entry::Value(_)) => Err(wrong_type(key)),
            }
        })
    }

    fn hdel<'a>(&'a self, key: &'a RecordKey, fields: &'a [String]) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.delay().await;
            let mut inner = self.inner.write().await;
            inner.stats.hdel += 1;
            inner.check_connected()?;
            let (removed, now_empty) = match inner.entry_mut(key) {
                None => return Ok(0),
                Some(Entry::Value(_)) => return Err(wrong_type(key)),
                Some(Entry::Hash(map)) => {
                    let removed = fields.iter().filter(|f| map.remove(f.as_str()).is_some()).count();
                    (removed as u64, map.is_empty())
                }
            };
            if now_empty {
                inner.remove(key);
            }
            Ok(removed)
        })
    }

    fn hsetnx<'a>(&'a self, key: &'a RecordKey, field: &'a str, value: &'a FieldValue) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.delay().await;
            let mut inner = self.inner.write().await;
            inner.stats.hsetnx += 1;
            inner.check_connected()?;
            match inner.entry_mut(key) {
                Some(Entry::Value(_)) => Err(wrong_type(key)),
                Some(Entry::Hash(map)) => {
                    if map.contains_key(field) {
                        return Ok(false);
                    }
                    map.insert(field.to_string(), value.clone());
                    Ok(true)
                }
                None => {
                    let mut map = FieldMap::new();
                    map.insert(field.to_string(), value.clone());
                    inner.insert(key.clone(), Entry::Hash(map));
                    Ok(true)
                }
            }
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.delay().await;
            self.inner.read().await.check_connected()
        })
    }
}
