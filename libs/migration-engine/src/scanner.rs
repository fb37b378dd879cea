use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kv_api::{HashStore, RecordKey};

use crate::error::MigrationError;
use crate::reporter::{MigrationReporter, NoopReporter};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// `SCAN MATCH` glob.
    pub pattern: String,
    /// `SCAN COUNT` hint — keys examined per round-trip.
    pub count: usize,
    /// Retries of one page after a connection error.
    pub retries: u32,
    /// Backoff unit; attempt `n` sleeps `n * retry_backoff`.
    pub retry_backoff: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pattern: "*".into(),
            count: 100,
            retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  KeyspaceScanner
// ═══════════════════════════════════════════════════════════════

/// Итерация по всему keyspace через курсорный SCAN.
///
/// Store не блокируется на время обхода; в памяти держится не больше
/// одной страницы ключей. Каждый ключ, существовавший на старте обхода,
/// будет выдан хотя бы раз; дубликаты возможны, ключи, созданные во
/// время обхода, — на усмотрение store.
pub struct KeyspaceScanner {
    store: Arc<dyn HashStore>,
    options: ScanOptions,
    reporter: Arc<dyn MigrationReporter>,
}

impl KeyspaceScanner {
    pub fn new(store: Arc<dyn HashStore>, options: ScanOptions) -> Self {
        Self {
            store,
            options,
            reporter: Arc::new(NoopReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn MigrationReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Fresh iteration from cursor 0. Each call restarts the scan.
    pub fn keys(&self) -> KeyStream {
        self.keys_from(0)
    }

    /// Continue an interrupted iteration from a cursor returned by `KeyStream::cursor`.
    pub fn keys_from(&self, cursor: u64) -> KeyStream {
        KeyStream {
            store: self.store.clone(),
            options: self.options.clone(),
            reporter: self.reporter.clone(),
            cursor,
            buffer: VecDeque::new(),
            finished: false,
            pages: 0,
            retries: 0,
        }
    }
}

/// Lazy, finite stream of keys. Pulls one SCAN page at a time.
///
/// `next` is cancel-safe: dropping its future never loses a buffered key
/// or advances the cursor past an unfetched page.
pub struct KeyStream {
    store: Arc<dyn HashStore>,
    options: ScanOptions,
    reporter: Arc<dyn MigrationReporter>,
    cursor: u64,
    buffer: VecDeque<RecordKey>,
    finished: bool,
    pages: u64,
    retries: u32,
}

impl KeyStream {
    pub async fn next(&mut self) -> Result<Option<RecordKey>, MigrationError> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Ok(Some(key));
            }
            if self.finished {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Cursor of the next page to fetch; `0` once the scan is finished
    /// or before the first page.
    pub fn cursor(&self) -> u64 {
        if self.finished { 0 } else { self.cursor }
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Total retries spent across all pages.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    async fn fetch_page(&mut self) -> Result<(), MigrationError> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .scan(self.cursor, &self.options.pattern, self.options.count)
                .await
            {
                Ok(page) => {
                    self.pages += 1;
                    self.buffer.extend(page.keys);
                    if page.cursor == 0 {
                        self.finished = true;
                    } else {
                        self.cursor = page.cursor;
                    }
                    return Ok(());
                }
                Err(e) if e.is_connection() && attempt < self.options.retries => {
                    attempt += 1;
                    self.retries += 1;
                    self.reporter.scan_retry(self.cursor, attempt, &e);
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
                Err(e) if e.is_connection() => {
                    return Err(MigrationError::Connection(
                        e.with_context(format!("SCAN cursor {} after {attempt} retries", self.cursor)),
                    ));
                }
                Err(e) => return Err(MigrationError::Scan(e)),
            }
        }
    }
}
