use std::future::Future;
use std::pin::Pin;

use crate::error::StoreError;
use crate::value::{FieldMap, FieldValue, RecordKey, ScanPage};

/// Boxed future returned by every `HashStore` method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Key-value store с hash-записями (Redis-совместимая семантика).
///
/// Движок миграции не знает конкретных реализаций: для него store —
/// это только этот трейт. Реализации: `storage-memory` (тесты),
/// `storage-redis` (RESP2 по TCP).
pub trait HashStore: Send + Sync {
    /// One step of a cursor scan (`SCAN cursor MATCH pattern COUNT count`).
    ///
    /// Cursor `0` starts an iteration; a returned cursor of `0` ends it.
    /// `count` is a hint, pages may be larger or smaller.
    fn scan<'a>(&'a self, cursor: u64, pattern: &'a str, count: usize) -> StoreFuture<'a, ScanPage>;

    /// All fields of a record. An empty map means the record does not exist.
    fn hgetall<'a>(&'a self, key: &'a RecordKey) -> StoreFuture<'a, FieldMap>;

    /// Delete fields, returning how many were actually present.
    fn hdel<'a>(&'a self, key: &'a RecordKey, fields: &'a [String]) -> StoreFuture<'a, u64>;

    /// Set a field only if it is absent. Returns `true` if the value was written.
    fn hsetnx<'a>(&'a self, key: &'a RecordKey, field: &'a str, value: &'a FieldValue) -> StoreFuture<'a, bool>;

    /// Liveness check.
    fn ping(&self) -> StoreFuture<'_, ()>;
}
