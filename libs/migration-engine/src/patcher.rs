use std::sync::Arc;

use kv_api::{FieldMap, FieldValue, HashStore, RecordKey};

use crate::error::MigrationError;
use crate::plan::FieldMigrationPlan;

/// Field counts of one plan application to one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchResult {
    pub fields_removed: u64,
    pub fields_added: u64,
}

impl PatchResult {
    /// Record was already in the target shape.
    pub fn is_noop(&self) -> bool {
        self.fields_removed == 0 && self.fields_added == 0
    }
}

/// Concrete field operations for one record, derived from a plan and a
/// snapshot of the record's current fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPatch {
    pub remove: Vec<String>,
    pub add: Vec<(String, FieldValue)>,
}

impl FieldPatch {
    pub fn compute(plan: &FieldMigrationPlan, snapshot: &FieldMap) -> Self {
        Self {
            remove: plan
                .removals()
                .iter()
                .filter(|f| snapshot.contains_key(f.as_str()))
                .cloned()
                .collect(),
            add: plan
                .additions()
                .iter()
                .filter(|(f, _)| !snapshot.contains_key(f.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }

    /// Apply in memory. Additions never overwrite an existing value.
    pub fn apply_to(&self, fields: &mut FieldMap) -> PatchResult {
        let mut result = PatchResult::default();
        for (name, value) in &self.add {
            if !fields.contains_key(name) {
                fields.insert(name.clone(), value.clone());
                result.fields_added += 1;
            }
        }
        for name in &self.remove {
            if fields.remove(name).is_some() {
                result.fields_removed += 1;
            }
        }
        result
    }
}

// ═══════════════════════════════════════════════════════════════
//  RecordPatcher
// ═══════════════════════════════════════════════════════════════

/// Применяет план к одной записи в store.
///
/// Порядок: HGETALL → HSETNX для отсутствующих полей → один HDEL.
/// Добавления идут первыми: в Redis hash без полей исчезает, и запись,
/// у которой удаляются все старые поля, не должна пропадать даже на миг.
#[derive(Clone)]
pub struct RecordPatcher {
    store: Arc<dyn HashStore>,
}

impl RecordPatcher {
    pub fn new(store: Arc<dyn HashStore>) -> Self {
        Self { store }
    }

    /// Apply `plan` to the record under `key`.
    ///
    /// Idempotent: a second call on the same record returns an all-zero result.
    /// A field written concurrently between the snapshot and `HSETNX` wins and
    /// is not counted as added.
    pub async fn patch(&self, key: &RecordKey, plan: &FieldMigrationPlan) -> Result<PatchResult, MigrationError> {
        let snapshot = self
            .store
            .hgetall(key)
            .await
            .map_err(|e| MigrationError::from_store(key, e))?;
        if snapshot.is_empty() {
            return Err(MigrationError::RecordNotFound(key.clone()));
        }

        let patch = FieldPatch::compute(plan, &snapshot);
        let mut result = PatchResult::default();
        if patch.is_empty() {
            tracing::trace!(%key, "record already migrated");
            return Ok(result);
        }

        for (field, value) in &patch.add {
            let written = self
                .store
                .hsetnx(key, field, value)
                .await
                .map_err(|e| MigrationError::from_store(key, e))?;
            if written {
                result.fields_added += 1;
            }
        }

        if !patch.remove.is_empty() {
            result.fields_removed = self
                .store
                .hdel(key, &patch.remove)
                .await
                .map_err(|e| MigrationError::from_store(key, e))?;
        }

        tracing::debug!(
            %key,
            added = result.fields_added,
            removed = result.fields_removed,
            "record patched"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::builtin;
    use storage_memory::MemoryHashStore;

    fn setup() -> (Arc<MemoryHashStore>, RecordPatcher) {
        let store = Arc::new(MemoryHashStore::new());
        let patcher = RecordPatcher::new(store.clone());
        (store, patcher)
    }

    #[tokio::test]
    async fn rollout_patches_record_in_store() {
        let (store, patcher) = setup();
        store
            .insert_hash("hk1", [("subtensor_successes", FieldValue::Int(5)), ("tier", FieldValue::from("Silver"))])
            .await;

        let result = patcher.patch(&RecordKey::from("hk1"), &builtin::rollout()).await.unwrap();
        assert_eq!(result, PatchResult { fields_removed: 2, fields_added: 10 });

        let record = store.hash("hk1").await.unwrap();
        assert_eq!(record.len(), 10);
        assert_eq!(record["uid"], FieldValue::Int(-1));
        assert_eq!(record["version"], FieldValue::from(""));
        assert!(!record.contains_key("tier"));
    }

    #[tokio::test]
    async fn second_patch_is_noop() {
        let (store, patcher) = setup();
        store.insert_hash("hk1", [("uid", 3i64), ("score", 10i64)]).await;
        let key = RecordKey::from("hk1");
        let plan = builtin::rollback();

        let first = patcher.patch(&key, &plan).await.unwrap();
        let after_first = store.hash("hk1").await.unwrap();
        let second = patcher.patch(&key, &plan).await.unwrap();

        assert_eq!(first, PatchResult { fields_removed: 2, fields_added: 8 });
        assert!(second.is_noop());
        assert_eq!(store.hash("hk1").await.unwrap(), after_first);
        // No writes issued for an already migrated record.
        assert_eq!(store.stats().await.hdel, 1);
    }

    #[tokio::test]
    async fn existing_values_are_not_overwritten() {
        let (store, patcher) = setup();
        store.insert_hash("hk1", [("score", 7i64)]).await;

        let plan = FieldMigrationPlan::new(Vec::<String>::new(), [("score", 0i64), ("uid", -1i64)]).unwrap();
        let result = patcher.patch(&RecordKey::from("hk1"), &plan).await.unwrap();

        assert_eq!(result.fields_added, 1);
        assert_eq!(store.hash("hk1").await.unwrap()["score"], FieldValue::Int(7));
    }

    #[tokio::test]
    async fn missing_record_is_reported() {
        let (_store, patcher) = setup();
        let err = patcher.patch(&RecordKey::from("gone"), &builtin::rollout()).await.unwrap_err();
        assert!(matches!(err, MigrationError::RecordNotFound(ref k) if k.to_string() == "gone"));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn non_hash_value_is_a_record_error() {
        let (store, patcher) = setup();
        store.insert_value("selection:hk1", "1, 2, 3").await;
        let err = patcher
            .patch(&RecordKey::from("selection:hk1"), &builtin::rollout())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Store { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn connection_loss_is_fatal() {
        let (store, patcher) = setup();
        store.insert_hash("hk1", [("uid", 1i64)]).await;
        store.set_disconnected(true).await;
        let err = patcher.patch(&RecordKey::from("hk1"), &builtin::rollback()).await.unwrap_err();
        assert!(matches!(err, MigrationError::Connection(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn record_survives_removing_all_old_fields() {
        let (store, patcher) = setup();
        store.insert_hash("hk1", [("tier", "Gold")]).await;
        let plan = FieldMigrationPlan::new(["tier"], [("uid", -1i64)]).unwrap();

        patcher.patch(&RecordKey::from("hk1"), &plan).await.unwrap();

        let record = store.hash("hk1").await.unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record["uid"], FieldValue::Int(-1));
    }
}
