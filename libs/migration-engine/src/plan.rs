use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use kv_api::{FieldMap, FieldValue};

use crate::error::MigrationError;
use crate::patcher::{FieldPatch, PatchResult};

// ═══════════════════════════════════════════════════════════════
//  Direction
// ═══════════════════════════════════════════════════════════════

/// Направление миграции схемы release 2.1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Rollout,
    Rollback,
}

impl Direction {
    /// The plan this direction runs when no override is configured.
    pub fn builtin_plan(self) -> FieldMigrationPlan {
        match self {
            Direction::Rollout => builtin::rollout(),
            Direction::Rollback => builtin::rollback(),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Rollout => f.write_str("rollout"),
            Direction::Rollback => f.write_str("rollback"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rollout" => Ok(Direction::Rollout),
            "rollback" => Ok(Direction::Rollback),
            other => Err(format!("unknown run type '{other}', expected rollout or rollback")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  FieldMigrationPlan
// ═══════════════════════════════════════════════════════════════

/// Declarative per-record field change: which fields to drop and which
/// to add (with their defaults) when absent.
///
/// Invariants, checked at construction and deserialization:
/// - no field name is both removed and added;
/// - names are non-empty and not repeated within a list.
///
/// Together they make one application idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlanDoc", into = "PlanDoc")]
pub struct FieldMigrationPlan {
    removals: Vec<String>,
    additions: Vec<(String, FieldValue)>,
}

impl FieldMigrationPlan {
    pub fn new<R, A, N, V>(removals: R, additions: A) -> Result<Self, MigrationError>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        A: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<FieldValue>,
    {
        let plan = Self {
            removals: removals.into_iter().map(Into::into).collect(),
            additions: additions.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), MigrationError> {
        let mut removed = HashSet::new();
        for name in &self.removals {
            if name.is_empty() {
                return Err(MigrationError::InvalidPlan("empty field name in removals".into()));
            }
            if !removed.insert(name.as_str()) {
                return Err(MigrationError::InvalidPlan(format!("field '{name}' removed twice")));
            }
        }

        let mut added = HashSet::new();
        for (name, _) in &self.additions {
            if name.is_empty() {
                return Err(MigrationError::InvalidPlan("empty field name in additions".into()));
            }
            if !added.insert(name.as_str()) {
                return Err(MigrationError::InvalidPlan(format!("field '{name}' added twice")));
            }
            if removed.contains(name.as_str()) {
                return Err(MigrationError::InvalidPlan(format!(
                    "field '{name}' is both removed and added"
                )));
            }
        }
        Ok(())
    }

    /// Fields deleted when present, in declaration order.
    pub fn removals(&self) -> &[String] {
        &self.removals
    }

    /// Fields set to their default when absent, in declaration order.
    pub fn additions(&self) -> &[(String, FieldValue)] {
        &self.additions
    }

    pub fn removes(&self, field: &str) -> bool {
        self.removals.iter().any(|f| f == field)
    }

    pub fn adds(&self, field: &str) -> bool {
        self.additions.iter().any(|(f, _)| f == field)
    }

    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }

    /// Result of applying the plan once to `fields`, without touching a store.
    pub fn apply(&self, fields: &FieldMap) -> (FieldMap, PatchResult) {
        let mut out = fields.clone();
        let result = FieldPatch::compute(self, fields).apply_to(&mut out);
        (out, result)
    }
}

/// Serialized form: `remove = [...]` plus an `[add]` table.
#[derive(Serialize, Deserialize)]
struct PlanDoc {
    #[serde(default)]
    remove: Vec<String>,
    #[serde(default)]
    add: BTreeMap<String, FieldValue>,
}

impl TryFrom<PlanDoc> for FieldMigrationPlan {
    type Error = MigrationError;

    fn try_from(doc: PlanDoc) -> Result<Self, Self::Error> {
        FieldMigrationPlan::new(doc.remove, doc.add)
    }
}

impl From<FieldMigrationPlan> for PlanDoc {
    fn from(plan: FieldMigrationPlan) -> Self {
        PlanDoc {
            remove: plan.removals,
            add: plan.additions.into_iter().collect(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Built-in plans (release 2.1.0)
// ═══════════════════════════════════════════════════════════════

/// Field lists of the 2.1.0 schema change. The two directions are not exact
/// inverses: rollback keeps `challenge_*` (it even adds them) and `tier`
/// comes back as `Bronze` whatever it was before. Kept as shipped.
pub mod builtin {
    use kv_api::FieldValue;

    use super::FieldMigrationPlan;

    fn plan(removals: &[&str], additions: &[(&str, FieldValue)]) -> FieldMigrationPlan {
        let plan = FieldMigrationPlan {
            removals: removals.iter().map(|s| s.to_string()).collect(),
            additions: additions.iter().map(|(n, v)| (n.to_string(), v.clone())).collect(),
        };
        debug_assert!(plan.validate().is_ok());
        plan
    }

    pub fn rollout() -> FieldMigrationPlan {
        plan(
            &[
                "subtensor_successes",
                "subtensor_attempts",
                "metric_successes",
                "metric_attempts",
                "total_successes",
                "tier",
            ],
            &[
                ("uid", FieldValue::Int(-1)),
                ("version", FieldValue::Str(String::new())),
                ("country", FieldValue::Str(String::new())),
                ("score", FieldValue::Int(0)),
                ("availability_score", FieldValue::Int(0)),
                ("latency_score", FieldValue::Int(0)),
                ("reliability_score", FieldValue::Int(0)),
                ("distribution_score", FieldValue::Int(0)),
                ("challenge_successes", FieldValue::Int(0)),
                ("challenge_attempts", FieldValue::Int(0)),
            ],
        )
    }

    pub fn rollback() -> FieldMigrationPlan {
        plan(
            &[
                "uid",
                "version",
                "country",
                "score",
                "availability_score",
                "latency_score",
                "reliability_score",
                "distribution_score",
            ],
            &[
                ("subtensor_successes", FieldValue::Int(0)),
                ("subtensor_attempts", FieldValue::Int(0)),
                ("metric_successes", FieldValue::Int(0)),
                ("metric_attempts", FieldValue::Int(0)),
                ("total_successes", FieldValue::Int(0)),
                ("tier", FieldValue::Str("Bronze".into())),
                ("challenge_successes", FieldValue::Int(0)),
                ("challenge_attempts", FieldValue::Int(0)),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, FieldValue)]) -> FieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn overlapping_plan_is_rejected() {
        let err = FieldMigrationPlan::new(["score"], [("score", 0i64)]).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidPlan(ref m) if m.contains("score")));
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        assert!(FieldMigrationPlan::new(["tier", "tier"], Vec::<(&str, i64)>::new()).is_err());
        assert!(FieldMigrationPlan::new([""], Vec::<(&str, i64)>::new()).is_err());
        assert!(FieldMigrationPlan::new(Vec::<&str>::new(), [("uid", -1i64), ("uid", 0i64)]).is_err());
    }

    #[test]
    fn builtin_plans_are_valid() {
        for direction in [Direction::Rollout, Direction::Rollback] {
            let plan = direction.builtin_plan();
            assert!(plan.validate().is_ok(), "{direction}");
            assert!(!plan.is_empty());
        }
        assert_eq!(builtin::rollout().removals().len(), 6);
        assert_eq!(builtin::rollout().additions().len(), 10);
        assert_eq!(builtin::rollback().removals().len(), 8);
        assert_eq!(builtin::rollback().additions().len(), 8);
    }

    #[test]
    fn plans_are_asymmetric() {
        let rollout = builtin::rollout();
        let rollback = builtin::rollback();
        assert!(rollout.adds("challenge_successes"));
        assert!(!rollback.removes("challenge_successes"));
        assert!(rollback.adds("challenge_successes"));
        assert!(rollout.removes("tier"));
        assert!(rollback.adds("tier"));
    }

    #[test]
    fn rollout_scenario() {
        let before = fields(&[
            ("subtensor_successes", FieldValue::Int(5)),
            ("tier", FieldValue::from("Silver")),
        ]);
        let (after, result) = builtin::rollout().apply(&before);

        assert!(!after.contains_key("subtensor_successes"));
        assert!(!after.contains_key("tier"));
        let expected = fields(&[
            ("uid", FieldValue::Int(-1)),
            ("version", FieldValue::from("")),
            ("country", FieldValue::from("")),
            ("score", FieldValue::Int(0)),
            ("availability_score", FieldValue::Int(0)),
            ("latency_score", FieldValue::Int(0)),
            ("reliability_score", FieldValue::Int(0)),
            ("distribution_score", FieldValue::Int(0)),
            ("challenge_successes", FieldValue::Int(0)),
            ("challenge_attempts", FieldValue::Int(0)),
        ]);
        assert_eq!(after, expected);
        assert_eq!(result, PatchResult { fields_removed: 2, fields_added: 10 });
    }

    #[test]
    fn rollback_scenario() {
        let before = fields(&[("uid", FieldValue::Int(3)), ("score", FieldValue::Int(10))]);
        let (after, result) = builtin::rollback().apply(&before);

        let expected = fields(&[
            ("tier", FieldValue::from("Bronze")),
            ("subtensor_successes", FieldValue::Int(0)),
            ("subtensor_attempts", FieldValue::Int(0)),
            ("metric_successes", FieldValue::Int(0)),
            ("metric_attempts", FieldValue::Int(0)),
            ("total_successes", FieldValue::Int(0)),
            ("challenge_successes", FieldValue::Int(0)),
            ("challenge_attempts", FieldValue::Int(0)),
        ]);
        assert_eq!(after, expected);
        assert_eq!(result, PatchResult { fields_removed: 2, fields_added: 8 });
    }

    #[test]
    fn apply_is_idempotent_and_keeps_existing_values() {
        let before = fields(&[("score", FieldValue::Int(7)), ("tier", FieldValue::from("Gold"))]);
        let plan = builtin::rollout();
        let (once, _) = plan.apply(&before);
        let (twice, second) = plan.apply(&once);

        assert_eq!(once, twice);
        assert!(second.is_noop());
        assert_eq!(once["score"], FieldValue::Int(7));
    }

    #[test]
    fn completeness_on_arbitrary_records() {
        let plan = builtin::rollback();
        let before = fields(&[
            ("uid", FieldValue::Int(1)),
            ("hotkey", FieldValue::from("5F3s")),
            ("tier", FieldValue::from("Diamond")),
        ]);
        let (after, _) = plan.apply(&before);

        let mut expected: FieldMap = before
            .iter()
            .filter(|(k, _)| !plan.removes(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, default) in plan.additions() {
            expected.entry(name.clone()).or_insert_with(|| default.clone());
        }
        assert_eq!(after, expected);
        assert_eq!(after["tier"], FieldValue::from("Diamond"));
    }

    #[test]
    fn plan_from_toml() {
        let plan: FieldMigrationPlan = toml::from_str(
            r#"
            remove = ["legacy"]
            [add]
            uid = -1
            country = ""
            "#,
        )
        .unwrap();
        assert_eq!(plan.removals().to_vec(), vec!["legacy".to_string()]);
        assert!(plan.adds("uid"));
        assert!(plan.adds("country"));

        let bad: Result<FieldMigrationPlan, _> = toml::from_str(
            r#"
            remove = ["uid"]
            [add]
            uid = -1
            "#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn direction_parsing() {
        assert_eq!("rollout".parse::<Direction>(), Ok(Direction::Rollout));
        assert_eq!(" Rollback ".parse::<Direction>(), Ok(Direction::Rollback));
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!(Direction::default(), Direction::Rollout);
    }
}
