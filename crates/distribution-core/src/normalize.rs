//! Boundary mapping from raw store statistics onto [`StoreRecord`].
//!
//! Upstream data sources have used several field-naming schemes over time.
//! Every alias is resolved here, once, so the allocation passes only ever see
//! canonical records.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{StoreId, StoreRecord};

/// Rank given to records without a usable priority. Sorts after every ranked store.
pub const UNRANKED_PRIORITY: i64 = i64::MAX;

const ID_FIELDS: &[&str] = &["storeId", "store_id", "id"];
const NESTED_STORE_FIELD: &str = "store";
const STOCK_FIELDS: &[&str] = &["stockNow", "current_stock", "stock", "stock_now"];
const NORM_FIELDS: &[&str] = &["normTarget", "stock_norm", "norm", "min_stock"];
const NEED_FIELDS: &[&str] = &["staticNeed", "need", "deficit"];
const PRIORITY_FIELDS: &[&str] = &["priorityRank", "priority", "rank", "priority_rank"];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    NotAnObject,
    MissingIdentifier,
    DuplicateIdentifier,
    NonNumericField { field: String },
    OutOfRangeField { field: String },
}

/// A non-fatal problem found while normalizing one raw record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataQualityIssue {
    pub record_index: usize,
    pub store_id: Option<StoreId>,
    #[serde(flatten)]
    pub kind: IssueKind,
    pub detail: String,
}

impl DataQualityIssue {
    /// Whether the record carrying this issue was left out of allocation.
    #[must_use]
    pub fn drops_record(&self) -> bool {
        matches!(
            self.kind,
            IssueKind::NotAnObject | IssueKind::MissingIdentifier | IssueKind::DuplicateIdentifier
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedStores {
    pub stores: Vec<StoreRecord>,
    pub issues: Vec<DataQualityIssue>,
}

impl NormalizedStores {
    #[must_use]
    pub fn dropped_count(&self) -> usize {
        self.issues.iter().filter(|issue| issue.drops_record()).count()
    }
}

fn lookup<'a>(
    object: &'a Map<String, Value>,
    aliases: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    aliases.iter().find_map(|alias| {
        object.get(*alias).filter(|value| !value.is_null()).map(|value| (*alias, value))
    })
}

/// Whole non-negative values read without going through `f64`, so integers
/// above 2^53 keep every digit.
fn as_exact_units(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|float| float.is_finite()),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|float| float.is_finite()),
        _ => None,
    }
}

/// 2^64 as an `f64`; anything at or above it does not fit a `u64`.
const UNITS_CEILING: f64 = 18_446_744_073_709_551_616.0;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn units_from(value: f64) -> u64 {
    // `as` saturates: negatives clamp to 0, oversized values to u64::MAX.
    value.floor() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn rank_from(value: f64) -> i64 {
    value.floor() as i64
}

fn resolve_store_id(object: &Map<String, Value>) -> Result<StoreId, String> {
    let candidate = lookup(object, ID_FIELDS).map(|(_, value)| value).or_else(|| {
        object
            .get(NESTED_STORE_FIELD)
            .and_then(Value::as_object)
            .and_then(|store| store.get("id"))
            .filter(|value| !value.is_null())
    });

    let Some(raw) = candidate else {
        return Err("no store identifier field present".to_string());
    };

    if let Some(id) = as_exact_units(raw) {
        return if id >= 1 {
            Ok(StoreId(id))
        } else {
            Err(format!("store identifier {raw} is not a positive integer"))
        };
    }

    // Float spellings such as `3.0`.
    match as_number(raw) {
        Some(float) if float >= 1.0 && float.fract() == 0.0 && float < UNITS_CEILING => {
            Ok(StoreId(units_from(float)))
        }
        _ => Err(format!("store identifier {raw} is not a positive integer")),
    }
}

struct FieldReader<'a> {
    object: &'a Map<String, Value>,
    record_index: usize,
    store_id: StoreId,
    issues: Vec<DataQualityIssue>,
}

impl FieldReader<'_> {
    fn report(&mut self, kind: IssueKind, detail: String) {
        self.issues.push(DataQualityIssue {
            record_index: self.record_index,
            store_id: Some(self.store_id),
            kind,
            detail,
        });
    }

    fn number(&mut self, aliases: &[&'static str]) -> Option<f64> {
        let (field, value) = lookup(self.object, aliases)?;
        let parsed = as_number(value);
        if parsed.is_none() {
            self.report(
                IssueKind::NonNumericField { field: field.to_string() },
                format!("field `{field}` has non-numeric value {value}"),
            );
        }
        parsed
    }

    fn units(&mut self, aliases: &[&'static str]) -> u64 {
        if let Some((_, value)) = lookup(self.object, aliases) {
            if let Some(units) = as_exact_units(value) {
                return units;
            }
        }

        let Some(float) = self.number(aliases) else {
            return 0;
        };
        if float >= UNITS_CEILING {
            let field = lookup(self.object, aliases).map_or("", |(field, _)| field);
            self.report(
                IssueKind::OutOfRangeField { field: field.to_string() },
                format!("field `{field}` value {float} exceeds {}; clamped", u64::MAX),
            );
        }
        units_from(float)
    }
}

fn issue(
    record_index: usize,
    store_id: Option<StoreId>,
    kind: IssueKind,
    detail: String,
) -> DataQualityIssue {
    DataQualityIssue { record_index, store_id, kind, detail }
}

/// Map raw store statistics onto canonical records, preserving input order.
///
/// Records without a positive identifier, non-object entries and repeated
/// identifiers are dropped and reported. Unparseable numeric fields fall back to
/// 0 (unranked for priority) and are reported without dropping the record.
#[must_use]
pub fn normalize_store_records(records: &[Value]) -> NormalizedStores {
    let mut normalized = NormalizedStores::default();
    let mut seen = BTreeSet::new();

    for (record_index, raw) in records.iter().enumerate() {
        let Some(object) = raw.as_object() else {
            normalized.issues.push(issue(
                record_index,
                None,
                IssueKind::NotAnObject,
                format!("store statistics entry is not an object: {raw}"),
            ));
            continue;
        };

        let store_id = match resolve_store_id(object) {
            Ok(store_id) => store_id,
            Err(detail) => {
                normalized.issues.push(issue(
                    record_index,
                    None,
                    IssueKind::MissingIdentifier,
                    detail,
                ));
                continue;
            }
        };

        if !seen.insert(store_id) {
            normalized.issues.push(issue(
                record_index,
                Some(store_id),
                IssueKind::DuplicateIdentifier,
                format!("store {store_id} already listed; keeping the first occurrence"),
            ));
            continue;
        }

        let mut reader = FieldReader { object, record_index, store_id, issues: Vec::new() };
        let stock_now = reader.units(STOCK_FIELDS);
        let norm_target = reader.units(NORM_FIELDS);
        let static_need = reader.units(NEED_FIELDS);
        let priority_rank = reader.number(PRIORITY_FIELDS).map_or(UNRANKED_PRIORITY, rank_from);
        normalized.issues.extend(reader.issues);

        normalized.stores.push(StoreRecord {
            store_id,
            stock_now,
            norm_target,
            static_need,
            priority_rank,
        });
    }

    for item in &normalized.issues {
        match item.store_id {
            Some(store_id) => tracing::warn!(
                record_index = item.record_index,
                store_id = store_id.0,
                "store statistics data-quality issue: {}",
                item.detail
            ),
            None => tracing::warn!(
                record_index = item.record_index,
                "store statistics record dropped: {}",
                item.detail
            ),
        }
    }

    normalized
}
