use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod normalize;
mod stages;

pub use normalize::{
    normalize_store_records, DataQualityIssue, IssueKind, NormalizedStores, UNRANKED_PRIORITY,
};
pub use stages::{
    deficit_pass, hygiene_pass, surplus_order, surplus_pass, DeficitMode, StageResult,
};

pub const RULESET_VERSION: &str = "distribution.v1";

/// Largest produced quantity accepted. Quantities arrive as JSON numbers, and
/// above 2^53 an `f64` can no longer represent every whole unit.
pub const MAX_PRODUCED_QUANTITY: u64 = 9_007_199_254_740_991;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DistributionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StoreId(pub u64);

impl Display for StoreId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Build a product identifier from caller input.
    ///
    /// # Errors
    /// Returns [`DistributionError::Validation`] when the identifier is blank.
    pub fn parse(value: &str) -> Result<Self, DistributionError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DistributionError::Validation(
                "product_id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProductId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical per-store statistics for one product, produced by the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    pub store_id: StoreId,
    pub stock_now: u64,
    pub norm_target: u64,
    /// Upstream deficit hint. Kept for audit output only; allocation recomputes
    /// need after the hygiene pass.
    pub static_need: u64,
    pub priority_rank: i64,
}

impl StoreRecord {
    #[must_use]
    pub fn new(store_id: u64, stock_now: u64, norm_target: u64) -> Self {
        Self {
            store_id: StoreId(store_id),
            stock_now,
            norm_target,
            static_need: norm_target.saturating_sub(stock_now),
            priority_rank: UNRANKED_PRIORITY,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority_rank: i64) -> Self {
        self.priority_rank = priority_rank;
        self
    }
}

/// Running allocation for one run. `allocated[i]` belongs to `stores[i]` of the
/// slice the run was started with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AllocationState {
    pub allocated: Vec<u64>,
    pub remaining: u64,
}

impl AllocationState {
    #[must_use]
    pub fn new(store_count: usize, produced: u64) -> Self {
        Self { allocated: vec![0; store_count], remaining: produced }
    }

    #[must_use]
    pub fn total_allocated(&self) -> u64 {
        self.allocated.iter().sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Hygiene,
    Deficit,
    Surplus,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hygiene => "hygiene",
            Self::Deficit => "deficit",
            Self::Surplus => "surplus",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub stage: Stage,
    pub units_allocated: u64,
    pub remaining_after: u64,
    pub stores_touched: usize,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationTrace {
    pub ruleset_version: String,
    pub deficit_mode: DeficitMode,
    pub stages: Vec<StageSummary>,
    pub tie_breakers: Vec<String>,
}

/// Result of one allocation run for one product.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub product_id: ProductId,
    pub original_quantity: u64,
    pub distributed: BTreeMap<StoreId, u64>,
    pub remaining: u64,
    pub trace: AllocationTrace,
    #[serde(default)]
    pub issues: Vec<DataQualityIssue>,
}

impl Distribution {
    #[must_use]
    pub fn total_distributed(&self) -> u64 {
        self.distributed.values().sum()
    }

    /// Check the conservation invariants of a finished run.
    ///
    /// # Errors
    /// Returns [`DistributionError::Invariant`] when units were lost or created,
    /// or when units remain unplaced although stores were available.
    pub fn verify(&self) -> Result<(), DistributionError> {
        let total = self.total_distributed();
        if total.checked_add(self.remaining) != Some(self.original_quantity) {
            return Err(DistributionError::Invariant(format!(
                "product {}: distributed {total} + remaining {} != original {}",
                self.product_id, self.remaining, self.original_quantity
            )));
        }

        if self.remaining != 0 && !self.distributed.is_empty() {
            return Err(DistributionError::Invariant(format!(
                "product {}: {} units left unplaced across {} stores",
                self.product_id,
                self.remaining,
                self.distributed.len()
            )));
        }

        Ok(())
    }
}

#[must_use]
pub fn default_tie_breakers() -> Vec<String> {
    vec![
        "hygiene: input order".to_string(),
        "deficit: input order".to_string(),
        "deficit: floor(need * remaining / total_need)".to_string(),
        "surplus: priority_rank asc".to_string(),
        "surplus: input order asc".to_string(),
    ]
}

/// Validate a produced quantity supplied as a float.
///
/// # Errors
/// Returns [`DistributionError::Validation`] for non-finite, negative,
/// fractional or out-of-range quantities.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn validate_produced_quantity(value: f64) -> Result<u64, DistributionError> {
    if !value.is_finite() {
        return Err(DistributionError::Validation(format!(
            "produced quantity MUST be a finite number, got {value}"
        )));
    }
    if value < 0.0 {
        return Err(DistributionError::Validation(format!(
            "produced quantity MUST be >= 0, got {value}"
        )));
    }
    if value.fract() != 0.0 {
        return Err(DistributionError::Validation(format!(
            "produced quantity MUST be a whole number of units, got {value}"
        )));
    }
    if value > MAX_PRODUCED_QUANTITY as f64 {
        return Err(DistributionError::Validation(format!(
            "produced quantity MUST be <= {MAX_PRODUCED_QUANTITY}, got {value}"
        )));
    }
    Ok(value as u64)
}

/// Validate a produced quantity taken straight from a JSON document.
///
/// # Errors
/// Returns [`DistributionError::Validation`] when the value is not a JSON number
/// or fails [`validate_produced_quantity`].
pub fn parse_produced_quantity(value: &Value) -> Result<u64, DistributionError> {
    let Value::Number(number) = value else {
        return Err(DistributionError::Validation(format!(
            "produced quantity MUST be a JSON number, got {value}"
        )));
    };

    if let Some(units) = number.as_u64() {
        if units > MAX_PRODUCED_QUANTITY {
            return Err(DistributionError::Validation(format!(
                "produced quantity MUST be <= {MAX_PRODUCED_QUANTITY}, got {units}"
            )));
        }
        return Ok(units);
    }

    match number.as_f64() {
        Some(float) => validate_produced_quantity(float),
        None => Err(DistributionError::Validation(format!(
            "produced quantity MUST be representable as a number, got {number}"
        ))),
    }
}

fn ensure_allocatable(
    product_id: &ProductId,
    produced: u64,
    stores: &[StoreRecord],
) -> Result<(), DistributionError> {
    if produced > MAX_PRODUCED_QUANTITY {
        return Err(DistributionError::Validation(format!(
            "produced quantity MUST be <= {MAX_PRODUCED_QUANTITY}, got {produced}"
        )));
    }

    if stores.is_empty() && produced > 0 {
        return Err(DistributionError::Validation(format!(
            "product {product_id}: {produced} units produced but no stores to distribute to"
        )));
    }

    let mut seen = BTreeSet::new();
    for store in stores {
        if store.store_id.0 == 0 {
            return Err(DistributionError::Validation(
                "store_id MUST be a positive integer".to_string(),
            ));
        }
        if !seen.insert(store.store_id) {
            return Err(DistributionError::Validation(format!(
                "store_id {} appears more than once",
                store.store_id
            )));
        }
    }

    Ok(())
}

/// Allocate `produced` units of one product across canonical store records.
///
/// Runs hygiene, deficit and surplus passes in order. Each pass consumes the
/// previous state and returns a new one.
///
/// # Errors
/// Returns [`DistributionError::Validation`] when there are units but no stores,
/// when store identifiers are zero or repeated, or when the quantity is out of range.
/// All checks happen before any allocation state exists.
pub fn allocate(
    product_id: &ProductId,
    produced: u64,
    stores: &[StoreRecord],
) -> Result<Distribution, DistributionError> {
    ensure_allocatable(product_id, produced, stores)?;

    let state = AllocationState::new(stores.len(), produced);
    let hygiene = hygiene_pass(stores, state);
    let (deficit, deficit_mode) = deficit_pass(stores, hygiene.state);
    let mut summaries = vec![hygiene.summary, deficit.summary];

    let state = if deficit.state.remaining > 0 {
        let surplus = surplus_pass(stores, deficit.state);
        summaries.push(surplus.summary);
        surplus.state
    } else {
        deficit.state
    };

    for summary in &summaries {
        tracing::debug!(
            product_id = %product_id,
            stage = summary.stage.as_str(),
            units = summary.units_allocated,
            remaining = summary.remaining_after,
            "allocation stage finished"
        );
    }

    let distributed = stores
        .iter()
        .zip(&state.allocated)
        .map(|(store, units)| (store.store_id, *units))
        .collect::<BTreeMap<_, _>>();

    Ok(Distribution {
        product_id: product_id.clone(),
        original_quantity: produced,
        distributed,
        remaining: state.remaining,
        trace: AllocationTrace {
            ruleset_version: RULESET_VERSION.to_string(),
            deficit_mode,
            stages: summaries,
            tie_breakers: default_tie_breakers(),
        },
        issues: Vec::new(),
    })
}

/// Normalize raw store statistics and allocate one product across them.
///
/// The quantity is validated before normalization; records without a usable
/// identifier are dropped and reported in [`Distribution::issues`].
///
/// # Errors
/// Returns [`DistributionError::Validation`] for an invalid quantity, or when no
/// store survives normalization while units are available.
pub fn distribute(
    product_id: &ProductId,
    produced_quantity: &Value,
    raw_stores: &[Value],
) -> Result<Distribution, DistributionError> {
    let produced = parse_produced_quantity(produced_quantity)?;
    distribute_normalized(product_id, produced, normalize_store_records(raw_stores))
}

/// Allocate across already-normalized stores and carry the normalizer's issues
/// into the result. Callers that need the canonical records (for example to
/// digest them) normalize first and finish here.
///
/// # Errors
/// Same as [`allocate`].
pub fn distribute_normalized(
    product_id: &ProductId,
    produced: u64,
    normalized: NormalizedStores,
) -> Result<Distribution, DistributionError> {
    let mut distribution = allocate(product_id, produced, &normalized.stores)?;
    distribution.issues = normalized.issues;
    Ok(distribution)
}
