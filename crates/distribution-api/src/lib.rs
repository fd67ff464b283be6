use std::sync::Arc;

use anyhow::{Context, Result};
use distribution_core::{
    distribute_normalized, normalize_store_records, parse_produced_quantity, Distribution,
    NormalizedStores, ProductId, StoreRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod source;

pub use source::{
    InMemorySource, NoStatsSource, ProductLocks, SnapshotFileSource, StatsSnapshot,
    StoreStatsSource, UnknownProduct,
};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistributeRequest {
    pub product_id: String,
    pub quantity: Value,
    #[serde(default)]
    pub stores: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub product_id: String,
    pub quantity: Value,
}

/// Produced quantities for several products, each distributed independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductionPlan {
    #[serde(default)]
    pub products: Vec<PlanItem>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub api_contract_version: String,
    pub run_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub input_digest: String,
    #[serde(flatten)]
    pub distribution: Distribution,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    pub api_contract_version: String,
    pub run_id: Ulid,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub reports: Vec<DistributionReport>,
}

#[derive(Debug, Clone, Default)]
pub struct DistributionApi {
    source: Option<Arc<dyn StoreStatsSource>>,
    locks: Arc<ProductLocks>,
}

impl DistributionApi {
    /// An API without a stats source; only inline-store requests are served.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_source(source: Arc<dyn StoreStatsSource>) -> Self {
        Self { source: Some(source), locks: Arc::new(ProductLocks::new()) }
    }

    #[must_use]
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Distribute one product across the stores supplied in the request.
    ///
    /// # Errors
    /// Returns a [`distribution_core::DistributionError`] for invalid input or a
    /// conservation failure.
    pub fn distribute(&self, request: &DistributeRequest) -> Result<DistributionReport> {
        let product_id = ProductId::parse(&request.product_id)?;
        let produced = parse_produced_quantity(&request.quantity)?;
        self.locks
            .run_exclusive(&product_id, || run_allocation(&product_id, produced, &request.stores))
    }

    /// Fetch the product's store statistics from the configured source and
    /// distribute `quantity` across them.
    ///
    /// The quantity is validated before the fetch. Fetch errors are returned as
    /// they came from the source and the allocator is not run.
    ///
    /// # Errors
    /// Returns an error when no source is configured, the quantity is invalid,
    /// the fetch fails, or allocation fails.
    pub fn distribute_product(
        &self,
        product_id: &str,
        quantity: &Value,
    ) -> Result<DistributionReport> {
        let source = self.source.as_ref().ok_or(NoStatsSource)?;
        let product_id = ProductId::parse(product_id)?;
        let produced = parse_produced_quantity(quantity)?;

        self.locks.run_exclusive(&product_id, || {
            let raw_stores = source.fetch_store_stats(&product_id)?;
            run_allocation(&product_id, produced, &raw_stores)
        })
    }

    /// Distribute every product of a plan, in plan order. The first failing
    /// product aborts the plan.
    ///
    /// # Errors
    /// Returns the first product's error, with the plan position as context.
    pub fn distribute_plan(&self, plan: &ProductionPlan) -> Result<PlanReport> {
        let mut reports = Vec::with_capacity(plan.products.len());
        for (index, item) in plan.products.iter().enumerate() {
            let report = self
                .distribute_product(&item.product_id, &item.quantity)
                .with_context(|| format!("plan item {} ({})", index + 1, item.product_id))?;
            reports.push(report);
        }

        Ok(PlanReport {
            api_contract_version: API_CONTRACT_VERSION.to_string(),
            run_id: Ulid::new(),
            generated_at: OffsetDateTime::now_utc(),
            reports,
        })
    }

    /// Show how raw store statistics map onto canonical records.
    #[must_use]
    pub fn normalize_preview(&self, stores: &[Value]) -> NormalizedStores {
        normalize_store_records(stores)
    }
}

fn run_allocation(
    product_id: &ProductId,
    produced: u64,
    raw_stores: &[Value],
) -> Result<DistributionReport> {
    let normalized = normalize_store_records(raw_stores);
    let input_digest = compute_input_digest(product_id, produced, &normalized.stores);
    let distribution = distribute_normalized(product_id, produced, normalized)?;

    if let Err(err) = distribution.verify() {
        tracing::error!(product_id = %product_id, digest = %input_digest, "{err}");
        return Err(err.into());
    }

    tracing::info!(
        product_id = %product_id,
        produced,
        stores = distribution.distributed.len(),
        dropped = distribution.issues.iter().filter(|issue| issue.drops_record()).count(),
        "distribution computed"
    );

    Ok(DistributionReport {
        api_contract_version: API_CONTRACT_VERSION.to_string(),
        run_id: Ulid::new(),
        generated_at: OffsetDateTime::now_utc(),
        input_digest,
        distribution,
    })
}

/// Digest of everything the allocation depends on: product, quantity and the
/// canonical store tuples in input order.
#[must_use]
pub fn compute_input_digest(
    product_id: &ProductId,
    produced: u64,
    stores: &[StoreRecord],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(product_id.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(produced.to_string().as_bytes());
    hasher.update(b"\n");
    for store in stores {
        hasher.update(
            format!(
                "{}:{}:{}:{}\n",
                store.store_id, store.stock_now, store.norm_target, store.priority_rank
            )
            .as_bytes(),
        );
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
