use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use distribution_core::ProductId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raised by a stats source that has no figures for the requested product.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("no store statistics for product {0}")]
pub struct UnknownProduct(pub ProductId);

/// Raised when a product-keyed run is requested from an API built without a
/// stats source.
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
#[error("no store statistics source configured")]
pub struct NoStatsSource;

/// External collaborator that supplies per-store statistics for one product.
///
/// Implementations return raw records in whatever field-naming scheme the
/// backing data uses; normalization happens downstream.
pub trait StoreStatsSource: Debug + Send + Sync {
    /// Fetch the current per-store statistics for `product_id`.
    ///
    /// # Errors
    /// Returns [`UnknownProduct`] when the product has no figures, or any
    /// source-specific error when the data cannot be read.
    fn fetch_store_stats(&self, product_id: &ProductId) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    #[serde(default)]
    pub products: BTreeMap<String, Vec<Value>>,
}

impl StatsSnapshot {
    /// Load a snapshot file. `.yaml`/`.yml` files are read as YAML, anything
    /// else as JSON.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read stats snapshot {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            serde_yaml::from_str(&body)
                .with_context(|| format!("failed to parse YAML stats snapshot {}", path.display()))
        } else {
            serde_json::from_str(&body)
                .with_context(|| format!("failed to parse JSON stats snapshot {}", path.display()))
        }
    }

    fn records_for(&self, product_id: &ProductId) -> Result<Vec<Value>> {
        self.products
            .get(product_id.as_str())
            .cloned()
            .ok_or_else(|| UnknownProduct(product_id.clone()).into())
    }
}

/// Reads a snapshot file on every fetch, so edits between runs are picked up.
#[derive(Debug, Clone)]
pub struct SnapshotFileSource {
    path: PathBuf,
}

impl SnapshotFileSource {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StoreStatsSource for SnapshotFileSource {
    fn fetch_store_stats(&self, product_id: &ProductId) -> Result<Vec<Value>> {
        StatsSnapshot::load(&self.path)?.records_for(product_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    snapshot: StatsSnapshot,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_product(mut self, product_id: &str, records: Vec<Value>) -> Self {
        self.snapshot.products.insert(product_id.trim().to_string(), records);
        self
    }
}

impl StoreStatsSource for InMemorySource {
    fn fetch_store_stats(&self, product_id: &ProductId) -> Result<Vec<Value>> {
        self.snapshot.records_for(product_id)
    }
}

/// One mutex per product. Runs for the same product are serialized; runs for
/// different products never contend. Entries exist only while a run holds or
/// waits for them.
#[derive(Debug, Default)]
pub struct ProductLocks {
    locks: Mutex<BTreeMap<ProductId, Arc<Mutex<()>>>>,
}

impl ProductLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` while holding the lock for `product_id`.
    pub fn run_exclusive<T>(&self, product_id: &ProductId, job: impl FnOnce() -> T) -> T {
        let lease = self.lease(product_id);
        let _guard = lease.lock.lock().unwrap_or_else(PoisonError::into_inner);
        job()
    }

    fn lease<'a>(&'a self, product_id: &'a ProductId) -> Lease<'a> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(product_id.clone()).or_default());
        Lease { locks: self, product_id, lock }
    }

    /// Number of products with a run in progress or waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle on one product's mutex. The last lease to go drops the map
/// entry, so ids seen once do not accumulate.
struct Lease<'a> {
    locks: &'a ProductLocks,
    product_id: &'a ProductId,
    lock: Arc<Mutex<()>>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only handed out under the map lock: the entry plus this
        // lease means nobody else holds or waits on it.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(self.product_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    fn product(id: &str) -> ProductId {
        match ProductId::parse(id) {
            Ok(product_id) => product_id,
            Err(err) => panic!("fixture product id should parse: {err}"),
        }
    }

    #[test]
    fn entries_are_released_after_each_run() {
        let locks = ProductLocks::new();
        for index in 0..50 {
            let observed = locks.run_exclusive(&product(&format!("sku-{index}")), || locks.len());
            assert_eq!(observed, 1);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn concurrent_runs_share_and_then_release_the_entry() {
        let locks = Arc::new(ProductLocks::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.run_exclusive(&product("rye-loaf"), || {
                    let _ = entered_tx.send(());
                    let _ = release_rx.recv();
                });
            })
        };
        if entered_rx.recv().is_err() {
            panic!("holder thread never entered the lock");
        }

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.run_exclusive(&product("rye-loaf"), || locks.len()))
        };
        assert_eq!(locks.len(), 1);
        let _ = release_tx.send(());

        if holder.join().is_err() {
            panic!("holder thread panicked");
        }
        match waiter.join() {
            Ok(observed) => assert_eq!(observed, 1),
            Err(_) => panic!("waiter thread panicked"),
        }
        assert!(locks.is_empty());
    }
}
