use criterion::{criterion_group, criterion_main, Criterion};
use distribution_core::{allocate, distribute, ProductId, StoreRecord};
use serde_json::{json, Value};

fn product() -> ProductId {
    match ProductId::parse("bench-loaf") {
        Ok(id) => id,
        Err(err) => panic!("benchmark product id failed: {err}"),
    }
}

fn mk_store(index: u64) -> StoreRecord {
    let stock = if index % 5 == 0 { 0 } else { index % 17 };
    let store = StoreRecord::new(index + 1, stock, 20 + index % 11);
    match index % 3 {
        0 => store.with_priority(i64::try_from(index % 7).unwrap_or(0)),
        _ => store,
    }
}

fn mk_raw(index: u64) -> Value {
    if index % 2 == 0 {
        json!({
            "storeId": index + 1,
            "stockNow": index % 13,
            "normTarget": 25,
            "priorityRank": index % 4
        })
    } else {
        json!({
            "store_id": index + 1,
            "current_stock": index % 9,
            "stock_norm": 18,
            "priority": index % 6
        })
    }
}

fn bench_scarce(c: &mut Criterion) {
    let stores = (0..1_000).map(mk_store).collect::<Vec<_>>();
    let product = product();

    c.bench_function("allocate_1000_stores_scarce_supply", |b| {
        b.iter(|| {
            if let Err(err) = allocate(&product, 4_000, &stores) {
                panic!("scarce benchmark allocation failed: {err}");
            }
        });
    });
}

fn bench_surplus(c: &mut Criterion) {
    let stores = (0..1_000).map(mk_store).collect::<Vec<_>>();
    let product = product();

    c.bench_function("allocate_1000_stores_large_surplus", |b| {
        b.iter(|| {
            if let Err(err) = allocate(&product, 5_000_000, &stores) {
                panic!("surplus benchmark allocation failed: {err}");
            }
        });
    });
}

fn bench_distribute_raw(c: &mut Criterion) {
    let raw = (0..1_000).map(mk_raw).collect::<Vec<_>>();
    let product = product();
    let quantity = json!(12_000);

    c.bench_function("distribute_1000_raw_records", |b| {
        b.iter(|| {
            if let Err(err) = distribute(&product, &quantity, &raw) {
                panic!("raw distribution benchmark failed: {err}");
            }
        });
    });
}

criterion_group!(allocator_benches, bench_scarce, bench_surplus, bench_distribute_raw);
criterion_main!(allocator_benches);
