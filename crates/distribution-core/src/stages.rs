//! The three allocation passes. Each takes ownership of the previous
//! [`AllocationState`] and hands back a new one, so passes compose and can be
//! exercised on their own.

use serde::{Deserialize, Serialize};

use crate::{AllocationState, Stage, StageSummary, StoreRecord};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeficitMode {
    /// Nothing left to place, or every store already at or above its norm.
    Skipped,
    /// Supply below total need: floored proportional shares.
    Proportional,
    /// Supply covers total need: every needy store is topped up to its norm.
    Full,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StageResult {
    pub state: AllocationState,
    pub summary: StageSummary,
}

fn finish(
    stage: Stage,
    before: u64,
    state: AllocationState,
    stores_touched: usize,
    note: String,
) -> StageResult {
    let summary = StageSummary {
        stage,
        units_allocated: before - state.remaining,
        remaining_after: state.remaining,
        stores_touched,
        note,
    };
    StageResult { state, summary }
}

/// Give one unit to every store sitting at zero stock, in input order, while
/// units remain.
#[must_use]
pub fn hygiene_pass(stores: &[StoreRecord], state: AllocationState) -> StageResult {
    let before = state.remaining;
    let AllocationState { mut allocated, mut remaining } = state;
    let mut touched = 0_usize;
    let mut starved = 0_usize;

    for (store, units) in stores.iter().zip(allocated.iter_mut()) {
        if store.stock_now != 0 {
            continue;
        }
        if remaining == 0 {
            starved += 1;
            continue;
        }
        *units += 1;
        remaining -= 1;
        touched += 1;
    }

    let note = if starved == 0 {
        format!("{touched} zero-stock stores received 1 unit")
    } else {
        format!("{touched} zero-stock stores received 1 unit; {starved} left without supply")
    };
    finish(Stage::Hygiene, before, AllocationState { allocated, remaining }, touched, note)
}

fn dynamic_needs(stores: &[StoreRecord], allocated: &[u64]) -> Vec<u64> {
    stores
        .iter()
        .zip(allocated)
        .map(|(store, units)| {
            store.norm_target.saturating_sub(store.stock_now.saturating_add(*units))
        })
        .collect()
}

fn proportional_share(need: u64, remaining: u64, total_need: u128) -> u64 {
    let share = u128::from(need) * u128::from(remaining) / total_need;
    // share <= need because remaining < total_need.
    u64::try_from(share).unwrap_or(need)
}

/// Close the gap between effective stock and norm.
///
/// Need is recomputed from stock plus what earlier passes already allocated.
/// When supply is short each needy store gets `floor(need * remaining / total_need)`
/// and the rounding shortfall stays in `remaining`.
#[must_use]
pub fn deficit_pass(stores: &[StoreRecord], state: AllocationState) -> (StageResult, DeficitMode) {
    let before = state.remaining;
    let needs = dynamic_needs(stores, &state.allocated);
    // Summed in u128: a few near-u64::MAX norms must not saturate the ratio.
    let total_need = needs.iter().map(|need| u128::from(*need)).sum::<u128>();

    if total_need == 0 || state.remaining == 0 {
        let note = if total_need == 0 {
            "every store at or above norm".to_string()
        } else {
            format!("no units left for total need {total_need}")
        };
        return (finish(Stage::Deficit, before, state, 0, note), DeficitMode::Skipped);
    }

    let AllocationState { mut allocated, mut remaining } = state;
    let mode = if u128::from(remaining) < total_need {
        DeficitMode::Proportional
    } else {
        DeficitMode::Full
    };
    let mut touched = 0_usize;

    for (need, units) in needs.iter().zip(allocated.iter_mut()) {
        if *need == 0 {
            continue;
        }
        let proposed = match mode {
            DeficitMode::Proportional => proportional_share(*need, before, total_need),
            DeficitMode::Full | DeficitMode::Skipped => *need,
        };
        // Floored shares sum to at most `before` and full needs to at most
        // `remaining`, so a proposal never exceeds what is left.
        debug_assert!(proposed <= remaining, "deficit proposal {proposed} > {remaining}");
        let grant = proposed.min(remaining);
        if grant == 0 {
            continue;
        }
        *units += grant;
        remaining -= grant;
        touched += 1;
    }

    let note = match mode {
        DeficitMode::Proportional => format!(
            "proportional: {before} units against total need {total_need}, \
             {remaining} carried to surplus"
        ),
        DeficitMode::Full | DeficitMode::Skipped => {
            format!("full: total need {total_need} covered by {before} units")
        }
    };
    (finish(Stage::Deficit, before, AllocationState { allocated, remaining }, touched, note), mode)
}

/// Stable order in which the surplus pass serves stores: ascending priority
/// rank, ties kept in input order.
#[must_use]
pub fn surplus_order(stores: &[StoreRecord]) -> Vec<usize> {
    let mut order = (0..stores.len()).collect::<Vec<_>>();
    order.sort_by_key(|index| stores[*index].priority_rank);
    order
}

/// Spread whatever is left one unit per store per sweep in priority order.
///
/// Computed in closed form: `remaining / n` full sweeps for every store, then
/// one more unit for the first `remaining % n` stores of the sweep order.
#[must_use]
pub fn surplus_pass(stores: &[StoreRecord], state: AllocationState) -> StageResult {
    let before = state.remaining;
    if stores.is_empty() || before == 0 {
        let note = "nothing to sweep".to_string();
        return finish(Stage::Surplus, before, state, 0, note);
    }

    let AllocationState { mut allocated, remaining } = state;
    let store_count = u64::try_from(stores.len()).unwrap_or(u64::MAX);
    let full_sweeps = remaining / store_count;
    let partial = usize::try_from(remaining % store_count).unwrap_or(stores.len());

    let mut touched = 0_usize;
    for (position, index) in surplus_order(stores).into_iter().enumerate() {
        let grant = full_sweeps + u64::from(position < partial);
        if grant > 0 {
            allocated[index] += grant;
            touched += 1;
        }
    }

    let note = format!("{full_sweeps} full sweeps plus {partial} stores in priority order");
    finish(Stage::Surplus, before, AllocationState { allocated, remaining: 0 }, touched, note)
}
