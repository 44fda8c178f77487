//! Folds today's transactions into the ranked leaderboard.
//!
//! The fold is deterministic: identical store contents and an identical
//! active set produce an identical [`Snapshot`] (the published version
//! number is assigned later, by the scheduler). Counts use exact integer
//! arithmetic throughout.

use indexmap::IndexMap;

use crate::error::{Anomaly, RecomputeError};
use crate::model::{EmployeeId, ItemId, LocationId, Window};
use crate::snapshot::{DayStats, LeaderboardRow, Snapshot};
use crate::store::EntityStore;
use crate::tracker::ActiveStaff;

/// Compute the leaderboard for one location over `window`.
///
/// Every employee in `active` gets a row, in active-set order, even with
/// zero transactions. Transactions from employees outside `active` are
/// excluded entirely. Rows are sorted descending by total with a stable
/// sort, so equal totals keep the order the fold produced.
///
/// A line entry whose item does not resolve is dropped from all totals
/// and reported as [`Anomaly::DanglingItem`]; the rest of the aggregation
/// continues, so one bad row never blanks the board.
///
/// # Errors
///
/// Returns [`RecomputeError::Store`] if a backing query fails. The caller
/// is expected to keep serving its last successful snapshot.
pub async fn aggregate<S: EntityStore>(
    store: &S,
    location_id: LocationId,
    active: &[ActiveStaff],
    window: Window,
) -> Result<Snapshot, RecomputeError> {
    let item_names = item_name_index(store, location_id).await?;
    let transactions = store.transactions_in(location_id, window).await?;

    // Seed a zero row per active employee before folding, so employees
    // without transactions are present rather than omitted.
    let mut rows: IndexMap<EmployeeId, LeaderboardRow> = active
        .iter()
        .map(|staff| {
            (
                staff.employee_id,
                LeaderboardRow::zero(staff.employee_id, staff.name.clone()),
            )
        })
        .collect();

    let mut anomalies = Vec::new();
    for transaction in &transactions {
        // No open session for this employee right now: the transaction
        // does not count, per the active-set invariant.
        let Some(row) = rows.get_mut(&transaction.employee_id) else {
            continue;
        };
        for line in &transaction.lines {
            let Some(name) = item_names.get(&line.item_id) else {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    item_id = %line.item_id,
                    "line entry references unknown menu item; dropping it"
                );
                anomalies.push(Anomaly::DanglingItem {
                    transaction_id: transaction.id,
                    item_id: line.item_id,
                });
                continue;
            };
            let quantity = u64::from(line.quantity);
            row.total += quantity;
            *row.items.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    let mut rows: Vec<LeaderboardRow> = rows.into_values().collect();
    // `sort_by` is stable: equal totals keep fold order.
    rows.sort_by(|a, b| b.total.cmp(&a.total));

    Ok(Snapshot {
        location_id,
        rows,
        active: active.iter().map(|s| s.employee_id).collect(),
        window,
        version: 0,
        anomalies,
    })
}

/// Location-wide totals for `window`, regardless of who is still clocked
/// in. Backs the manager dashboard's "today" counters.
///
/// Unresolvable line entries are dropped with a warning, as in
/// [`aggregate`].
pub async fn day_stats<S: EntityStore>(
    store: &S,
    location_id: LocationId,
    window: Window,
) -> Result<DayStats, RecomputeError> {
    let item_names = item_name_index(store, location_id).await?;
    let transactions = store.transactions_in(location_id, window).await?;

    let mut stats = DayStats::default();
    for transaction in &transactions {
        for line in &transaction.lines {
            let Some(name) = item_names.get(&line.item_id) else {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    item_id = %line.item_id,
                    "line entry references unknown menu item; dropping it"
                );
                continue;
            };
            let quantity = u64::from(line.quantity);
            stats.total += quantity;
            *stats.by_item.entry(name.clone()).or_insert(0) += quantity;
        }
    }
    Ok(stats)
}

/// Item display names in menu order. Inactive items are included so
/// historical transactions still resolve.
async fn item_name_index<S: EntityStore>(
    store: &S,
    location_id: LocationId,
) -> Result<IndexMap<ItemId, String>, RecomputeError> {
    let items = store.menu_items(location_id).await?;
    Ok(items.into_iter().map(|i| (i.id, i.name)).collect())
}
