//! The materialized leaderboard state and related derived types.
//!
//! Everything in this module is a pure projection of session and
//! transaction state. None of it is ever persisted or treated as a source
//! of truth: a fresh recompute can always rebuild an identical value from
//! the store.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Anomaly;
use crate::model::{EmployeeId, LocationId, Window};

/// One employee's standing on the leaderboard.
///
/// Present for every currently-active employee, even with zero upsells
/// (a zero row is shown, never omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    /// The employee this row belongs to.
    pub employee_id: EmployeeId,
    /// Display name shown on the board.
    pub name: String,
    /// Total units upsold inside the snapshot window.
    pub total: u64,
    /// Units per item display name, in first-seen order.
    pub items: IndexMap<String, u64>,
}

impl LeaderboardRow {
    /// A fresh zero row for an active employee.
    pub fn zero(employee_id: EmployeeId, name: impl Into<String>) -> Self {
        Self {
            employee_id,
            name: name.into(),
            total: 0,
            items: IndexMap::new(),
        }
    }
}

/// The ranked leaderboard at a point in time.
///
/// Rows are ordered descending by total; equal totals keep the order the
/// aggregation fold produced them in. The active set the snapshot was
/// computed against is carried alongside so consumers can tell who was
/// clocked in, and `version` increases monotonically per location so
/// consumers can detect staleness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The location this snapshot was computed for.
    pub location_id: LocationId,
    /// Ranked rows, one per active employee.
    pub rows: Vec<LeaderboardRow>,
    /// The employees that were active when the snapshot was computed, in
    /// active-set order.
    pub active: Vec<EmployeeId>,
    /// The time window the totals cover.
    pub window: Window,
    /// Monotonic sequence number, assigned at publication.
    pub version: u64,
    /// Non-fatal data anomalies observed during the recompute.
    pub anomalies: Vec<Anomaly>,
}

impl Snapshot {
    /// Look up a row by employee.
    pub fn row(&self, employee_id: EmployeeId) -> Option<&LeaderboardRow> {
        self.rows.iter().find(|r| r.employee_id == employee_id)
    }
}

/// Location-wide counters for the day, active or not.
///
/// Unlike [`Snapshot`] rows, these include transactions from employees who
/// have since clocked out; they answer "how did the store do today" rather
/// than "who is winning right now".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DayStats {
    /// Total units upsold across the whole location.
    pub total: u64,
    /// Units per item display name, in menu order.
    pub by_item: IndexMap<String, u64>,
}
