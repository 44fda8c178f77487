//! Domain entities shared by the store, tracker, and aggregator.
//!
//! This is the single typed model for the system. Historical deployments
//! carried several structurally different row shapes for the same feature
//! (name-keyed vs. id-keyed rows, one row per unit vs. a quantity field);
//! those variants converge here, behind the [`EntityStore`](crate::EntityStore)
//! boundary, so the aggregation core never special-cases a schema.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a retail location.
pub type LocationId = Uuid;
/// Identifier of an employee.
pub type EmployeeId = Uuid;
/// Identifier of a session (shift).
pub type SessionId = Uuid;
/// Identifier of a menu item.
pub type ItemId = Uuid;
/// Identifier of a transaction.
pub type TransactionId = Uuid;

/// A retail location. Immutable for this core; owned by the entity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Unique location identifier.
    pub id: LocationId,
    /// Display name (e.g. a street address or store number).
    pub name: String,
}

/// A front-line staff member belonging to one location.
///
/// Names are display-only and are not required to be unique across
/// locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    /// Unique employee identifier.
    pub id: EmployeeId,
    /// Display name shown on the leaderboard.
    pub name: String,
    /// Owning location.
    pub location_id: LocationId,
}

/// A shift record: created at clock-in, closed once at clock-out, never
/// deleted in normal operation.
///
/// `ended_at == None` means the session is currently active. The intended
/// invariant is at most one open session per employee, but the engine
/// tolerates violations (see [`Anomaly`](crate::Anomaly)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// The employee who clocked in.
    pub employee_id: EmployeeId,
    /// Owning location.
    pub location_id: LocationId,
    /// Clock-in time.
    pub started_at: DateTime<Utc>,
    /// Clock-out time; `None` while the shift is open.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Returns `true` while the shift has no recorded end time.
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// An upsellable item in a location's menu.
///
/// Only active items are offered going forward, but historical transactions
/// referencing now-inactive items must still resolve for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    /// Unique item identifier.
    pub id: ItemId,
    /// Display name (e.g. "Kaffe").
    pub name: String,
    /// Owning location.
    pub location_id: LocationId,
    /// Whether the item is currently offered.
    pub active: bool,
}

/// One (item, quantity) pair within a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// The upsold item.
    pub item_id: ItemId,
    /// Units sold; minimum 1, commonly 1.
    pub quantity: u32,
}

/// A recorded upsell: one or more line entries tied to an employee at a
/// point in time. Created only by the submission flow; never mutated or
/// deleted in normal operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier.
    pub id: TransactionId,
    /// The employee credited with the upsell.
    pub employee_id: EmployeeId,
    /// Owning location.
    pub location_id: LocationId,
    /// The shift the upsell was recorded under, when known. Earlier schema
    /// variants did not record it.
    pub session_id: Option<SessionId>,
    /// The upsold items.
    pub lines: Vec<LineEntry>,
    /// Free-text order-number tag. Display-only; never aggregated.
    pub order_tag: String,
    /// Server-assigned creation time. Immutable.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Total units across all line entries.
    pub fn units(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.quantity)).sum()
    }
}

/// A half-open time range `[start, end)` used to scope aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
}

impl Window {
    /// The window from the start of the current calendar day (viewer-local
    /// wall clock) up to now.
    ///
    /// Computed fresh on every call; callers must not cache the result
    /// across midnight.
    pub fn today_local() -> Self {
        let now = Local::now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid wall-clock time");
        // Zones where local midnight falls inside a DST gap fall back to
        // the UTC day boundary.
        let start = midnight
            .and_local_timezone(Local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| midnight.and_utc());
        Self {
            start,
            end: now.with_timezone(&Utc),
        }
    }

    /// Returns `true` if `at` falls inside `[start, end)`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}
