//! Crate-level error types and non-fatal anomaly reports.
//!
//! No error in this crate is fatal to the process: store failures degrade
//! to serving the last-known-good state, and data anomalies are dropped
//! from the aggregate and reported alongside it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{EmployeeId, ItemId, SessionId, TransactionId};

/// Error returned when a call into the entity store fails.
///
/// These are transient by design: the caller keeps whatever state it last
/// derived and retries on the next change notification or manual refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A read query failed (backend unavailable, malformed response, ...).
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A write was rejected by the store.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

/// Error returned when refreshing the active session set fails.
///
/// The tracker keeps serving its last-known set when this is returned;
/// the set is never cleared on failure.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The backing open-sessions query failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The backing query did not return within the configured bound.
    #[error("active session query timed out after {0:?}")]
    Timeout(Duration),
}

/// Error returned when a full leaderboard recompute fails.
///
/// The scheduler keeps publishing the last successful snapshot when this
/// is returned and retries on the next notification.
#[derive(Debug, thiserror::Error)]
pub enum RecomputeError {
    /// A store query inside the aggregation pass failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The aggregation pass did not complete within the configured bound.
    #[error("recompute timed out after {0:?}")]
    Timeout(Duration),
}

/// Error returned by the write flows (clock-in, clock-out, upsell
/// submission).
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    /// An upsell submission carried no line entries.
    #[error("an upsell submission needs at least one line entry")]
    EmptyOrder,

    /// A line entry carried a zero quantity.
    #[error("line entry for item {item_id} has zero quantity")]
    ZeroQuantity {
        /// The item whose line entry was invalid.
        item_id: ItemId,
    },

    /// The underlying store write failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A non-fatal data anomaly observed while deriving the leaderboard.
///
/// Anomalies never abort a refresh or recompute. The offending entry is
/// dropped (or a deterministic tie-break applied) and the anomaly is
/// reported on the resulting [`Snapshot`](crate::Snapshot) so operators
/// can see that the data needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Anomaly {
    /// A transaction line entry references a menu item that no longer
    /// resolves. The line entry is excluded from all totals.
    #[error("transaction {transaction_id} references unknown menu item {item_id}")]
    DanglingItem {
        /// The transaction carrying the bad line entry.
        transaction_id: TransactionId,
        /// The unresolvable item reference.
        item_id: ItemId,
    },

    /// A session references an employee that no longer resolves. The
    /// session is excluded from the active set.
    #[error("session {session_id} references unknown employee {employee_id}")]
    DanglingEmployee {
        /// The session carrying the bad reference.
        session_id: SessionId,
        /// The unresolvable employee reference.
        employee_id: EmployeeId,
    },

    /// An employee has more than one open session. The session with the
    /// most recent start time wins; the others are ignored.
    #[error("employee {employee_id} has {count} open sessions")]
    DuplicateOpenSession {
        /// The employee with overlapping open sessions.
        employee_id: EmployeeId,
        /// How many open sessions were found.
        count: usize,
    },
}
