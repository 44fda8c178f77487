//! Tracks which employees are currently clocked in at a location.
//!
//! The tracker derives the active set from open sessions in the store and
//! caches the last successful result. A failed refresh keeps serving the
//! cached set -- clearing it would erroneously hide real staff from a live
//! leaderboard -- and surfaces the error to the caller for reporting.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Anomaly, TrackerError};
use crate::model::{EmployeeId, LocationId, Session, SessionId};
use crate::store::{ChangeEvent, EntityStore, Operation, RowData};

/// One currently clocked-in employee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStaff {
    /// The employee's identifier.
    pub employee_id: EmployeeId,
    /// Display name shown on the leaderboard.
    pub name: String,
}

/// What a session-table change means for the consuming UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// The viewer's own session had its end timestamp set remotely. The
    /// consuming UI must terminate the local session immediately.
    ForcedSignOut {
        /// The session that was closed.
        session_id: SessionId,
    },
    /// Any other session change. The active set is stale and a recompute
    /// is due.
    Stale,
}

/// Classify a session-table change event from the viewer's perspective.
///
/// A change counts as a forced sign-out only when it sets an end timestamp
/// on a session belonging to `viewer`. With no before image the change is
/// still treated as a close when the after image carries an end timestamp;
/// the feed is at-least-once, so a repeated close simply re-signals an
/// already-terminated session.
pub fn classify_session_change(
    event: &ChangeEvent,
    viewer: Option<EmployeeId>,
) -> SessionChange {
    let Some(viewer) = viewer else {
        return SessionChange::Stale;
    };
    if event.op != Operation::Update {
        return SessionChange::Stale;
    }
    let Some(RowData::Session(after)) = &event.after else {
        return SessionChange::Stale;
    };
    let was_open = match &event.before {
        Some(RowData::Session(before)) => before.is_open(),
        _ => true,
    };
    if was_open && after.ended_at.is_some() && after.employee_id == viewer {
        SessionChange::ForcedSignOut {
            session_id: after.id,
        }
    } else {
        SessionChange::Stale
    }
}

/// Maintains the current set of active staff for one location.
pub struct ActiveSessionTracker<S> {
    store: Arc<S>,
    location_id: LocationId,
    cached: Mutex<Vec<ActiveStaff>>,
}

impl<S: EntityStore> ActiveSessionTracker<S> {
    /// Create a tracker for `location_id` with an empty cached set.
    pub fn new(store: Arc<S>, location_id: LocationId) -> Self {
        Self {
            store,
            location_id,
            cached: Mutex::new(Vec::new()),
        }
    }

    /// Re-derive the active set from the store.
    ///
    /// One entry per employee with an open session, ordered by earliest
    /// clock-in. An employee with several open sessions appears once
    /// (the session with the most recent start time is taken as current)
    /// and is reported as [`Anomaly::DuplicateOpenSession`]; a session
    /// whose employee does not resolve is skipped and reported as
    /// [`Anomaly::DanglingEmployee`].
    ///
    /// On success the cached set is replaced. On failure the cache is left
    /// untouched and the error is returned; callers keep serving
    /// [`last_known`](Self::last_known).
    pub async fn refresh(&self) -> Result<(Vec<ActiveStaff>, Vec<Anomaly>), TrackerError> {
        let sessions = self.store.open_sessions(self.location_id).await?;
        let mut anomalies = Vec::new();

        // Sessions arrive ordered by start time, so first insertion fixes
        // each employee's position at their earliest clock-in.
        let mut current: IndexMap<EmployeeId, Session> = IndexMap::new();
        let mut open_counts: IndexMap<EmployeeId, usize> = IndexMap::new();
        for session in sessions {
            *open_counts.entry(session.employee_id).or_insert(0) += 1;
            let slot = current.entry(session.employee_id).or_insert(session.clone());
            if session.started_at > slot.started_at {
                *slot = session;
            }
        }
        for (employee_id, count) in open_counts {
            if count > 1 {
                tracing::warn!(
                    employee_id = %employee_id,
                    count,
                    "employee has multiple open sessions; using the most recent"
                );
                anomalies.push(Anomaly::DuplicateOpenSession { employee_id, count });
            }
        }

        let mut active = Vec::with_capacity(current.len());
        for (employee_id, session) in current {
            match self.store.employee(employee_id).await? {
                Some(employee) => active.push(ActiveStaff {
                    employee_id,
                    name: employee.name,
                }),
                None => {
                    tracing::warn!(
                        session_id = %session.id,
                        employee_id = %employee_id,
                        "open session references unknown employee; skipping"
                    );
                    anomalies.push(Anomaly::DanglingEmployee {
                        session_id: session.id,
                        employee_id,
                    });
                }
            }
        }

        *self.cached.lock().await = active.clone();
        Ok((active, anomalies))
    }

    /// Like [`refresh`](Self::refresh) but bounded by `timeout`, so a
    /// store that never answers cannot wedge the caller.
    pub async fn refresh_bounded(
        &self,
        timeout: Duration,
    ) -> Result<(Vec<ActiveStaff>, Vec<Anomaly>), TrackerError> {
        match tokio::time::timeout(timeout, self.refresh()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(TrackerError::Timeout(timeout)),
        }
    }

    /// The last successfully derived active set.
    pub async fn last_known(&self) -> Vec<ActiveStaff> {
        self.cached.lock().await.clone()
    }
}
