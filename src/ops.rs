//! The write flows that generate the change events the engine consumes.
//!
//! These validate and write through the [`EntityStore`] surface only;
//! everything downstream (tracker, aggregator, scheduler) reacts to the
//! resulting change events. Kept apart from the read side so the
//! aggregation core stays a pure consumer of the store.

use chrono::Utc;
use uuid::Uuid;

use crate::error::OpsError;
use crate::model::{Employee, LineEntry, Session, SessionId, Transaction};
use crate::store::EntityStore;

/// Clock an employee in, returning the new open session.
///
/// Any session the employee still has open (left behind by a crashed
/// device or a missed clock-out) is closed first, so this flow converges
/// toward the one-open-session-per-employee invariant. The engine stays
/// correct even when another writer does not do this.
pub async fn clock_in<S: EntityStore>(
    store: &S,
    employee: &Employee,
) -> Result<Session, OpsError> {
    let now = Utc::now();
    let open = store.open_sessions(employee.location_id).await?;
    for stale in open.iter().filter(|s| s.employee_id == employee.id) {
        tracing::info!(
            session_id = %stale.id,
            employee_id = %employee.id,
            "closing stale open session before clock-in"
        );
        store.close_session(stale.id, now).await?;
    }

    let session = Session {
        id: Uuid::new_v4(),
        employee_id: employee.id,
        location_id: employee.location_id,
        started_at: now,
        ended_at: None,
    };
    store.open_session(session.clone()).await?;
    Ok(session)
}

/// Clock out by setting the session's end timestamp.
pub async fn clock_out<S: EntityStore>(store: &S, session_id: SessionId) -> Result<(), OpsError> {
    store.close_session(session_id, Utc::now()).await?;
    Ok(())
}

/// Record an upsell: one transaction with the given line entries.
///
/// Rejects empty submissions and zero quantities before anything is
/// written. The order tag is display-only and may be empty.
pub async fn record_upsells<S: EntityStore>(
    store: &S,
    employee: &Employee,
    session_id: Option<SessionId>,
    lines: Vec<LineEntry>,
    order_tag: impl Into<String>,
) -> Result<Transaction, OpsError> {
    if lines.is_empty() {
        return Err(OpsError::EmptyOrder);
    }
    if let Some(line) = lines.iter().find(|l| l.quantity == 0) {
        return Err(OpsError::ZeroQuantity {
            item_id: line.item_id,
        });
    }

    let transaction = Transaction {
        id: Uuid::new_v4(),
        employee_id: employee.id,
        location_id: employee.location_id,
        session_id,
        lines,
        order_tag: order_tag.into(),
        created_at: Utc::now(),
    };
    store.insert_transaction(transaction.clone()).await?;
    Ok(transaction)
}
