//! The background loop that connects store change feeds to the scheduler.
//!
//! One loop per location holds the session and transaction subscriptions
//! open, forwards every relevant change to the [`SchedulerHandle`] as a
//! notification, and watches for the one change that must bypass the
//! leaderboard entirely: the current viewer's own session being closed
//! remotely, which the consuming UI has to treat as an immediate sign-out.
//!
//! Earlier deployments had every UI component hold its own subscriptions
//! and trigger its own reloads; this loop is the single replacement for
//! that, with consumers attached read-only to the scheduler's output.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::model::{LocationId, SessionId};
use crate::scheduler::SchedulerHandle;
use crate::store::{ChangeEvent, EntityStore, FeedMessage, RowData, Table, ViewerIdentity};
use crate::tracker::{SessionChange, classify_session_change};

/// An out-of-band condition the consuming UI must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerSignal {
    /// The viewer's session was closed remotely. Local credentials must
    /// be invalidated and the viewer sent back through authentication.
    ForcedSignOut {
        /// The session that was closed.
        session_id: SessionId,
    },
}

/// Handle to a running change feed loop.
///
/// `Clone` is cheap -- all fields are channel endpoints or `Arc`-wrapped.
#[derive(Clone)]
pub struct FeedHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FeedHandle {
    /// Signal the loop to stop and wait for it to finish.
    ///
    /// The store subscriptions are released when the loop exits. Calling
    /// `shutdown` more than once is safe.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            if let Err(error) = join_handle.await {
                tracing::error!(error = %error, "feed loop task panicked");
            }
        }
    }
}

/// Spawn the change feed loop for one location.
///
/// Returns the control handle and the channel on which
/// [`ViewerSignal`]s are delivered to the consuming UI.
pub fn spawn_feed<S, V>(
    store: Arc<S>,
    viewer: Arc<V>,
    location_id: LocationId,
    scheduler: SchedulerHandle,
) -> (FeedHandle, mpsc::Receiver<ViewerSignal>)
where
    S: EntityStore,
    V: ViewerIdentity,
{
    let (signal_tx, signal_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_feed_loop(
        store,
        viewer,
        location_id,
        scheduler,
        signal_tx,
        shutdown_rx,
    ));
    (
        FeedHandle {
            shutdown_tx,
            task: Arc::new(Mutex::new(Some(task))),
        },
        signal_rx,
    )
}

async fn run_feed_loop<S, V>(
    store: Arc<S>,
    viewer: Arc<V>,
    location_id: LocationId,
    scheduler: SchedulerHandle,
    signal_tx: mpsc::Sender<ViewerSignal>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: EntityStore,
    V: ViewerIdentity,
{
    // Both subscriptions live exactly as long as this loop; dropping them
    // on any exit path below releases them.
    let mut sessions = store.subscribe(Table::Sessions);
    let mut transactions = store.subscribe(Table::Transactions);
    tracing::debug!(location_id = %location_id, "change feed loop subscribed");

    loop {
        tokio::select! {
            message = sessions.next() => match message {
                Some(FeedMessage::Change(event)) => {
                    if !concerns_location(&event, location_id) {
                        continue;
                    }
                    let viewer_id = viewer.current_employee_id(location_id).await;
                    if let SessionChange::ForcedSignOut { session_id } =
                        classify_session_change(&event, viewer_id)
                    {
                        tracing::info!(
                            session_id = %session_id,
                            "viewer session closed remotely; signalling sign-out"
                        );
                        if signal_tx
                            .send(ViewerSignal::ForcedSignOut { session_id })
                            .await
                            .is_err()
                        {
                            tracing::debug!("viewer signal receiver dropped");
                        }
                    }
                    scheduler.notify();
                }
                Some(FeedMessage::Lagged(missed)) => {
                    // Missed events are unrecoverable from the feed; the
                    // next recompute re-derives from the store instead.
                    tracing::warn!(missed, "session feed lagged; forcing recompute");
                    scheduler.notify();
                }
                None => break,
            },
            message = transactions.next() => match message {
                Some(FeedMessage::Change(event)) => {
                    if concerns_location(&event, location_id) {
                        scheduler.notify();
                    }
                }
                Some(FeedMessage::Lagged(missed)) => {
                    tracing::warn!(missed, "transaction feed lagged; forcing recompute");
                    scheduler.notify();
                }
                None => break,
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!(location_id = %location_id, "change feed loop stopped");
}

/// Whether a change event belongs to `location_id`.
///
/// An event carrying no row image cannot be scoped and is treated as
/// relevant; an unnecessary recompute is cheaper than a stale board.
fn concerns_location(event: &ChangeEvent, location_id: LocationId) -> bool {
    let Some(row) = event.after.as_ref().or(event.before.as_ref()) else {
        return true;
    };
    let owner = match row {
        RowData::Location(location) => location.id,
        RowData::Employee(employee) => employee.location_id,
        RowData::Session(session) => session.location_id,
        RowData::MenuItem(item) => item.location_id,
        RowData::Transaction(transaction) => transaction.location_id,
    };
    owner == location_id
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::model::{Employee, EmployeeId, LineEntry, MenuItem, Session, Transaction};
    use crate::scheduler::{SchedulerConfig, spawn_scheduler};
    use crate::store::{MemoryStore, Operation};

    /// Fixed viewer identity for tests.
    struct StaticViewer(Option<EmployeeId>);

    #[async_trait]
    impl ViewerIdentity for StaticViewer {
        async fn current_employee_id(&self, _location_id: LocationId) -> Option<EmployeeId> {
            self.0
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        location_id: LocationId,
        alex: Employee,
        alex_session: SessionId,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let location_id = Uuid::new_v4();
            let alex = Employee {
                id: Uuid::new_v4(),
                name: "Alex".to_string(),
                location_id,
            };
            store
                .insert_employee(alex.clone())
                .await
                .expect("insert should succeed");
            let alex_session = Uuid::new_v4();
            store
                .open_session(Session {
                    id: alex_session,
                    employee_id: alex.id,
                    location_id,
                    started_at: Utc::now(),
                    ended_at: None,
                })
                .await
                .expect("insert should succeed");
            Self {
                store,
                location_id,
                alex,
                alex_session,
            }
        }

        fn scheduler(&self) -> SchedulerHandle {
            spawn_scheduler(
                self.store.clone(),
                self.location_id,
                SchedulerConfig {
                    debounce: Duration::from_millis(50),
                    ..SchedulerConfig::default()
                },
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_viewers_session_signals_sign_out() {
        let fx = Fixture::new().await;
        let scheduler = fx.scheduler();
        let (feed, mut signals) = spawn_feed(
            fx.store.clone(),
            Arc::new(StaticViewer(Some(fx.alex.id))),
            fx.location_id,
            scheduler.clone(),
        );
        // Let the loop attach its subscriptions before the close lands.
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.store
            .close_session(fx.alex_session, Utc::now())
            .await
            .expect("close should succeed");

        let signal = signals.recv().await.expect("a signal should arrive");
        assert_eq!(
            signal,
            ViewerSignal::ForcedSignOut {
                session_id: fx.alex_session,
            }
        );

        feed.shutdown().await;
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closing_someone_elses_session_stays_silent() {
        let fx = Fixture::new().await;
        let billie = Employee {
            id: Uuid::new_v4(),
            name: "Billie".to_string(),
            location_id: fx.location_id,
        };
        fx.store
            .insert_employee(billie.clone())
            .await
            .expect("insert should succeed");
        let billie_session = Uuid::new_v4();
        fx.store
            .open_session(Session {
                id: billie_session,
                employee_id: billie.id,
                location_id: fx.location_id,
                started_at: Utc::now(),
                ended_at: None,
            })
            .await
            .expect("insert should succeed");

        let scheduler = fx.scheduler();
        let (feed, mut signals) = spawn_feed(
            fx.store.clone(),
            Arc::new(StaticViewer(Some(fx.alex.id))),
            fx.location_id,
            scheduler.clone(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.store
            .close_session(billie_session, Utc::now())
            .await
            .expect("close should succeed");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            signals.try_recv().is_err(),
            "another employee's clock-out must not sign the viewer out"
        );

        feed.shutdown().await;
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_transactions_drive_snapshot_updates() {
        let fx = Fixture::new().await;
        let coffee = Uuid::new_v4();
        fx.store
            .insert_menu_item(MenuItem {
                id: coffee,
                name: "Coffee".to_string(),
                location_id: fx.location_id,
                active: true,
            })
            .await
            .expect("insert should succeed");

        let scheduler = fx.scheduler();
        let mut rx = scheduler.subscribe();
        rx.changed().await.expect("first snapshot");

        let (feed, _signals) = spawn_feed(
            fx.store.clone(),
            Arc::new(StaticViewer(None)),
            fx.location_id,
            scheduler.clone(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.store
            .insert_transaction(Transaction {
                id: Uuid::new_v4(),
                employee_id: fx.alex.id,
                location_id: fx.location_id,
                session_id: Some(fx.alex_session),
                lines: vec![LineEntry {
                    item_id: coffee,
                    quantity: 1,
                }],
                order_tag: "3".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("insert should succeed");

        rx.changed().await.expect("the sale should trigger a recompute");
        let snapshot = rx.borrow().clone().expect("snapshot");
        assert_eq!(snapshot.rows[0].total, 1);

        feed.shutdown().await;
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_location_changes_are_ignored() {
        let fx = Fixture::new().await;
        let scheduler = fx.scheduler();
        let mut rx = scheduler.subscribe();
        rx.changed().await.expect("first snapshot");

        let (feed, _signals) = spawn_feed(
            fx.store.clone(),
            Arc::new(StaticViewer(None)),
            fx.location_id,
            scheduler.clone(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.store
            .insert_transaction(Transaction {
                id: Uuid::new_v4(),
                employee_id: Uuid::new_v4(),
                location_id: Uuid::new_v4(),
                session_id: None,
                lines: vec![],
                order_tag: String::new(),
                created_at: Utc::now(),
            })
            .await
            .expect("insert should succeed");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            !rx.has_changed().expect("scheduler should still be alive"),
            "a sale at another location must not trigger a recompute here"
        );

        feed.shutdown().await;
        scheduler.shutdown().await;
    }

    #[test]
    fn events_without_row_images_are_treated_as_relevant() {
        let event = ChangeEvent {
            table: Table::Sessions,
            op: Operation::Delete,
            before: None,
            after: None,
        };
        assert!(concerns_location(&event, Uuid::new_v4()));
    }
}
