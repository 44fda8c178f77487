//! The entity store seam and the in-memory reference backend.
//!
//! The aggregation core never talks to a storage backend directly; it goes
//! through the [`EntityStore`] trait. Historical deployments carried four
//! structurally different row schemas for the same feature — that variance
//! is absorbed behind this boundary, so the tracker, aggregator, and
//! scheduler see exactly one typed model.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and
//! embedding hosts. Its change feeds are backed by broadcast channels, so
//! delivery is at-least-once from the consumer's point of view: a slow
//! subscriber observes a lag marker instead of the dropped events and is
//! expected to re-derive from the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::StoreError;
use crate::model::{
    Employee, EmployeeId, ItemId, Location, LocationId, MenuItem, Session, SessionId, Transaction,
    Window,
};

/// The tables a consumer can read from or subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Retail locations.
    Locations,
    /// Staff members.
    Employees,
    /// Shift records.
    Sessions,
    /// The upsellable item vocabulary.
    MenuItems,
    /// Recorded upsells.
    Transactions,
}

/// The kind of change a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// A row was created.
    Insert,
    /// A row was modified in place.
    Update,
    /// A row was removed.
    Delete,
}

/// A typed row image carried on a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowData {
    /// A location row.
    Location(Location),
    /// An employee row.
    Employee(Employee),
    /// A session row.
    Session(Session),
    /// A menu item row.
    MenuItem(MenuItem),
    /// A transaction row.
    Transaction(Transaction),
}

/// One change observed on a subscribed table.
///
/// `before` and `after` are best-effort row images: inserts carry only
/// `after`, deletes only `before`, updates ideally both. Consumers must
/// stay correct when either is missing, since the underlying feed is
/// at-least-once and possibly reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The table the change happened on.
    pub table: Table,
    /// What kind of change occurred.
    pub op: Operation,
    /// Row image before the change, when available.
    pub before: Option<RowData>,
    /// Row image after the change, when available.
    pub after: Option<RowData>,
}

/// One message from a [`ChangeFeed`].
#[derive(Debug)]
pub enum FeedMessage {
    /// A change was observed on the subscribed table.
    Change(ChangeEvent),
    /// The subscriber fell behind and the given number of events were
    /// dropped.
    ///
    /// The current state must be re-derived from the store; the dropped
    /// events are not recoverable from the feed.
    Lagged(u64),
}

/// A live subscription to one table's change events.
///
/// The subscription is held for as long as this value is alive and
/// released when it is dropped, on every exit path.
pub struct ChangeFeed {
    inner: BroadcastStream<ChangeEvent>,
}

impl ChangeFeed {
    /// Wait for the next message on the feed.
    ///
    /// Returns `None` once the publishing store has been dropped and all
    /// buffered events are consumed.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        match self.inner.next().await {
            Some(Ok(event)) => Some(FeedMessage::Change(event)),
            Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                Some(FeedMessage::Lagged(missed))
            }
            None => None,
        }
    }
}

/// The typed seam between the aggregation core and the backing store.
///
/// Read methods scope by location and resolve to the converged model in
/// [`crate::model`]; write methods cover exactly the flows that generate
/// the change events the engine consumes. Every write publishes a
/// [`ChangeEvent`] on the corresponding table's feed.
#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    /// Look up a single employee, returning `None` if the id does not
    /// resolve.
    async fn employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError>;

    /// All sessions with no recorded end time for a location, ordered by
    /// start time ascending.
    async fn open_sessions(&self, location_id: LocationId) -> Result<Vec<Session>, StoreError>;

    /// A location's full menu vocabulary, in menu order, including
    /// inactive items (historical transactions must still resolve).
    async fn menu_items(&self, location_id: LocationId) -> Result<Vec<MenuItem>, StoreError>;

    /// All transactions for a location whose creation time falls inside
    /// `window`, ordered by creation time ascending.
    async fn transactions_in(
        &self,
        location_id: LocationId,
        window: Window,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Create an employee row.
    async fn insert_employee(&self, employee: Employee) -> Result<(), StoreError>;

    /// Create a menu item row.
    async fn insert_menu_item(&self, item: MenuItem) -> Result<(), StoreError>;

    /// Create a session row (clock-in).
    async fn open_session(&self, session: Session) -> Result<(), StoreError>;

    /// Set the end timestamp on an existing session (clock-out).
    ///
    /// Fails with [`StoreError::WriteRejected`] if the session does not
    /// exist.
    async fn close_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Create a transaction row.
    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError>;

    /// Subscribe to change events on one table.
    fn subscribe(&self, table: Table) -> ChangeFeed;
}

/// The session-establishment collaborator, seen from the engine.
///
/// The feed loop asks it which employee the current viewer is signed in
/// as, to decide whether a session close is a forced sign-out for *this*
/// viewer.
#[async_trait]
pub trait ViewerIdentity: Send + Sync + 'static {
    /// The employee the viewer is currently signed in as at `location_id`,
    /// or `None` when nobody is signed in on this device.
    async fn current_employee_id(&self, location_id: LocationId) -> Option<EmployeeId>;
}

/// How many change events a feed buffers per subscriber before it starts
/// reporting lag instead.
const FEED_BUFFER: usize = 256;

#[derive(Default)]
struct Rows {
    locations: HashMap<LocationId, Location>,
    employees: HashMap<EmployeeId, Employee>,
    sessions: IndexMap<SessionId, Session>,
    menu_items: IndexMap<ItemId, MenuItem>,
    transactions: Vec<Transaction>,
}

/// In-memory [`EntityStore`] backed by broadcast change feeds.
///
/// `Clone` is cheap -- all clones share the same state and feeds. The
/// [`fail_queries`](MemoryStore::fail_queries) switch makes every read
/// return [`StoreError::QueryFailed`], which tests use to exercise the
/// stale-set and last-known-good degradation paths.
#[derive(Clone)]
pub struct MemoryStore {
    rows: Arc<RwLock<Rows>>,
    feeds: Arc<HashMap<Table, broadcast::Sender<ChangeEvent>>>,
    queries_fail: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let feeds = [
            Table::Locations,
            Table::Employees,
            Table::Sessions,
            Table::MenuItems,
            Table::Transactions,
        ]
        .into_iter()
        .map(|table| (table, broadcast::channel(FEED_BUFFER).0))
        .collect();

        Self {
            rows: Arc::new(RwLock::new(Rows::default())),
            feeds: Arc::new(feeds),
            queries_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Toggle read-failure injection.
    ///
    /// While enabled, every read method returns
    /// [`StoreError::QueryFailed`]; writes still succeed and publish
    /// change events.
    pub fn fail_queries(&self, fail: bool) {
        self.queries_fail.store(fail, Ordering::Release);
    }

    /// Create a location row.
    pub async fn insert_location(&self, location: Location) {
        let mut rows = self.rows.write().await;
        rows.locations.insert(location.id, location.clone());
        drop(rows);
        self.publish(ChangeEvent {
            table: Table::Locations,
            op: Operation::Insert,
            before: None,
            after: Some(RowData::Location(location)),
        });
    }

    fn check_readable(&self) -> Result<(), StoreError> {
        if self.queries_fail.load(Ordering::Acquire) {
            return Err(StoreError::QueryFailed("injected failure".to_string()));
        }
        Ok(())
    }

    fn publish(&self, event: ChangeEvent) {
        let sender = &self.feeds[&event.table];
        // Send fails only when nobody is subscribed, which is fine.
        let _ = sender.send(event);
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn employee(&self, id: EmployeeId) -> Result<Option<Employee>, StoreError> {
        self.check_readable()?;
        Ok(self.rows.read().await.employees.get(&id).cloned())
    }

    async fn open_sessions(&self, location_id: LocationId) -> Result<Vec<Session>, StoreError> {
        self.check_readable()?;
        let rows = self.rows.read().await;
        let mut sessions: Vec<Session> = rows
            .sessions
            .values()
            .filter(|s| s.location_id == location_id && s.is_open())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    async fn menu_items(&self, location_id: LocationId) -> Result<Vec<MenuItem>, StoreError> {
        self.check_readable()?;
        let rows = self.rows.read().await;
        Ok(rows
            .menu_items
            .values()
            .filter(|i| i.location_id == location_id)
            .cloned()
            .collect())
    }

    async fn transactions_in(
        &self,
        location_id: LocationId,
        window: Window,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.check_readable()?;
        let rows = self.rows.read().await;
        let mut transactions: Vec<Transaction> = rows
            .transactions
            .iter()
            .filter(|t| t.location_id == location_id && window.contains(t.created_at))
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.created_at);
        Ok(transactions)
    }

    async fn insert_employee(&self, employee: Employee) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        rows.employees.insert(employee.id, employee.clone());
        drop(rows);
        self.publish(ChangeEvent {
            table: Table::Employees,
            op: Operation::Insert,
            before: None,
            after: Some(RowData::Employee(employee)),
        });
        Ok(())
    }

    async fn insert_menu_item(&self, item: MenuItem) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        rows.menu_items.insert(item.id, item.clone());
        drop(rows);
        self.publish(ChangeEvent {
            table: Table::MenuItems,
            op: Operation::Insert,
            before: None,
            after: Some(RowData::MenuItem(item)),
        });
        Ok(())
    }

    async fn open_session(&self, session: Session) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        rows.sessions.insert(session.id, session.clone());
        drop(rows);
        self.publish(ChangeEvent {
            table: Table::Sessions,
            op: Operation::Insert,
            before: None,
            after: Some(RowData::Session(session)),
        });
        Ok(())
    }

    async fn close_session(
        &self,
        id: SessionId,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let session = rows
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::WriteRejected(format!("no session with id {id}")))?;
        let before = session.clone();
        session.ended_at = Some(ended_at);
        let after = session.clone();
        drop(rows);
        self.publish(ChangeEvent {
            table: Table::Sessions,
            op: Operation::Update,
            before: Some(RowData::Session(before)),
            after: Some(RowData::Session(after)),
        });
        Ok(())
    }

    async fn insert_transaction(&self, transaction: Transaction) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        rows.transactions.push(transaction.clone());
        drop(rows);
        self.publish(ChangeEvent {
            table: Table::Transactions,
            op: Operation::Insert,
            before: None,
            after: Some(RowData::Transaction(transaction)),
        });
        Ok(())
    }

    fn subscribe(&self, table: Table) -> ChangeFeed {
        ChangeFeed {
            inner: BroadcastStream::new(self.feeds[&table].subscribe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn session(location_id: LocationId, started_at: DateTime<Utc>) -> Session {
        Session {
            id: Uuid::new_v4(),
            employee_id: Uuid::new_v4(),
            location_id,
            started_at,
            ended_at: None,
        }
    }

    #[tokio::test]
    async fn open_sessions_filters_closed_and_foreign_locations() {
        let store = MemoryStore::new();
        let location_id = Uuid::new_v4();

        let open = session(location_id, ts(100));
        let elsewhere = session(Uuid::new_v4(), ts(50));
        store
            .open_session(open.clone())
            .await
            .expect("insert should succeed");
        store
            .open_session(elsewhere)
            .await
            .expect("insert should succeed");
        store
            .close_session(open.id, ts(400))
            .await
            .expect("close should succeed");

        let remaining = store
            .open_sessions(location_id)
            .await
            .expect("query should succeed");
        assert!(
            remaining.is_empty(),
            "all sessions for the location are closed or elsewhere"
        );
    }

    #[tokio::test]
    async fn open_sessions_are_ordered_by_start_time() {
        let store = MemoryStore::new();
        let location_id = Uuid::new_v4();

        let late = session(location_id, ts(500));
        let early = session(location_id, ts(100));
        store
            .open_session(late.clone())
            .await
            .expect("insert should succeed");
        store
            .open_session(early.clone())
            .await
            .expect("insert should succeed");

        let sessions = store
            .open_sessions(location_id)
            .await
            .expect("query should succeed");
        let ids: Vec<SessionId> = sessions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn transactions_in_respects_window_bounds() {
        let store = MemoryStore::new();
        let location_id = Uuid::new_v4();
        let window = Window {
            start: ts(100),
            end: ts(200),
        };

        for (created_at, expected_inside) in [(99, false), (100, true), (199, true), (200, false)] {
            let txn = Transaction {
                id: Uuid::new_v4(),
                employee_id: Uuid::new_v4(),
                location_id,
                session_id: None,
                lines: vec![],
                order_tag: String::new(),
                created_at: ts(created_at),
            };
            store
                .insert_transaction(txn.clone())
                .await
                .expect("insert should succeed");
            let inside = store
                .transactions_in(location_id, window)
                .await
                .expect("query should succeed")
                .iter()
                .any(|t| t.id == txn.id);
            assert_eq!(inside, expected_inside, "created_at = {created_at}");
        }
    }

    #[tokio::test]
    async fn close_session_publishes_update_with_both_images() {
        let store = MemoryStore::new();
        let location_id = Uuid::new_v4();
        let open = session(location_id, ts(100));
        store
            .open_session(open.clone())
            .await
            .expect("insert should succeed");

        let mut feed = store.subscribe(Table::Sessions);
        store
            .close_session(open.id, ts(200))
            .await
            .expect("close should succeed");

        let message = feed.next().await.expect("feed should yield an event");
        let FeedMessage::Change(event) = message else {
            panic!("expected a change event, got lag");
        };
        assert_eq!(event.op, Operation::Update);
        let Some(RowData::Session(before)) = event.before else {
            panic!("update should carry a before image");
        };
        let Some(RowData::Session(after)) = event.after else {
            panic!("update should carry an after image");
        };
        assert!(before.is_open());
        assert_eq!(after.ended_at, Some(ts(200)));
    }

    #[tokio::test]
    async fn close_unknown_session_is_rejected() {
        let store = MemoryStore::new();
        let result = store.close_session(Uuid::new_v4(), ts(100)).await;
        assert!(
            matches!(result, Err(StoreError::WriteRejected(_))),
            "got: {result:?}"
        );
    }

    #[tokio::test]
    async fn fail_queries_rejects_reads_but_not_writes() {
        let store = MemoryStore::new();
        let location_id = Uuid::new_v4();
        store.fail_queries(true);

        let read = store.open_sessions(location_id).await;
        assert!(matches!(read, Err(StoreError::QueryFailed(_))));

        store
            .open_session(session(location_id, ts(100)))
            .await
            .expect("writes should still succeed");

        store.fail_queries(false);
        let sessions = store
            .open_sessions(location_id)
            .await
            .expect("reads recover once injection is off");
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag_marker() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe(Table::Sessions);

        // Overflow the per-subscriber buffer without draining the feed.
        for i in 0..(FEED_BUFFER + 10) {
            store
                .open_session(session(Uuid::new_v4(), ts(i as i64)))
                .await
                .expect("insert should succeed");
        }

        let message = feed.next().await.expect("feed should yield");
        assert!(
            matches!(message, FeedMessage::Lagged(n) if n > 0),
            "first message after overflow should report lag"
        );
    }

    #[tokio::test]
    async fn dropped_feed_releases_the_subscription() {
        let store = MemoryStore::new();
        let feed = store.subscribe(Table::Transactions);
        assert_eq!(store.feeds[&Table::Transactions].receiver_count(), 1);
        drop(feed);
        assert_eq!(store.feeds[&Table::Transactions].receiver_count(), 0);
    }
}
