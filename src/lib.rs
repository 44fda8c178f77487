//! Live upsell leaderboard aggregation engine for retail locations.
//!
//! Tracks which staff are clocked in, folds today's upsell transactions
//! into a ranked per-employee leaderboard, and keeps that leaderboard
//! current under a stream of at-least-once, possibly-reordered change
//! notifications: bursts are debounced into a single recompute, at most
//! one recompute is in flight per location, and consumers read published
//! [`Snapshot`]s through a watch channel. Rendering, CSV export, and the
//! storage engine itself stay outside this crate, behind [`EntityStore`]
//! and [`ViewerIdentity`].

mod aggregate;
pub use aggregate::{aggregate, day_stats};
mod error;
pub use error::{Anomaly, OpsError, RecomputeError, StoreError, TrackerError};
mod live;
pub use live::{FeedHandle, ViewerSignal, spawn_feed};
mod model;
pub use model::{
    Employee, EmployeeId, ItemId, LineEntry, Location, LocationId, MenuItem, Session, SessionId,
    Transaction, TransactionId, Window,
};
mod ops;
pub use ops::{clock_in, clock_out, record_upsells};
mod scheduler;
pub use scheduler::{SchedulerConfig, SchedulerHandle, spawn_scheduler};
mod snapshot;
pub use snapshot::{DayStats, LeaderboardRow, Snapshot};
mod store;
pub use store::{
    ChangeEvent, ChangeFeed, EntityStore, FeedMessage, MemoryStore, Operation, RowData, Table,
    ViewerIdentity,
};
mod tracker;
pub use tracker::{ActiveSessionTracker, ActiveStaff, SessionChange, classify_session_change};
