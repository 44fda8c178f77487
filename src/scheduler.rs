//! Decides when to recompute the leaderboard and publishes the result.
//!
//! One scheduler task owns each location's snapshot. Change notifications
//! are debounced so a burst becomes a single aggregation pass, at most one
//! pass is in flight at a time, and a notification arriving mid-pass is
//! remembered rather than dropped. Consumers subscribe read-only through a
//! watch channel; all state transitions happen inside the task, so there
//! is no shared mutable aggregate state to protect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::aggregate::aggregate;
use crate::error::RecomputeError;
use crate::model::{LocationId, Window};
use crate::snapshot::Snapshot;
use crate::store::EntityStore;
use crate::tracker::ActiveSessionTracker;

/// How many notifications the scheduler buffers. A full queue already
/// implies a recompute is due, so further tokens can be dropped.
const NOTIFY_BUFFER: usize = 64;

/// Configuration for the recompute scheduler.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use upsell_board::SchedulerConfig;
///
/// let config = SchedulerConfig {
///     debounce: Duration::from_millis(100),
///     ..SchedulerConfig::default()
/// };
/// assert_eq!(config.debounce, Duration::from_millis(100));
/// assert_eq!(config.query_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quiet period after a notification before a recompute starts.
    /// Notifications arriving within the period restart it, coalescing a
    /// burst into one aggregation pass.
    ///
    /// Default: 250 milliseconds.
    pub debounce: Duration,

    /// Upper bound on each store access inside a recompute. On expiry the
    /// pass counts as failed and the last published snapshot stays
    /// current, so a store that never answers cannot wedge the scheduler.
    ///
    /// Default: 5 seconds.
    pub query_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            query_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending,
    Running,
}

/// The Idle -> Pending -> Running machine, kept free of I/O so every
/// transition can be tested directly.
#[derive(Debug)]
struct RecomputeState {
    phase: Phase,
    run_again: bool,
}

impl RecomputeState {
    /// Startup behaves as if a notification just arrived and its quiet
    /// period already elapsed, so the first view is never empty merely
    /// because no change event has occurred yet.
    fn starting() -> Self {
        Self {
            phase: Phase::Running,
            run_again: false,
        }
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    /// A change notification arrived. While Pending the caller restarts
    /// the debounce timer; while Running the request is recorded so the
    /// completion handler re-arms instead of going idle.
    fn on_notify(&mut self) {
        match self.phase {
            Phase::Idle => self.phase = Phase::Pending,
            Phase::Pending => {}
            Phase::Running => self.run_again = true,
        }
    }

    /// The debounce timer fired.
    fn on_debounce_elapsed(&mut self) {
        debug_assert_eq!(self.phase, Phase::Pending);
        self.phase = Phase::Running;
    }

    /// A recompute finished, successfully or not. Returns `true` when a
    /// notification arrived mid-run and the debounce must be re-armed.
    fn on_run_complete(&mut self) -> bool {
        if self.run_again {
            self.run_again = false;
            self.phase = Phase::Pending;
            true
        } else {
            self.phase = Phase::Idle;
            false
        }
    }
}

/// Handle to a running scheduler task.
///
/// `Clone` is cheap -- all fields are channel endpoints or `Arc`-wrapped.
/// Dropping a handle does not stop the task mid-recompute; call
/// [`shutdown`](SchedulerHandle::shutdown) for graceful termination.
#[derive(Clone)]
pub struct SchedulerHandle {
    notify_tx: mpsc::Sender<()>,
    snapshot_rx: watch::Receiver<Option<Arc<Snapshot>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Report that something changed and the leaderboard may be stale.
    ///
    /// Cheap and non-blocking; callers fire this on every relevant change
    /// event and the scheduler coalesces the burst.
    pub fn notify(&self) {
        // A full queue or a stopped scheduler both mean the token carries
        // no new information; drop it.
        let _ = self.notify_tx.try_send(());
    }

    /// Subscribe to published snapshots.
    ///
    /// The receiver starts at the latest published value (`None` until the
    /// first recompute completes). Dropping it cancels only this
    /// subscription; in-flight recomputes and other subscribers are
    /// unaffected.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot_rx.clone()
    }

    /// The most recently published snapshot, if any.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_rx.borrow().clone()
    }

    /// Signal the scheduler to stop and wait for the task to finish.
    ///
    /// An in-flight aggregation pass is allowed to complete and publish
    /// first. Calling `shutdown` more than once is safe.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            if let Err(error) = join_handle.await {
                tracing::error!(error = %error, "scheduler task panicked");
            }
        }
    }
}

/// Spawn the scheduler task for one location.
///
/// The task immediately computes and publishes a first snapshot, then
/// recomputes on (debounced) notifications until shut down.
pub fn spawn_scheduler<S: EntityStore>(
    store: Arc<S>,
    location_id: LocationId,
    config: SchedulerConfig,
) -> SchedulerHandle {
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tracker = ActiveSessionTracker::new(store.clone(), location_id);
    let task = tokio::spawn(run_scheduler_loop(
        store,
        tracker,
        location_id,
        config,
        notify_rx,
        snapshot_tx,
        shutdown_rx,
    ));

    SchedulerHandle {
        notify_tx,
        snapshot_rx,
        shutdown_tx,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

async fn run_scheduler_loop<S: EntityStore>(
    store: Arc<S>,
    tracker: ActiveSessionTracker<S>,
    location_id: LocationId,
    config: SchedulerConfig,
    mut notify_rx: mpsc::Receiver<()>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state = RecomputeState::starting();
    let mut version: u64 = 0;
    let mut shutdown = false;
    let mut notifiers_gone = false;

    loop {
        match state.phase() {
            Phase::Idle => {
                // With every notifier gone no further work can arrive.
                if shutdown || notifiers_gone {
                    break;
                }
                tokio::select! {
                    message = notify_rx.recv() => match message {
                        Some(()) => state.on_notify(),
                        None => notifiers_gone = true,
                    },
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            shutdown = true;
                        }
                    }
                }
            }

            Phase::Pending => {
                let debounce = tokio::time::sleep(config.debounce);
                tokio::pin!(debounce);
                loop {
                    tokio::select! {
                        _ = &mut debounce => {
                            state.on_debounce_elapsed();
                            break;
                        }
                        message = notify_rx.recv(), if !notifiers_gone => match message {
                            Some(()) => {
                                // Coalesce: restart the quiet period.
                                debounce
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + config.debounce);
                            }
                            None => notifiers_gone = true,
                        },
                        result = shutdown_rx.changed(), if !shutdown => {
                            if result.is_err() || *shutdown_rx.borrow() {
                                shutdown = true;
                            }
                        }
                    }
                    if shutdown {
                        return;
                    }
                }
            }

            Phase::Running => {
                let recompute = recompute_once(store.as_ref(), &tracker, location_id, &config);
                tokio::pin!(recompute);
                let outcome = loop {
                    tokio::select! {
                        outcome = &mut recompute => break outcome,
                        message = notify_rx.recv(), if !notifiers_gone => match message {
                            // Never start a second concurrent pass; record
                            // the request for when this one completes.
                            Some(()) => state.on_notify(),
                            None => notifiers_gone = true,
                        },
                        result = shutdown_rx.changed(), if !shutdown => {
                            // Let the in-flight pass finish; subscribers
                            // may depend on its result.
                            if result.is_err() || *shutdown_rx.borrow() {
                                shutdown = true;
                            }
                        }
                    }
                };

                match outcome {
                    Ok(mut snapshot) => {
                        version += 1;
                        snapshot.version = version;
                        tracing::debug!(
                            location_id = %location_id,
                            version,
                            rows = snapshot.rows.len(),
                            "snapshot published"
                        );
                        snapshot_tx.send_replace(Some(Arc::new(snapshot)));
                    }
                    Err(error) => {
                        tracing::warn!(
                            location_id = %location_id,
                            error = %error,
                            "recompute failed; keeping last published snapshot"
                        );
                    }
                }

                let rearm = state.on_run_complete();
                if shutdown || (!rearm && notifiers_gone) {
                    break;
                }
            }
        }
    }

    tracing::debug!(location_id = %location_id, "scheduler stopped");
}

/// One full aggregation pass: snapshot the active set, then aggregate, so
/// "who is active" and "whose transactions count" agree within the result.
async fn recompute_once<S: EntityStore>(
    store: &S,
    tracker: &ActiveSessionTracker<S>,
    location_id: LocationId,
    config: &SchedulerConfig,
) -> Result<Snapshot, RecomputeError> {
    let (active, mut anomalies) = match tracker.refresh_bounded(config.query_timeout).await {
        Ok(result) => result,
        Err(error) => {
            // Stale staff on a live board beats missing staff; the next
            // notification retries.
            tracing::warn!(
                location_id = %location_id,
                error = %error,
                "active set refresh failed; using last known set"
            );
            (tracker.last_known().await, Vec::new())
        }
    };

    let window = Window::today_local();
    let run = aggregate(store, location_id, &active, window);
    let mut snapshot = match tokio::time::timeout(config.query_timeout, run).await {
        Ok(result) => result?,
        Err(_elapsed) => return Err(RecomputeError::Timeout(config.query_timeout)),
    };

    anomalies.append(&mut snapshot.anomalies);
    snapshot.anomalies = anomalies;
    Ok(snapshot)
}
