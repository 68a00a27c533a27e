//! Adaptive polling controller.
//!
//! Drives a refresh callback on a fixed interval while any observed signal
//! says work is outstanding, and suspends the timer entirely once all
//! signals clear. Flipping a signal back on wakes the loop immediately
//! rather than waiting out a stale interval.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Fixed poll cadence while work is outstanding.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// The signals the controller watches. Any one of them being "on" means
/// server state is still moving and worth polling for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSignals {
    /// A snapshot load is already in flight.
    pub loading: bool,
    /// At least one investigation is waiting for a worker.
    pub has_pending_investigations: bool,
    /// Tasks currently being investigated.
    pub investigating_task_ids: Vec<Uuid>,
}

impl SyncSignals {
    pub fn has_outstanding_work(&self) -> bool {
        self.loading || self.has_pending_investigations || !self.investigating_task_ids.is_empty()
    }
}

/// Owns the polling loop. `start` spawns it, `stop` tears it down; updating
/// the signals re-evaluates the loop state immediately.
pub struct SyncController {
    tx: watch::Sender<SyncSignals>,
    handle: Option<JoinHandle<()>>,
}

impl SyncController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncSignals::default());
        Self { tx, handle: None }
    }

    /// Replace the observed signals. No-op if nothing changed, so repeated
    /// identical snapshots do not wake the loop.
    pub fn update(&self, signals: SyncSignals) {
        self.tx.send_if_modified(|current| {
            if *current == signals {
                false
            } else {
                *current = signals;
                true
            }
        });
    }

    /// Current signals.
    pub fn signals(&self) -> SyncSignals {
        self.tx.borrow().clone()
    }

    /// Start polling. While any signal indicates work: refresh immediately,
    /// then every `POLL_INTERVAL`. With no work the loop parks on the next
    /// signal change. At most one refresh is in flight at a time.
    ///
    /// Calling `start` on a running controller restarts the loop.
    pub fn start<F, Fut>(&mut self, mut refresh: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.stop();

        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                if rx.borrow_and_update().has_outstanding_work() {
                    refresh().await;

                    // Hold the cadence for one interval, but bail out of
                    // the wait as soon as all signals clear
                    let sleep = tokio::time::sleep(POLL_INTERVAL);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            _ = &mut sleep => break,
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                if !rx.borrow_and_update().has_outstanding_work() {
                                    break;
                                }
                            }
                        }
                    }
                } else {
                    debug!("Sync loop parked, no outstanding work");
                    if rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        });
        self.handle = Some(handle);
    }

    /// Tear down the polling loop. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Sync loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Default for SyncController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop();
    }
}
