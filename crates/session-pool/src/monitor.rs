//! Background probe loop

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pool::Pool;

/// Upper bound on one probe cycle. A hung cycle is abandoned and the loop
/// carries on with the next one.
pub const PROBE_BATCH_TIMEOUT: Duration = Duration::from_secs(600);

/// A running loop and the signal that ends it between cycles.
pub(crate) struct MonitorHandle {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl MonitorHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Kill the loop outright, mid-cycle included. Only for pool teardown.
    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

impl Pool {
    /// Start the monitor loop if monitoring is enabled.
    ///
    /// Returns true when the loop is running afterwards (started now or
    /// already running). Needs a tokio runtime; without one, nothing starts.
    pub async fn start_monitor(self: &Arc<Self>) -> bool {
        let monitor = self.monitor_config().await;
        if !monitor.enable {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, monitor not started");
            return false;
        };

        let mut current = self
            .monitor_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref().is_some_and(MonitorHandle::is_running) {
            return true;
        }
        let (stop, stopped) = watch::channel(false);
        let task = runtime.spawn(monitor_loop(Arc::downgrade(self), stopped));
        *current = Some(MonitorHandle { task, stop });
        info!(interval_hours = monitor.interval, "monitor started");
        true
    }

    /// Stop the monitor loop. Returns whether it was running.
    ///
    /// A cycle already in progress finishes, state save included, and the
    /// loop exits before sleeping again.
    pub fn stop_monitor(&self) -> bool {
        let mut current = self
            .monitor_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match current.take() {
            Some(handle) => {
                let running = handle.is_running();
                let _ = handle.stop.send(true);
                if running {
                    info!("monitor stopped");
                }
                running
            }
            None => false,
        }
    }

    pub fn is_monitor_running(&self) -> bool {
        self.monitor_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(MonitorHandle::is_running)
    }
}

/// Probe, sleep for the configured interval, repeat until stopped. Holds only
/// a weak reference between cycles so a dropped pool ends the loop.
async fn monitor_loop(pool: Weak<Pool>, mut stopped: watch::Receiver<bool>) {
    loop {
        if *stopped.borrow() {
            return;
        }
        let Some(strong) = pool.upgrade() else {
            return;
        };
        let interval = strong.monitor_config().await.interval_duration();
        info!(interval_secs = interval.as_secs(), "starting probe cycle");
        if tokio::time::timeout(PROBE_BATCH_TIMEOUT, strong.test_all())
            .await
            .is_err()
        {
            error!(
                timeout_secs = PROBE_BATCH_TIMEOUT.as_secs(),
                "probe cycle timed out, moving on"
            );
        }
        drop(strong);

        tokio::select! {
            // Stop requested, or the handle is gone
            _ = stopped.changed() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
