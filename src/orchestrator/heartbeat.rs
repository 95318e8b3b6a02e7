//! Per-session heartbeat liveness timer.
//!
//! Each session worker owns a [`HeartbeatMonitor`] that fires once when no
//! [`reset`](HeartbeatMonitorHandle::reset) arrives within the configured
//! timeout. The expiry is delivered over a `tokio::sync::mpsc` channel so the
//! worker can terminate the session in frame order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Event emitted when the training process goes silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatExpired {
    /// Session whose training process went silent.
    pub session_id: String,
    /// Configured timeout that elapsed.
    pub timeout: Duration,
}

/// Builder for a per-session heartbeat monitor.
pub struct HeartbeatMonitor {
    session_id: String,
    timeout: Duration,
    event_tx: mpsc::Sender<HeartbeatExpired>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Construct a monitor (the timer does not start until [`spawn`](Self::spawn)).
    #[must_use]
    pub fn new(
        session_id: String,
        timeout: Duration,
        event_tx: mpsc::Sender<HeartbeatExpired>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            timeout,
            event_tx,
            cancel,
        }
    }

    /// Spawn the timer task and return a handle for resetting it.
    #[must_use]
    pub fn spawn(self) -> HeartbeatMonitorHandle {
        let reset_notify = Arc::new(Notify::new());
        let cancel_for_handle = self.cancel.clone();
        let task = tokio::spawn(
            Self::run(
                self.session_id,
                self.timeout,
                self.event_tx,
                self.cancel,
                Arc::clone(&reset_notify),
            )
            .instrument(info_span!("heartbeat_monitor")),
        );
        HeartbeatMonitorHandle {
            reset_notify,
            join_handle: Some(task),
            cancel: cancel_for_handle,
        }
    }

    async fn run(
        session_id: String,
        timeout: Duration,
        event_tx: mpsc::Sender<HeartbeatExpired>,
        cancel: CancellationToken,
        reset_notify: Arc<Notify>,
    ) {
        loop {
            let expired = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session_id, "heartbeat monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(timeout) => true,
                () = reset_notify.notified() => false,
            };
            if expired {
                info!(session_id, ?timeout, "heartbeat timeout elapsed");
                let _ = event_tx
                    .send(HeartbeatExpired {
                        session_id: session_id.clone(),
                        timeout,
                    })
                    .await;
                return;
            }
        }
    }
}

/// Handle returned from [`HeartbeatMonitor::spawn`].
pub struct HeartbeatMonitorHandle {
    reset_notify: Arc<Notify>,
    join_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Drop for HeartbeatMonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl HeartbeatMonitorHandle {
    /// Restart the timeout (call on every frame from the training process).
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Stop the timer and wait for its task to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}
