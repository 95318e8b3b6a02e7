//! Session table: the only place several sessions coexist.
//!
//! A [`SessionManager`] is constructed once at server start. It attaches a
//! worker to every accepted connection, hands out [`SessionHandle`]s to the
//! local API, and tears every session down on shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::session::{SessionId, SessionStatus};
use crate::models::watchpoint::Watchpoint;
use crate::orchestrator::control::SessionHandle;
use crate::orchestrator::session::SessionCore;
use crate::orchestrator::worker::spawn_session;
use crate::{AppError, Result};

const GC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Deposit {
    at: DateTime<Utc>,
    watchpoints: Vec<Watchpoint>,
}

/// Watchpoint registries of ended sessions, keyed by reconnect token.
#[derive(Debug, Default)]
pub struct ReconnectLedger {
    entries: DashMap<String, Deposit>,
}

impl ReconnectLedger {
    /// Record the registry of a session that just ended.
    pub fn deposit(&self, token: &str, watchpoints: Vec<Watchpoint>) {
        if watchpoints.is_empty() {
            return;
        }
        self.entries.insert(
            token.to_owned(),
            Deposit {
                at: Utc::now(),
                watchpoints,
            },
        );
    }

    /// Claim the registry deposited under `token`. Each deposit is claimed once.
    #[must_use]
    pub fn take(&self, token: &str) -> Option<Vec<Watchpoint>> {
        self.entries.remove(token).map(|(_, d)| d.watchpoints)
    }

    /// Drop the deposit under `token`.
    pub fn forget(&self, token: &str) {
        self.entries.remove(token);
    }

    /// Drop deposits made before `cutoff`; returns how many were dropped.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, d| d.at >= cutoff);
        before - self.entries.len()
    }

    /// Number of unclaimed deposits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no deposit is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owner of every session of this process.
#[derive(Debug)]
pub struct SessionManager {
    config: Arc<GlobalConfig>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    ledger: Arc<ReconnectLedger>,
    cancel: CancellationToken,
    // Serialises the live-count check with the insert in `attach`.
    attach_guard: std::sync::Mutex<()>,
}

impl SessionManager {
    /// Create an empty table. Cancelling `cancel` closes every session.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, cancel: CancellationToken) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            ledger: Arc::new(ReconnectLedger::default()),
            cancel,
            attach_guard: std::sync::Mutex::new(()),
        }
    }

    /// Shared configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Reconnect ledger shared with every session worker.
    #[must_use]
    pub fn ledger(&self) -> &ReconnectLedger {
        &self.ledger
    }

    /// Start a session on a freshly accepted connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LimitExceeded` when `max_sessions` live sessions
    /// already exist. Concurrent callers never exceed the limit together.
    pub fn attach<R, W>(&self, source: R, sink: W) -> Result<Arc<SessionHandle>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let _guard = self
            .attach_guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let live = self.live_count();
        if live >= self.config.max_sessions {
            warn!(live, max = self.config.max_sessions, "connection refused: session limit");
            return Err(AppError::LimitExceeded(format!(
                "session limit of {} reached",
                self.config.max_sessions
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let reconnect_token = Uuid::new_v4().to_string();
        let core = SessionCore::new(session_id.clone(), reconnect_token, Arc::clone(&self.config));
        let handle = Arc::new(spawn_session(
            core,
            &self.config,
            source,
            sink,
            Arc::clone(&self.ledger),
            self.cancel.child_token(),
        ));
        self.sessions.insert(session_id.clone(), Arc::clone(&handle));
        info!(session_id, "session attached");
        Ok(handle)
    }

    /// Look up a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or collected id.
    pub fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// Status of every session, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> =
            self.sessions.iter().map(|entry| entry.status()).collect();
        statuses.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        statuses
    }

    /// Number of sessions not yet terminated.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.status().state.is_live())
            .count()
    }

    /// Close a session and remove it from the table immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub fn close_session(&self, session_id: &str) -> Result<()> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        handle.close();
        info!(session_id, "session closed and removed");
        Ok(())
    }

    /// Remove sessions terminated before the retention window and expired
    /// reconnect deposits. Returns the collected session ids.
    pub fn collect_terminated(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let retention = chrono::Duration::from_std(self.config.terminated_retention())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = now - retention;

        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .status()
                    .terminated_at
                    .is_some_and(|at| at <= cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in &expired {
            self.sessions.remove(session_id);
        }

        let pruned = self.ledger.prune_before(cutoff);
        if !expired.is_empty() || pruned > 0 {
            info!(
                sessions = expired.len(),
                deposits = pruned,
                "terminated sessions collected"
            );
        }
        expired
    }

    /// Spawn the periodic collection task.
    #[must_use]
    pub fn spawn_gc_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(GC_INTERVAL);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("session gc shutting down");
                            break;
                        }
                        _ = interval.tick() => {
                            manager.collect_terminated(Utc::now());
                        }
                    }
                }
            }
            .instrument(info_span!("session_gc")),
        )
    }

    /// Close every session and wait for their workers.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handle in &handles {
            handle.close();
        }
        for handle in &handles {
            handle.join().await;
        }
        self.sessions.clear();
        info!(sessions = handles.len(), "session manager shut down");
    }
}
