//! Background expiration sweep
//!
//! The sweeper wakes on a fixed interval, snapshots the sessions that are
//! reclaimable, and ends them with at most `max_concurrent_cleanups` ends in
//! flight. Each end re-validates eligibility under the session's reference
//! lock, so a session picked up by a snapshot but referenced again before its
//! turn is left alone.

use crate::config::SweeperConfig;
use crate::session::metrics;
use crate::session::registry::{EndOutcome, SessionRegistry};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Counts from one sweep tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions in the snapshot
    pub candidates: usize,
    /// Sessions ended by this sweep
    pub ended: usize,
    /// Sessions re-referenced or refreshed before their turn
    pub retained: usize,
    /// Sessions whose end hooks failed (still removed)
    pub failed: usize,
}

/// Periodic reclaimer of expired sessions
pub struct ExpirationSweeper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    limiter: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ExpirationSweeper {
    /// Create a sweeper
    ///
    /// `max_concurrent_cleanups` of zero is treated as one.
    pub fn new(
        registry: Arc<SessionRegistry>,
        interval: Duration,
        max_concurrent_cleanups: usize,
    ) -> Self {
        Self {
            registry,
            interval,
            limiter: Arc::new(Semaphore::new(max_concurrent_cleanups.max(1))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(registry: Arc<SessionRegistry>, config: &SweeperConfig) -> Self {
        Self::new(registry, config.interval(), config.max_concurrent_cleanups)
    }

    /// Token that stops the loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run one sweep over the current registry contents
    pub async fn sweep_once(&self) -> SweepReport {
        let started = Instant::now();
        let candidates = self.registry.reclaimable_sessions(Utc::now());
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        if candidates.is_empty() {
            debug!(sweep.candidates = 0, "Nothing to sweep");
            metrics::sweep_finished(started.elapsed());
            return report;
        }

        let mut handles = Vec::with_capacity(candidates.len());
        for session_id in candidates {
            let permit = match Arc::clone(&self.limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let registry = Arc::clone(&self.registry);
            handles.push(self.tracker.spawn(async move {
                let _permit = permit;
                (session_id, registry.reclaim_session(&session_id).await)
            }));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(EndOutcome::Ended))) => report.ended += 1,
                Ok((_, Ok(EndOutcome::AlreadyEnded))) => {}
                Ok((_, Ok(_))) => report.retained += 1,
                Ok((session_id, Err(e))) => {
                    report.failed += 1;
                    warn!(session.id = %session_id, error = %e, "Session cleanup failed during sweep");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "Sweep task failed");
                }
            }
        }

        metrics::sweep_finished(started.elapsed());
        info!(
            sweep.candidates = report.candidates,
            sweep.ended = report.ended,
            sweep.retained = report.retained,
            sweep.failed = report.failed,
            sweep.duration_ms = started.elapsed().as_millis() as u64,
            "Sweep finished"
        );
        report
    }

    /// Sweep every interval until the shutdown token is cancelled
    ///
    /// In-flight session ends are awaited before returning.
    pub async fn run(self) {
        info!(
            sweep.interval_secs = self.interval.as_secs(),
            "Expiration sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.sweep_once()
                .instrument(info_span!("sweep"))
                .await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.limiter.close();
        info!("Expiration sweeper stopped");
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self) -> SweeperHandle {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        SweeperHandle { shutdown, task }
    }
}

/// Handle to a spawned sweeper
pub struct SweeperHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for in-flight ends to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Expiration sweeper task failed");
        }
    }
}
