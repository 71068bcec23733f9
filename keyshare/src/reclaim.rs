//! Idle credential reclaim.
//!
//! Runs out-of-band and frees the slots of users who stopped talking to the
//! service. The user rows stay; the next request simply assigns again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityTracker;
use crate::credentials::CredentialPool;
use crate::{Error, Result};

/// Default inactivity before a credential is reclaimed.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

pub struct Reclaimer {
    tracker: Arc<ActivityTracker>,
    pool: Arc<CredentialPool>,
}

impl Reclaimer {
    pub fn new(tracker: Arc<ActivityTracker>, pool: Arc<CredentialPool>) -> Self {
        Self { tracker, pool }
    }

    /// Release every assignment idle for longer than `idle_threshold`.
    /// Returns the number released.
    pub async fn sweep(&self, idle_threshold: Duration) -> Result<u64> {
        self.sweep_at(idle_threshold, Utc::now()).await
    }

    /// A failure to release one user is logged and the sweep moves on.
    pub async fn sweep_at(&self, idle_threshold: Duration, now: DateTime<Utc>) -> Result<u64> {
        let threshold = chrono::Duration::from_std(idle_threshold)
            .map_err(|e| Error::validation(format!("idle threshold out of range: {}", e)))?;
        let cutoff = now - threshold;

        let idle_users = self.tracker.idle_assigned_users(cutoff).await?;
        if idle_users.is_empty() {
            debug!("No idle users to reclaim");
            return Ok(0);
        }

        let candidates = idle_users.len();
        let mut released = 0u64;
        let mut failed = 0usize;

        for user in idle_users {
            match self.pool.release(user.id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    warn!(user_id = user.id, error = %e, "Failed to release idle credential");
                }
            }
        }

        info!(released, failed, candidates, "Idle reclaim sweep finished");
        Ok(released)
    }

    /// Sweep every `sweep_interval` until cancelled.
    pub fn start_background_task(
        self: Arc<Self>,
        sweep_interval: Duration,
        idle_threshold: Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);

            info!(
                interval_secs = sweep_interval.as_secs(),
                idle_threshold_secs = idle_threshold.as_secs(),
                "Reclaimer started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Reclaimer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(idle_threshold).await {
                            error!(error = %e, "Reclaim sweep failed");
                        }
                    }
                }
            }
        })
    }
}
