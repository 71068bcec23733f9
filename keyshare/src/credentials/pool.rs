//! Shared credential pool.
//!
//! Assignment is a read-then-write on the assigned-user count. The whole
//! sequence runs inside one `BEGIN IMMEDIATE` transaction on the serialized
//! write pool, so two callers can never both see the last free slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::database::repositories::{
    CredentialRepository, CredentialTxOps, UserRepository, UserTxOps,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{WritePool, begin_immediate};
use crate::events::{EngineEvent, EngineEventBroadcaster};
use crate::{Error, Result};

use super::types::{Assignment, AssignmentStatus, CredentialUsage};

/// Holds the shared credentials and enforces the per-credential capacity.
pub struct CredentialPool {
    write_pool: WritePool,
    credentials: Arc<dyn CredentialRepository>,
    users: Arc<dyn UserRepository>,
    capacity: u32,
    events: EngineEventBroadcaster,
}

impl CredentialPool {
    pub fn new(
        write_pool: WritePool,
        credentials: Arc<dyn CredentialRepository>,
        users: Arc<dyn UserRepository>,
        capacity: u32,
        events: EngineEventBroadcaster,
    ) -> Self {
        Self {
            write_pool,
            credentials,
            users,
            capacity,
            events,
        }
    }

    /// Maximum users per credential.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Provision credentials from a static list. Already-known secrets are skipped.
    pub async fn seed(&self, secrets: &[String]) -> Result<u64> {
        let inserted = retry_on_sqlite_busy("seed_credentials", || {
            self.credentials.seed(secrets, Utc::now())
        })
        .await?;
        if inserted > 0 {
            info!(inserted, total = secrets.len(), "Seeded new credentials");
        } else {
            debug!("No new credentials to seed");
        }
        Ok(inserted)
    }

    /// Give the user a credential, or return the one they already hold.
    ///
    /// Fails with [`Error::PoolExhausted`] when every active credential is full.
    pub async fn assign(&self, user_id: i64) -> Result<Assignment> {
        self.assign_at(user_id, None, Utc::now()).await
    }

    /// Like [`Self::assign`], recording `referrer_hint` if this creates the user.
    #[instrument(skip(self, now))]
    pub async fn assign_at(
        &self,
        user_id: i64,
        referrer_hint: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let assignment = retry_on_sqlite_busy("assign_credential", || {
            self.try_assign(user_id, referrer_hint, now)
        })
        .await?;

        if assignment.status == AssignmentStatus::Assigned {
            info!(
                credential_id = %assignment.credential_id,
                "Credential assigned"
            );
            self.events.publish(EngineEvent::CredentialAssigned {
                user_id,
                credential_id: assignment.credential_id.clone(),
            });
        }

        Ok(assignment)
    }

    async fn try_assign(
        &self,
        user_id: i64,
        referrer_hint: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let mut tx = begin_immediate(&self.write_pool).await?;

        let user = UserTxOps::get_or_create_user(&mut tx, user_id, referrer_hint, now).await?;

        if let Some(current_id) = user.assigned_credential_id.as_deref() {
            match CredentialTxOps::get_credential(&mut tx, current_id).await? {
                Some(current) if current.is_active => {
                    tx.commit().await?;
                    return Ok(Assignment {
                        credential_id: current.id,
                        secret: current.secret,
                        status: AssignmentStatus::Existing,
                    });
                }
                _ => {
                    debug!(
                        credential_id = %current_id,
                        "Held credential is no longer active; reassigning"
                    );
                }
            }
        }

        let Some(credential) = CredentialTxOps::find_with_capacity(&mut tx, self.capacity).await?
        else {
            // Keep the user row created above; only the assignment failed.
            tx.commit().await?;
            warn!(capacity = self.capacity, "Credential pool exhausted");
            return Err(Error::PoolExhausted);
        };

        UserTxOps::set_assignment(&mut tx, user_id, &credential.id).await?;
        tx.commit().await?;

        Ok(Assignment {
            credential_id: credential.id,
            secret: credential.secret,
            status: AssignmentStatus::Assigned,
        })
    }

    /// Drop the user's assignment. Returns false when there was nothing to release.
    #[instrument(skip(self))]
    pub async fn release(&self, user_id: i64) -> Result<bool> {
        let released =
            retry_on_sqlite_busy("release_credential", || self.users.clear_assignment(user_id))
                .await?;

        if released {
            debug!("Credential released");
            self.events
                .publish(EngineEvent::CredentialReleased { user_id });
        }
        Ok(released)
    }

    /// Secret of the user's credential, if they hold one that is still active.
    pub async fn credential_for(&self, user_id: i64) -> Result<Option<String>> {
        let Some(user) = self.users.find_by_id(user_id).await? else {
            return Ok(None);
        };
        let Some(credential_id) = user.assigned_credential_id else {
            return Ok(None);
        };

        let credential = self.credentials.find_by_id(&credential_id).await?;
        Ok(credential.filter(|c| c.is_active).map(|c| c.secret))
    }

    /// Per-credential assigned counts against the configured capacity.
    pub async fn usage_stats(&self) -> Result<Vec<CredentialUsage>> {
        let rows = self.credentials.usage().await?;
        Ok(rows
            .into_iter()
            .map(|row| CredentialUsage {
                credential_id: row.id,
                active: row.is_active,
                assigned_count: u32::try_from(row.assigned_count).unwrap_or(u32::MAX),
                capacity: self.capacity,
            })
            .collect())
    }

    /// Operator (de)activation. Existing holders keep the credential until
    /// their next `assign`, which moves them to an active one.
    #[instrument(skip(self))]
    pub async fn set_active(&self, credential_id: &str, active: bool) -> Result<bool> {
        let changed = retry_on_sqlite_busy("set_credential_active", || {
            self.credentials.set_active(credential_id, active, Utc::now())
        })
        .await?;

        if changed {
            info!("Credential state changed");
            self.events.publish(EngineEvent::CredentialStateChanged {
                credential_id: credential_id.to_string(),
                active,
            });
        } else {
            warn!("Unknown credential");
        }
        Ok(changed)
    }
}
