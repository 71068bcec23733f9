//! Last-seen tracking.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::Result;
use crate::database::models::UserDbModel;
use crate::database::repositories::UserRepository;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::elapsed_since;

/// Records when each user last consumed their credential.
pub struct ActivityTracker {
    users: Arc<dyn UserRepository>,
}

impl ActivityTracker {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    /// Mark the user as active now. Creates the user on first contact.
    pub async fn touch(&self, user_id: i64) -> Result<()> {
        self.touch_at(user_id, Utc::now()).await
    }

    pub async fn touch_at(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        retry_on_sqlite_busy("record_activity", || {
            self.users.record_activity(user_id, now)
        })
        .await?;
        trace!(user_id, "Activity recorded");
        Ok(())
    }

    /// Time since the user was last active, or `None` for unknown users.
    pub async fn idle_since(&self, user_id: i64) -> Result<Option<Duration>> {
        self.idle_since_at(user_id, Utc::now()).await
    }

    pub async fn idle_since_at(&self, user_id: i64, now: DateTime<Utc>) -> Result<Option<Duration>> {
        let user = self.users.find_by_id(user_id).await?;
        Ok(user.map(|u| elapsed_since(u.get_last_activity_at(), now)))
    }

    /// Users holding a credential whose last activity is older than `cutoff`.
    pub async fn idle_assigned_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<UserDbModel>> {
        self.users.find_idle_assigned(cutoff).await
    }
}
