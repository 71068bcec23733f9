//! Credential database model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A shared upstream API credential.
///
/// The number of users holding a credential is never stored here; it is
/// always counted from `users.assigned_credential_id`.
#[derive(Clone, FromRow, Serialize, Deserialize)]
pub struct CredentialDbModel {
    /// Unique identifier (UUID)
    pub id: String,
    /// The upstream API key
    pub secret: String,
    /// Whether the credential may receive new assignments
    pub is_active: bool,
    /// Unix epoch milliseconds (UTC) when the credential was provisioned.
    pub created_at: i64,
    /// Unix epoch milliseconds (UTC) of the last (de)activation.
    pub updated_at: i64,
}

impl CredentialDbModel {
    /// Create a new active credential for the given secret.
    pub fn new(secret: impl Into<String>, now: DateTime<Utc>) -> Self {
        let now_ms = now.timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret: secret.into(),
            is_active: true,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Secret with everything but the last four characters masked.
    pub fn masked_secret(&self) -> String {
        let chars: Vec<char> = self.secret.chars().collect();
        let visible = chars.len().saturating_sub(4);
        chars
            .iter()
            .enumerate()
            .map(|(i, c)| if i < visible { '*' } else { *c })
            .collect()
    }
}

// Hand-written so secrets never end up in logs.
impl std::fmt::Debug for CredentialDbModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialDbModel")
            .field("id", &self.id)
            .field("secret", &self.masked_secret())
            .field("is_active", &self.is_active)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Per-credential usage row, computed by counting referencing users.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CredentialUsageRow {
    pub id: String,
    pub is_active: bool,
    pub assigned_count: i64,
}
