//! Credential pool result types.

use serde::{Deserialize, Serialize};

/// How an assignment request was resolved.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// The user received a credential they did not hold before.
    Assigned,
    /// The user already held an active credential.
    Existing,
    /// No active credential has a free slot.
    LimitExceeded,
}

/// A credential held by a user.
#[derive(Clone, PartialEq, Eq)]
pub struct Assignment {
    pub credential_id: String,
    pub secret: String,
    /// `Assigned` or `Existing`.
    pub status: AssignmentStatus,
}

impl std::fmt::Debug for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assignment")
            .field("credential_id", &self.credential_id)
            .field("secret", &"<redacted>")
            .field("status", &self.status)
            .finish()
    }
}

/// Outcome of `assign_or_get_credential`, shaped for the messaging layer.
///
/// `credential_id` and `secret` are `None` exactly when the status is
/// `LimitExceeded`.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentResult {
    pub credential_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub status: AssignmentStatus,
}

impl AssignmentResult {
    pub fn limit_exceeded() -> Self {
        Self {
            credential_id: None,
            secret: None,
            status: AssignmentStatus::LimitExceeded,
        }
    }

    pub fn has_credential(&self) -> bool {
        self.secret.is_some()
    }
}

impl From<Assignment> for AssignmentResult {
    fn from(assignment: Assignment) -> Self {
        Self {
            credential_id: Some(assignment.credential_id),
            secret: Some(assignment.secret),
            status: assignment.status,
        }
    }
}

impl std::fmt::Debug for AssignmentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentResult")
            .field("credential_id", &self.credential_id)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("status", &self.status)
            .finish()
    }
}

/// Usage of one credential, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub credential_id: String,
    pub active: bool,
    pub assigned_count: u32,
    pub capacity: u32,
}

impl CredentialUsage {
    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.assigned_count)
    }

    /// Whether the credential can take another user right now.
    pub fn has_free_slot(&self) -> bool {
        self.active && self.assigned_count < self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(AssignmentStatus::LimitExceeded.to_string(), "limit_exceeded");
        assert_eq!(
            "existing".parse::<AssignmentStatus>().unwrap(),
            AssignmentStatus::Existing
        );
    }

    #[test]
    fn test_result_debug_redacts_secret() {
        let result = AssignmentResult::from(Assignment {
            credential_id: "c1".to_string(),
            secret: "top-secret".to_string(),
            status: AssignmentStatus::Assigned,
        });
        assert!(result.has_credential());
        let debug = format!("{:?}", result);
        assert!(!debug.contains("top-secret"));

        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("top-secret"));
        assert!(json.contains("\"assigned\""));
    }

    #[test]
    fn test_limit_exceeded_has_no_credential() {
        let result = AssignmentResult::limit_exceeded();
        assert!(!result.has_credential());
        assert!(result.credential_id.is_none());
    }

    #[test]
    fn test_usage_slots() {
        let usage = CredentialUsage {
            credential_id: "c1".to_string(),
            active: true,
            assigned_count: 5,
            capacity: 5,
        };
        assert_eq!(usage.free_slots(), 0);
        assert!(!usage.has_free_slot());

        let inactive = CredentialUsage {
            active: false,
            assigned_count: 0,
            ..usage
        };
        assert_eq!(inactive.free_slots(), 5);
        assert!(!inactive.has_free_slot());
    }
}
