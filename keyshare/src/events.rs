//! Engine events.
//!
//! Broadcast to collaborators (the messaging layer) so they can react to pool
//! and entitlement changes, e.g. notify a referrer that someone they invited
//! has joined.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Events emitted by the engine after a state change has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A user received a credential they did not hold before.
    CredentialAssigned { user_id: i64, credential_id: String },
    /// A user's credential was released (idle reclaim).
    CredentialReleased { user_id: i64 },
    /// An operator (de)activated a credential.
    CredentialStateChanged { credential_id: String, active: bool },
    /// A user activated their one-time trial.
    TrialActivated { user_id: i64 },
    /// A subscription was created or extended.
    SubscriptionRenewed {
        user_id: i64,
        subscription_id: String,
        end_at: DateTime<Utc>,
    },
    /// A referred user received the referral grant.
    ///
    /// The referrer gets no credit from the engine; this event only lets the
    /// messaging layer tell them about it.
    ReferralGranted { new_user_id: i64, referrer_id: i64 },
}

impl EngineEvent {
    pub fn description(&self) -> String {
        match self {
            Self::CredentialAssigned {
                user_id,
                credential_id,
            } => format!("Credential {} assigned to user {}", credential_id, user_id),
            Self::CredentialReleased { user_id } => {
                format!("Credential released from user {}", user_id)
            }
            Self::CredentialStateChanged {
                credential_id,
                active,
            } => format!("Credential {} active={}", credential_id, active),
            Self::TrialActivated { user_id } => format!("Trial activated for user {}", user_id),
            Self::SubscriptionRenewed {
                user_id, end_at, ..
            } => format!("Subscription of user {} now ends at {}", user_id, end_at),
            Self::ReferralGranted {
                new_user_id,
                referrer_id,
            } => format!(
                "Referral grant for user {} (referred by {})",
                new_user_id, referrer_id
            ),
        }
    }
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EngineEventBroadcaster {
    sender: broadcast::Sender<EngineEvent>,
}

impl EngineEventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) -> usize {
        tracing::debug!("Publishing engine event: {}", event.description());
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EngineEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
