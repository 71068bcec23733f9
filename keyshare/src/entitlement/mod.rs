//! User entitlements: the one-time trial, paid subscriptions and referral grants.

mod ledger;
mod types;

pub use ledger::{EntitlementLedger, LedgerDurations};
pub use types::{EntitlementSource, EntitlementStatus, TrialStatus};
