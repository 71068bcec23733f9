//! Shared credential management.
//!
//! - [`CredentialPool`]: assigns and releases credentials under the
//!   per-credential capacity limit
//! - [`Assignment`] / [`AssignmentResult`]: what a user was given
//! - [`CredentialUsage`]: per-credential load for observability

mod pool;
mod types;

pub use pool::CredentialPool;
pub use types::{Assignment, AssignmentResult, AssignmentStatus, CredentialUsage};
