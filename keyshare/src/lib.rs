//! keyshare library crate.
//!
//! Shares a small set of upstream API credentials among many users under a
//! per-credential capacity, and tracks each user's trial, subscription and
//! referral entitlements.

pub mod activity;
pub mod config;
pub mod credentials;
pub mod database;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod logging;
pub mod reclaim;
pub mod referral;

pub use engine::{Engine, ProfileHints};
pub use error::{Error, Result};
