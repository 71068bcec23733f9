//! Database models.
//!
//! These models map directly to the database schema.

pub mod credential;
pub mod subscription;
pub mod user;

pub use credential::*;
pub use subscription::*;
pub use user::*;
