//! Repository layer for database access.
//!
//! Plain lookups and single-statement writes go through the `*Repository`
//! traits. Multi-step read-then-write sequences use the `*TxOps` helpers inside
//! an immediate transaction on the write pool.

pub mod credential;
pub mod credential_tx;
pub mod subscription;
pub mod subscription_tx;
pub mod user;
pub mod user_tx;

pub use credential::*;
pub use credential_tx::*;
pub use subscription::*;
pub use subscription_tx::*;
pub use user::*;
pub use user_tx::*;
