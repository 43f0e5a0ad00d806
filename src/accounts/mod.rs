//! Provider account domain
//!
//! Account records, per-family repositories, the account state machine and
//! account groups. One account record holds the credentials for exactly one
//! upstream provider; everything secret is encrypted at rest through the
//! credential vault.

pub mod groups;
pub mod oauth;
pub mod record;
pub mod repo;
pub mod state;

pub use record::{Account, AccountKind, AccountStatus, Platform, ProxyConfig, RouteFamily};
