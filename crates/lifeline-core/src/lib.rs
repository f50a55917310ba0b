#![allow(clippy::doc_markdown)]

//! lifeline-core - emergency lifecycle model for LifeLine.
//!
//! This crate holds everything about an emergency that does not depend on a
//! transport or a runtime layout:
//!
//! - [`emergency`]: the `Emergency` aggregate, its state machine, creation
//!   drafts and the error type shared by lifecycle operations.
//! - [`dispatch`]: pure policy functions (priority, search radius, distance,
//!   severity).
//! - [`access`]: requester identity and the access gate.
//! - [`store`]: the record store contract with in-memory and `SQLite`
//!   implementations.
//! - [`geo`] and [`notify`]: collaborator contracts consumed by the
//!   lifecycle service, with reference implementations.
//! - [`config`]: TOML configuration.
//! - [`rate_limit`]: the sliding-window limiter the daemon applies per
//!   client.
//! - [`clock`]: injectable time source.

pub mod access;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod emergency;
pub mod geo;
pub mod notify;
pub mod rate_limit;
pub mod store;

pub use access::{Requester, Role, can_access};
pub use clock::{Clock, ManualClock, SystemClock};
pub use emergency::{Emergency, EmergencyError};
