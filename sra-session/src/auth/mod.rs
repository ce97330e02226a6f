//! Session authentication and authorization.
//!
//! - [`manager`]: the [`SessionManager`](manager::SessionManager), which owns the
//!   session lifecycle (bootstrap, login, refresh, logout, timers)
//! - [`session`]: the phase machine and the snapshot type observed by consumers
//! - [`permissions`]: UI-side permission checks and the catalogue of gated actions

pub mod manager;
pub mod permissions;
pub mod session;
