//! # sra-session: Session Lifecycle for the SRA Operations Dashboard
//!
//! `sra-session` owns the client side of authentication for the Sentient Recon
//! Agent dashboard: who is signed in, whether their credentials are still good,
//! and which gated actions the UI should offer them.
//!
//! ## Overview
//!
//! A single [`SessionManager`] holds the session. It restores a persisted session
//! on startup (validating it with the backend first), signs users in, including
//! the second-factor step, keeps credentials fresh with a silent refresh, and
//! ends the session on logout, on hard expiry, on a rejected refresh or when any
//! request comes back 401. Consumers never reach into its state: they read
//! [`SessionSnapshot`]s from a watch channel and advisory [`Notice`]s from a
//! broadcast channel.
//!
//! ## Architecture
//!
//! - **Gateway** ([`gateway`]): the remote authentication service behind the
//!   [`AuthGateway`](gateway::AuthGateway) trait. [`HttpAuthGateway`](gateway::HttpAuthGateway)
//!   speaks the backend's JSON envelope over [reqwest](https://docs.rs/reqwest).
//! - **Transport** ([`transport`]): every outbound request. Attaches the bearer
//!   credential and turns 401/403/5xx responses into session signals and notices.
//! - **Store** ([`store`]): obfuscated, namespaced persistence of the identity and
//!   both credentials, written and cleared as a group.
//! - **Permissions** ([`auth::permissions`]): exact `(resource, action)` checks
//!   against the user's direct and role grants.
//!
//! The manager and transport never call each other. They share a
//! [`SessionLink`](transport::SessionLink): the manager publishes the access
//! credential into it, the transport reports 401s back through it.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use sra_session::{Config, SessionClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = sra_session::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     sra_session::telemetry::init_telemetry()?;
//!
//!     let client = SessionClient::new(&config);
//!     let session = client.manager();
//!     if !session.bootstrap().await.session_valid() {
//!         session.login("analyst", "correct horse", None).await?;
//!     }
//!
//!     if session.check("missions", "execute") {
//!         client.transport().post_json("/api/missions/7/execute", &serde_json::json!({})).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod auth;
pub mod config;
mod crypto;
pub mod errors;
pub mod gateway;
pub mod notifications;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

pub use auth::manager::SessionManager;
pub use auth::session::{LoginResult, SessionPhase, SessionSnapshot};
pub use config::Config;
pub use errors::{Error, Result};
pub use notifications::Notice;

use gateway::HttpAuthGateway;
use notifications::NoticeBus;
use store::AuthStore;
use transport::{SessionLink, Transport};

/// A session manager wired to the HTTP backend, plus the transport that
/// application requests should go through.
pub struct SessionClient {
    manager: SessionManager,
    transport: Transport,
}

impl SessionClient {
    /// Build the client described by `config`. Must be called within a Tokio runtime.
    pub fn new(config: &Config) -> Self {
        let (link, signals) = SessionLink::new(NoticeBus::new());
        let transport = Transport::new(&config.gateway, link.clone());
        let gateway = Arc::new(HttpAuthGateway::new(transport.clone(), &config.gateway));
        let store = AuthStore::from_config(&config.storage);
        let manager = SessionManager::new(gateway, store, config.session.clone(), link, signals);

        Self { manager, transport }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}
