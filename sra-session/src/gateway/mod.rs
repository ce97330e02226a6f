//! The remote authentication service, as seen by the session manager.
//!
//! [`AuthGateway`] is the seam between session lifecycle logic and the network.
//! [`http::HttpAuthGateway`] talks to the SRA backend through the
//! [`Transport`](crate::transport::Transport); tests script their own
//! implementation in [`crate::test_utils`].

pub mod http;

use async_trait::async_trait;

use crate::auth::session::Credentials;
use crate::errors::Result;
use crate::types::User;

pub use http::HttpAuthGateway;

/// What a `login` call yielded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated { user: User, credentials: Credentials },
    SecondFactorRequired,
}

#[async_trait]
pub trait AuthGateway: Send + Sync {
    /// Exchange username/password (and optional second-factor code) for a session.
    ///
    /// Rejected credentials are `Error::InvalidCredentials`, unreachable service is
    /// `Error::NetworkUnavailable`.
    async fn login(&self, username: &str, password: &str, mfa_code: Option<&str>) -> Result<LoginOutcome>;

    /// Revoke `access_token` server-side.
    async fn logout(&self, access_token: &str) -> Result<()>;

    /// Whether the server still accepts `access_token`.
    async fn validate_token(&self, access_token: &str) -> Result<bool>;

    /// Mint a new credential pair from `refresh_token`.
    ///
    /// An expired refresh credential is `Error::TokenExpired`. One refused for any
    /// other reason is `Error::RefreshRejected`.
    async fn refresh_token(&self, refresh_token: &str) -> Result<Credentials>;
}
