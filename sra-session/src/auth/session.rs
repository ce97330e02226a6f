//! Session state observed by the rest of the application.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Error, Result};
use crate::types::User;

/// Lifecycle phase of the session.
///
/// ```text
/// Uninitialized -> Restoring -> { Unauthenticated, Authenticated, MfaPending }
/// Authenticated -> Refreshing -> { Authenticated, Unauthenticated }
/// Authenticated -> Expired -> Unauthenticated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Restoring,
    Unauthenticated,
    MfaPending,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionPhase {
    /// Phases in which the session holds a validated user and credentials.
    pub fn is_valid(&self) -> bool {
        matches!(self, SessionPhase::Authenticated | SessionPhase::Refreshing)
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Restoring => "restoring",
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::MfaPending => "mfa_pending",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Refreshing => "refreshing",
            SessionPhase::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Access and refresh credentials. Always handled as a pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Point-in-time view of the session, as broadcast to subscribers.
///
/// Credentials are deliberately absent; outbound requests get them through the
/// transport, not through UI state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub user: Option<User>,
}

impl SessionSnapshot {
    pub fn new(phase: SessionPhase, user: Option<User>) -> Self {
        Self { phase, user }
    }

    /// True while persisted state is being validated. Permission checks are not
    /// meaningful until this turns false.
    pub fn loading(&self) -> bool {
        matches!(self.phase, SessionPhase::Uninitialized | SessionPhase::Restoring)
    }

    pub fn session_valid(&self) -> bool {
        self.phase.is_valid()
    }

    pub fn mfa_pending(&self) -> bool {
        self.phase == SessionPhase::MfaPending
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::new(SessionPhase::Uninitialized, None)
    }
}

/// Outcome of a successful `login` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResult {
    Authenticated(User),
    SecondFactorRequired,
}

impl LoginResult {
    /// The signed-in user, or `Error::SecondFactorRequired` when the gateway is
    /// still waiting for a verification code.
    pub fn into_user(self) -> Result<User> {
        match self {
            LoginResult::Authenticated(user) => Ok(user),
            LoginResult::SecondFactorRequired => Err(Error::SecondFactorRequired),
        }
    }
}
