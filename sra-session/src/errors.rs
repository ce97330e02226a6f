use crate::store::StoreError;
use crate::types::Permission;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The gateway rejected the username/password or the second-factor code
    #[error("Invalid credentials")]
    InvalidCredentials { message: Option<String> },

    /// Password accepted, a second factor is needed before a session is issued
    #[error("Second factor required")]
    SecondFactorRequired,

    /// The authentication service could not be reached or failed server-side
    #[error("Authentication service unavailable: {message}")]
    NetworkUnavailable { message: String },

    /// The access credential is no longer accepted
    #[error("Access token expired")]
    TokenExpired,

    /// The refresh credential was rejected, the user has to sign in again
    #[error("Refresh rejected: {message}")]
    RefreshRejected { message: String },

    /// Reading or writing the local store failed
    #[error(transparent)]
    PersistenceFailure(#[from] StoreError),

    /// Login attempted while a session is already active
    #[error("Already authenticated")]
    AlreadyAuthenticated,

    /// Lifecycle operation attempted before `bootstrap()` was started
    #[error("Session has not been bootstrapped")]
    BootstrapPending,

    /// Operation requires an authenticated session
    #[error("Not authenticated")]
    Unauthenticated,

    /// User lacks required permission for the operation
    #[error("Insufficient permissions to {required}")]
    InsufficientPermissions { required: Permission },

    /// Generic internal failure
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

impl Error {
    /// Returns true when the user has to go back through the sign-in flow.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Error::TokenExpired | Error::RefreshRejected { .. } | Error::Unauthenticated
        )
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidCredentials { message } => message.clone().unwrap_or_else(|| "Invalid username or password".to_string()),
            Error::SecondFactorRequired => "Enter the verification code from your authenticator".to_string(),
            Error::NetworkUnavailable { .. } => "Unable to reach the authentication service. Please try again.".to_string(),
            Error::TokenExpired => "Your session has expired. Please sign in again.".to_string(),
            Error::RefreshRejected { .. } => "Your session could not be renewed. Please sign in again.".to_string(),
            Error::PersistenceFailure(_) => "Your session will not be remembered after reload".to_string(),
            Error::AlreadyAuthenticated => "You are already signed in".to_string(),
            Error::BootstrapPending => "Session is still loading".to_string(),
            Error::Unauthenticated => "Authentication required".to_string(),
            Error::InsufficientPermissions { required } => format!("Insufficient permissions to {required}"),
            Error::Internal { .. } => "Internal error".to_string(),
        }
    }
}

/// Type alias for session operation results
pub type Result<T> = std::result::Result<T, Error>;
