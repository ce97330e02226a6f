//! Advisory notices for the UI.
//!
//! Notices are informational: a toast, a banner, a redirect hint. They never carry
//! state on their own; the authoritative session state is the snapshot published
//! by the session manager. Every notice is also logged, so a notice with no
//! listening UI still leaves a trace.

use std::time::Duration;
use tokio::sync::broadcast;

const NOTICE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The hard session cutoff is approaching
    ExpiryWarning { remaining: Duration },
    /// The session reached its maximum lifetime and was ended
    SessionExpired { sign_in_route: String },
    /// The session ended involuntarily (401, rejected refresh); send the user to sign in
    SignInRequired { sign_in_route: String },
    /// The server refused an action the user is not allowed to perform
    PermissionDenied { path: String },
    /// The server failed to handle a request
    ServerError { status: u16, path: String },
    /// Session data could not be persisted; it will not survive a reload
    PersistenceFailure { message: String },
}

impl Notice {
    /// Text suitable for a toast.
    pub fn message(&self) -> String {
        match self {
            Notice::ExpiryWarning { remaining } => {
                let minutes = remaining.as_secs().div_ceil(60);
                format!("Your session will expire in {minutes} minute(s). Save your work.")
            }
            Notice::SessionExpired { .. } => "Your session has expired. Please sign in again.".to_string(),
            Notice::SignInRequired { .. } => "Please sign in to continue.".to_string(),
            Notice::PermissionDenied { .. } => "You do not have permission to perform this action.".to_string(),
            Notice::ServerError { .. } => "The server encountered an error. Please try again later.".to_string(),
            Notice::PersistenceFailure { .. } => "Your session could not be saved and will end when this page is closed.".to_string(),
        }
    }
}

/// Fan-out of notices to any number of subscribers.
#[derive(Debug, Clone)]
pub struct NoticeBus {
    sender: broadcast::Sender<Notice>,
}

impl NoticeBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.sender.subscribe()
    }

    pub fn emit(&self, notice: Notice) {
        match &notice {
            Notice::ExpiryWarning { remaining } => {
                tracing::info!(remaining = ?remaining, "Session expiry warning");
            }
            Notice::SessionExpired { .. } => tracing::info!("Session expired"),
            Notice::SignInRequired { sign_in_route } => {
                tracing::info!(sign_in_route = %sign_in_route, "Sign-in required");
            }
            Notice::PermissionDenied { path } => tracing::warn!(path = %path, "Permission denied by server"),
            Notice::ServerError { status, path } => tracing::warn!(status, path = %path, "Server error"),
            Notice::PersistenceFailure { message } => tracing::warn!(message = %message, "Session persistence failed"),
        }
        // No receivers is fine: the notice has been logged.
        let _ = self.sender.send(notice);
    }
}

impl Default for NoticeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notices_reach_every_subscriber() {
        let bus = NoticeBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(Notice::PermissionDenied {
            path: "/api/missions".to_string(),
        });

        let expected = Notice::PermissionDenied {
            path: "/api/missions".to_string(),
        };
        assert_eq!(first.recv().await.unwrap(), expected);
        assert_eq!(second.recv().await.unwrap(), expected);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        NoticeBus::new().emit(Notice::ServerError {
            status: 502,
            path: "/api/threats".to_string(),
        });
    }

    #[test]
    fn test_expiry_warning_message_rounds_up() {
        let notice = Notice::ExpiryWarning {
            remaining: Duration::from_secs(4 * 60 + 1),
        };
        assert!(notice.message().contains("5 minute"));
    }
}
