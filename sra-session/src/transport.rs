//! Outbound request interception.
//!
//! Every request the dashboard sends goes through [`Transport`], which attaches
//! the session's access credential as a bearer token and reacts to the response
//! class before handing the response back unchanged:
//!
//! | status | reaction |
//! |---|---|
//! | 401 | signal the session manager to end the session (no refresh-and-retry) |
//! | 403 | [`Notice::PermissionDenied`] |
//! | 5xx | [`Notice::ServerError`] |
//!
//! The transport never calls into the session manager directly. It shares a
//! [`SessionLink`] with it: the manager publishes the current access credential
//! into the link, and the transport sends [`TransportSignal`]s back over a
//! channel that the manager drains.

use parking_lot::RwLock;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use url::Url;

use crate::config::GatewayConfig;
use crate::errors::{Error, Result};
use crate::notifications::{Notice, NoticeBus};

/// Reports from the transport to the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// A request carrying `credential` was answered with 401
    Unauthorized { credential: Option<String> },
}

/// State shared between the session manager and the transport.
#[derive(Debug, Clone)]
pub struct SessionLink {
    access_token: Arc<RwLock<Option<String>>>,
    signals: mpsc::UnboundedSender<TransportSignal>,
    notices: NoticeBus,
}

impl SessionLink {
    /// Create a link and the receiving end of its signal channel.
    pub fn new(notices: NoticeBus) -> (Self, mpsc::UnboundedReceiver<TransportSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let link = Self {
            access_token: Arc::new(RwLock::new(None)),
            signals,
            notices,
        };
        (link, receiver)
    }

    pub fn access_token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    pub(crate) fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    pub fn notices(&self) -> &NoticeBus {
        &self.notices
    }

    fn signal(&self, signal: TransportSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Session manager is gone, dropping transport signal");
        }
    }
}

/// Which bearer credential a request carries.
#[derive(Debug, Clone, Copy)]
pub enum Bearer<'a> {
    /// Whatever the session currently holds, if anything
    Session,
    /// A specific token, regardless of session state
    Explicit(&'a str),
    None,
}

/// Makes sure a url has a trailing slash, so that `join` appends rather than replaces
/// the last path segment.
fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
    link: SessionLink,
}

impl Transport {
    pub fn new(config: &GatewayConfig, link: SessionLink) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: config.base_url.clone(),
            request_timeout: config.request_timeout,
            link,
        }
    }

    pub fn link(&self) -> &SessionLink {
        &self.link
    }

    fn url(&self, path: &str) -> Result<Url> {
        ensure_slash(&self.base_url)
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Internal {
                operation: format!("construct URL for {path}: {e}"),
            })
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.send::<()>(Method::GET, path, None, Bearer::Session).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(Method::POST, path, Some(body), Bearer::Session).await
    }

    pub async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(Method::PUT, path, Some(body), Bearer::Session).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response> {
        self.send::<()>(Method::DELETE, path, None, Bearer::Session).await
    }

    /// Send a request and apply the interception rules to its response.
    ///
    /// Connection failures and timeouts are `Error::NetworkUnavailable`. Any HTTP
    /// response, successful or not, is returned to the caller after interception.
    #[instrument(skip(self, body, bearer))]
    pub async fn send<B: Serialize + ?Sized>(&self, method: Method, path: &str, body: Option<&B>, bearer: Bearer<'_>) -> Result<Response> {
        let url = self.url(path)?;
        let credential = match bearer {
            Bearer::Session => self.link.access_token(),
            Bearer::Explicit(token) => Some(token.to_string()),
            Bearer::None => None,
        };

        let mut request = self.client.request(method, url).timeout(self.request_timeout);
        if let Some(token) = &credential {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| Error::NetworkUnavailable {
            message: format!("{path}: {e}"),
        })?;

        self.intercept(path, response.status(), credential);
        Ok(response)
    }

    fn intercept(&self, path: &str, status: StatusCode, credential: Option<String>) {
        if status == StatusCode::UNAUTHORIZED {
            debug!(path, "Request was unauthorized, signalling session manager");
            self.link.signal(TransportSignal::Unauthorized { credential });
        } else if status == StatusCode::FORBIDDEN {
            self.link.notices.emit(Notice::PermissionDenied { path: path.to_string() });
        } else if status.is_server_error() {
            self.link.notices.emit(Notice::ServerError {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
    }
}
