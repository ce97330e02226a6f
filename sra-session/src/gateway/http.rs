//! [`AuthGateway`] over the SRA backend's HTTP API.
//!
//! Successful responses use the backend's envelope:
//!
//! ```json
//! { "success": true, "data": { ... }, "timestamp": "2026-10-17T09:30:00Z" }
//! ```
//!
//! Errors carry a `detail` (or `message`) string that is surfaced to the user for
//! credential failures.
//!
//! Status mapping: 400, 401 and 403 on login are credential failures. 429 and
//! 5xx mean the service cannot take the request right now. Any other status is
//! an unexpected response. On refresh, 401 means the refresh credential has
//! expired and other 4xx mean it was refused.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{AuthGateway, LoginOutcome};
use crate::auth::session::Credentials;
use crate::config::GatewayConfig;
use crate::errors::{Error, Result};
use crate::transport::{Bearer, Transport};
use crate::types::User;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    #[serde(default)]
    mfa_required: bool,
    user: Option<User>,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateData {
    valid: bool,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    access_token: String,
    refresh_token: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mfa_code: Option<&'a str>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

pub struct HttpAuthGateway {
    transport: Transport,
    login_path: String,
    logout_path: String,
    validate_path: String,
    refresh_path: String,
}

impl HttpAuthGateway {
    pub fn new(transport: Transport, config: &GatewayConfig) -> Self {
        Self {
            transport,
            login_path: config.login_path.clone(),
            logout_path: config.logout_path.clone(),
            validate_path: config.validate_path.clone(),
            refresh_path: config.refresh_path.clone(),
        }
    }
}

/// Pull the user-facing error text out of a failed response.
async fn error_detail(response: Response) -> Option<String> {
    let body = response.text().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    parsed.detail.or(parsed.message)
}

/// Decode the `data` field of a successful envelope.
async fn envelope_data<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T> {
    let body = response.text().await.map_err(|e| Error::NetworkUnavailable {
        message: format!("read {operation} response: {e}"),
    })?;
    let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| Error::Internal {
        operation: format!("decode {operation} response: {e}"),
    })?;
    envelope.data.ok_or_else(|| Error::Internal {
        operation: format!("decode {operation} response: missing data"),
    })
}

fn server_failure(operation: &str, status: StatusCode) -> Error {
    Error::NetworkUnavailable {
        message: format!("{operation} returned {status}"),
    }
}

#[async_trait]
impl AuthGateway for HttpAuthGateway {
    #[instrument(skip(self, password, mfa_code), fields(with_mfa_code = mfa_code.is_some()))]
    async fn login(&self, username: &str, password: &str, mfa_code: Option<&str>) -> Result<LoginOutcome> {
        let body = LoginRequest {
            username,
            password,
            mfa_code,
        };
        let response = self.transport.send(Method::POST, &self.login_path, Some(&body), Bearer::None).await?;
        let status = response.status();

        match status {
            s if s.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let message = error_detail(response).await;
                debug!(%status, "Login rejected");
                return Err(Error::InvalidCredentials { message });
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let detail = error_detail(response).await.unwrap_or_else(|| status.to_string());
                warn!("Login rate limited");
                return Err(Error::NetworkUnavailable {
                    message: format!("login rate limited: {detail}"),
                });
            }
            s if s.is_server_error() => return Err(server_failure("login", status)),
            _ => {
                return Err(Error::Internal {
                    operation: format!("sign in: server returned {status}"),
                });
            }
        }

        let data: LoginData = envelope_data(response, "login").await?;
        if data.mfa_required {
            return Ok(LoginOutcome::SecondFactorRequired);
        }
        match (data.user, data.access_token, data.refresh_token) {
            (Some(user), Some(access_token), Some(refresh_token)) => Ok(LoginOutcome::Authenticated {
                user,
                credentials: Credentials {
                    access_token,
                    refresh_token,
                },
            }),
            _ => Err(Error::Internal {
                operation: "decode login response: incomplete session".to_string(),
            }),
        }
    }

    #[instrument(skip_all)]
    async fn logout(&self, access_token: &str) -> Result<()> {
        let body = TokenRequest { token: access_token };
        let response = self
            .transport
            .send(Method::POST, &self.logout_path, Some(&body), Bearer::Explicit(access_token))
            .await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(server_failure("logout", status))
        } else {
            Err(Error::Internal {
                operation: format!("revoke session: server returned {status}"),
            })
        }
    }

    #[instrument(skip_all)]
    async fn validate_token(&self, access_token: &str) -> Result<bool> {
        let body = TokenRequest { token: access_token };
        let response = self
            .transport
            .send(Method::POST, &self.validate_path, Some(&body), Bearer::Explicit(access_token))
            .await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(server_failure("validate", status));
        }
        if !status.is_success() {
            debug!(%status, "Token rejected by validation endpoint");
            return Ok(false);
        }

        let data: ValidateData = envelope_data(response, "validate").await?;
        Ok(data.valid)
    }

    #[instrument(skip_all)]
    async fn refresh_token(&self, refresh_token: &str) -> Result<Credentials> {
        let body = RefreshRequest { refresh_token };
        let response = self.transport.send(Method::POST, &self.refresh_path, Some(&body), Bearer::None).await?;
        let status = response.status();

        if status.is_server_error() {
            return Err(server_failure("refresh", status));
        }
        if status == StatusCode::UNAUTHORIZED {
            warn!("Refresh credential expired");
            return Err(Error::TokenExpired);
        }
        if !status.is_success() {
            let message = error_detail(response).await.unwrap_or_else(|| format!("server returned {status}"));
            warn!(%status, "Refresh credential rejected");
            return Err(Error::RefreshRejected { message });
        }

        let data: TokenData = envelope_data(response, "refresh").await?;
        Ok(Credentials {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        })
    }
}
