//! Test utilities (available with the `test-utils` feature).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::auth::manager::SessionManager;
use crate::auth::permissions::catalog;
use crate::auth::session::Credentials;
use crate::config::SessionConfig;
use crate::errors::{Error, Result};
use crate::gateway::{AuthGateway, LoginOutcome};
use crate::notifications::NoticeBus;
use crate::store::{AuthStore, MemoryBackend, SecureStore, StorageBackend, StoreError};
use crate::transport::SessionLink;
use crate::types::{Role, User, UserStatus};

/// An active analyst who can read threats and incidents.
pub fn sample_user(username: &str) -> User {
    User {
        id: Uuid::new_v4(),
        username: username.to_string(),
        email: format!("{username}@sra.local"),
        role: Role::new("analyst", [catalog::threats_read(), catalog::incidents_read()]),
        permissions: Default::default(),
        mfa_enabled: false,
        status: UserStatus::Active,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    Succeed,
    Reject,
    NetworkError,
}

/// Scripted [`AuthGateway`] with call counters.
///
/// Accepts one user with one password, optionally behind a second-factor code.
/// Every issued credential pair is numbered: `access-1`/`refresh-1`, then
/// `access-2`/`refresh-2` and so on, across logins and refreshes.
pub struct MockGateway {
    user: User,
    password: String,
    mfa_code: Option<String>,
    validate: Mutex<Result<bool>>,
    refresh: Mutex<RefreshBehavior>,
    fail_logout: AtomicBool,
    refresh_delay: Duration,
    validate_delay: Duration,
    issued: AtomicUsize,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new(user: User, password: &str) -> Self {
        Self {
            user,
            password: password.to_string(),
            mfa_code: None,
            validate: Mutex::new(Ok(true)),
            refresh: Mutex::new(RefreshBehavior::Succeed),
            fail_logout: AtomicBool::new(false),
            refresh_delay: Duration::ZERO,
            validate_delay: Duration::ZERO,
            issued: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_mfa_code(mut self, code: &str) -> Self {
        self.mfa_code = Some(code.to_string());
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_validate_delay(mut self, delay: Duration) -> Self {
        self.validate_delay = delay;
        self
    }

    pub fn set_validate(&self, result: Result<bool>) {
        *self.validate.lock() = result;
    }

    pub fn set_refresh(&self, behavior: RefreshBehavior) {
        *self.refresh.lock() = behavior;
    }

    pub fn fail_logout(&self) {
        self.fail_logout.store(true, Ordering::SeqCst);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn issue(&self) -> Credentials {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Credentials {
            access_token: format!("access-{n}"),
            refresh_token: format!("refresh-{n}"),
        }
    }
}

#[async_trait]
impl AuthGateway for MockGateway {
    async fn login(&self, username: &str, password: &str, mfa_code: Option<&str>) -> Result<LoginOutcome> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if username != self.user.username || password != self.password {
            return Err(Error::InvalidCredentials {
                message: Some("Invalid username or password".to_string()),
            });
        }
        match (&self.mfa_code, mfa_code) {
            (Some(_), None) => return Ok(LoginOutcome::SecondFactorRequired),
            (Some(expected), Some(given)) if expected != given => {
                return Err(Error::InvalidCredentials {
                    message: Some("Invalid MFA code".to_string()),
                });
            }
            _ => {}
        }
        Ok(LoginOutcome::Authenticated {
            user: self.user.clone(),
            credentials: self.issue(),
        })
    }

    async fn logout(&self, _access_token: &str) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(Error::NetworkUnavailable {
                message: "logout endpoint unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn validate_token(&self, _access_token: &str) -> Result<bool> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.validate_delay.is_zero() {
            tokio::time::sleep(self.validate_delay).await;
        }
        self.validate.lock().clone()
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<Credentials> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let behavior = *self.refresh.lock();
        match behavior {
            RefreshBehavior::Succeed => Ok(self.issue()),
            RefreshBehavior::Reject => Err(Error::RefreshRejected {
                message: "Refresh token expired".to_string(),
            }),
            RefreshBehavior::NetworkError => Err(Error::NetworkUnavailable {
                message: "refresh endpoint unreachable".to_string(),
            }),
        }
    }
}

/// In-memory backend that fails writes to one key, or every removal, on demand.
#[derive(Default)]
pub struct FailingBackend {
    pub inner: MemoryBackend,
    fail_key: Option<String>,
    fail_removes: AtomicBool,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write to the raw (namespaced) `key`.
    pub fn failing_writes_to(mut self, key: &str) -> Self {
        self.fail_key = Some(key.to_string());
        self
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }
}

impl StorageBackend for FailingBackend {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> std::result::Result<(), StoreError> {
        if self.fail_key.as_deref() == Some(key) {
            return Err(StoreError::Io {
                operation: "set".to_string(),
                message: "quota exceeded".to_string(),
            });
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StoreError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                operation: "remove".to_string(),
                message: "storage is read-only".to_string(),
            });
        }
        self.inner.remove(key)
    }
}

/// An [`AuthStore`] over `backend` with the default namespace and key.
pub fn store_over(backend: Arc<dyn StorageBackend>) -> AuthStore {
    AuthStore::new(SecureStore::new(backend, "sra_", "sra-dashboard"))
}

/// A manager over `gateway` with an in-memory store and default timings.
pub fn manager_with(gateway: Arc<MockGateway>) -> (SessionManager, AuthStore) {
    manager_with_store(gateway, AuthStore::in_memory())
}

pub fn manager_with_store(gateway: Arc<MockGateway>, store: AuthStore) -> (SessionManager, AuthStore) {
    build(gateway, store, SessionConfig::default())
}

pub fn manager_with_config(gateway: Arc<MockGateway>, config: SessionConfig) -> (SessionManager, AuthStore) {
    build(gateway, AuthStore::in_memory(), config)
}

fn build(gateway: Arc<MockGateway>, store: AuthStore, config: SessionConfig) -> (SessionManager, AuthStore) {
    let (link, signals) = SessionLink::new(NoticeBus::new());
    let manager = SessionManager::new(gateway, store.clone(), config, link, signals);
    (manager, store)
}
