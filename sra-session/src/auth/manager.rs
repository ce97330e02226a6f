//! Session lifecycle manager.
//!
//! [`SessionManager`] is the single owner of the session: phase, user and
//! credentials live behind it, and every transition goes through it. Consumers
//! observe the session through [`SessionManager::subscribe`] (a watch channel of
//! [`SessionSnapshot`]s) and advisory [`Notice`]s through
//! [`SessionManager::notices`].
//!
//! ## Timers
//!
//! Two independent clocks run while a session is authenticated:
//!
//! - the *lifetime* clock, armed when a session is established (login or a
//!   successful bootstrap). It emits [`Notice::ExpiryWarning`] after
//!   `expiry_warning_after` and ends the session after `expiry_after`. A silent
//!   refresh does not reset it, so the cutoff is hard.
//! - the *cadence* clock, which calls [`SessionManager::refresh`] every
//!   `refresh_interval`. Each successful refresh re-arms it.
//!
//! Both clocks are cancelled whenever the session ends.
//!
//! ## Ending a session
//!
//! Logout, hard expiry, a rejected refresh and a 401 seen by the transport all
//! go through the same exit path. Local state and persisted entries are cleared
//! first; revoking the credential with the gateway is best effort and happens
//! afterwards. Each end bumps a generation counter, and results of gateway calls
//! started under an earlier generation are discarded when they arrive.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::permissions;
use super::session::{Credentials, LoginResult, SessionPhase, SessionSnapshot};
use crate::config::SessionConfig;
use crate::errors::{Error, Result};
use crate::gateway::{AuthGateway, LoginOutcome};
use crate::notifications::Notice;
use crate::store::{AuthStore, StoreError};
use crate::transport::{SessionLink, TransportSignal};
use crate::types::{Permission, User, UserUpdate, abbrev_uuid};

type SharedRefresh = Shared<BoxFuture<'static, Result<()>>>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Logout,
    Expired,
    RefreshFailed,
    Unauthorized,
}

struct SessionData {
    phase: SessionPhase,
    user: Option<User>,
    credentials: Option<Credentials>,
    generation: u64,
}

impl SessionData {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(self.phase, self.user.clone())
    }
}

#[derive(Default)]
struct Timers {
    lifetime: Option<CancellationToken>,
    cadence: Option<CancellationToken>,
}

impl Timers {
    fn cancel_all(&mut self) {
        for token in [self.lifetime.take(), self.cadence.take()].into_iter().flatten() {
            token.cancel();
        }
    }
}

struct Inner {
    gateway: Arc<dyn AuthGateway>,
    store: AuthStore,
    config: SessionConfig,
    link: SessionLink,
    data: Mutex<SessionData>,
    state: watch::Sender<SessionSnapshot>,
    refresh_in_flight: Mutex<Option<SharedRefresh>>,
    timers: Mutex<Timers>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to the session. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager in the `Uninitialized` phase and start listening for
    /// transport signals. Must be called within a Tokio runtime.
    pub fn new(
        gateway: Arc<dyn AuthGateway>,
        store: AuthStore,
        config: SessionConfig,
        link: SessionLink,
        signals: mpsc::UnboundedReceiver<TransportSignal>,
    ) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        let inner = Arc::new(Inner {
            gateway,
            store,
            config,
            link,
            data: Mutex::new(SessionData {
                phase: SessionPhase::Uninitialized,
                user: None,
                credentials: None,
                generation: 0,
            }),
            state,
            refresh_in_flight: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(listen_for_signals(Arc::downgrade(&inner), inner.shutdown.clone(), signals));

        Self { inner }
    }

    /// Restore a persisted session, if there is a valid one.
    ///
    /// Only the first call does any work; later calls return the current snapshot.
    pub async fn bootstrap(&self) -> SessionSnapshot {
        self.inner.bootstrap().await
    }

    pub async fn login(&self, username: &str, password: &str, mfa_code: Option<&str>) -> Result<LoginResult> {
        self.inner.login(username, password, mfa_code).await
    }

    /// End the session. Persisted entries and local state are always cleared,
    /// even if the gateway cannot be reached or no session is active.
    ///
    /// Returns `Error::PersistenceFailure` if persisted entries could not be
    /// removed. The in-memory session is ended regardless.
    pub async fn logout(&self) -> Result<()> {
        self.inner.ready().await?;
        self.inner.end_session(EndReason::Logout, None).await?;
        Ok(())
    }

    /// Exchange the refresh credential for a new pair.
    ///
    /// Concurrent calls share one gateway request and all observe its outcome.
    /// A failed refresh ends the session.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    /// Merge `update` into the current user and persist it. Returns the updated
    /// user, or `None` when there is no session.
    pub fn update_user(&self, update: UserUpdate) -> Option<User> {
        self.inner.update_user(update)
    }

    /// Whether the current user may perform `action` on `resource`.
    pub fn check(&self, resource: &str, action: &str) -> bool {
        permissions::check(self.inner.data.lock().user.as_ref(), resource, action)
    }

    pub fn require(&self, permission: &Permission) -> Result<()> {
        permissions::require(self.inner.data.lock().user.as_ref(), permission)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.link.notices().subscribe()
    }

    pub fn link(&self) -> &SessionLink {
        &self.inner.link
    }
}

async fn listen_for_signals(inner: Weak<Inner>, shutdown: CancellationToken, mut signals: mpsc::UnboundedReceiver<TransportSignal>) {
    loop {
        let signal = tokio::select! {
            _ = shutdown.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match signal {
            TransportSignal::Unauthorized { credential } => inner.handle_unauthorized(credential).await,
        }
    }
    debug!("Transport signal listener stopped");
}

impl Inner {
    fn publish(&self, data: &SessionData) {
        self.state.send_replace(data.snapshot());
    }

    fn persistence_failed(&self, err: StoreError) {
        warn!(error = %err, "Session persistence failed, continuing in memory");
        self.link.notices().emit(Notice::PersistenceFailure { message: err.to_string() });
    }

    /// Wait until bootstrap has finished restoring.
    async fn ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let phase = rx
            .wait_for(|snapshot| snapshot.phase != SessionPhase::Restoring)
            .await
            .map_err(|e| Error::Internal {
                operation: format!("wait for session bootstrap: {e}"),
            })?
            .phase;
        if phase == SessionPhase::Uninitialized {
            return Err(Error::BootstrapPending);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn bootstrap(self: &Arc<Self>) -> SessionSnapshot {
        {
            let mut data = self.data.lock();
            if data.phase != SessionPhase::Uninitialized {
                debug!(phase = %data.phase, "Session already bootstrapped");
                return data.snapshot();
            }
            data.phase = SessionPhase::Restoring;
            self.publish(&data);
        }

        let persisted = self.store.load();
        let restored = if persisted.is_empty() {
            debug!("No persisted session");
            None
        } else {
            match persisted.complete() {
                None => {
                    info!("Persisted session is incomplete, discarding it");
                    None
                }
                Some((user, _)) if !user.status.is_active() => {
                    info!(user_id = %abbrev_uuid(&user.id), status = ?user.status, "Persisted user is not active, discarding session");
                    None
                }
                Some((user, credentials)) => match self.gateway.validate_token(&credentials.access_token).await {
                    Ok(true) => Some((user, credentials)),
                    Ok(false) => {
                        info!(user_id = %abbrev_uuid(&user.id), "Persisted credential is no longer valid");
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Could not validate persisted credential, signing out");
                        None
                    }
                },
            }
        };

        let mut data = self.data.lock();
        match restored {
            Some((user, credentials)) => {
                info!(user_id = %abbrev_uuid(&user.id), "Restored session");
                self.link.set_access_token(Some(credentials.access_token.clone()));
                data.user = Some(user);
                data.credentials = Some(credentials);
                data.phase = SessionPhase::Authenticated;
                self.arm_timers(data.generation);
            }
            None => {
                if let Err(e) = self.store.clear() {
                    warn!(error = %e, "Failed to clear persisted session");
                }
                data.phase = SessionPhase::Unauthenticated;
            }
        }
        self.publish(&data);
        data.snapshot()
    }

    #[instrument(skip(self, password, mfa_code), fields(with_mfa_code = mfa_code.is_some()))]
    async fn login(self: &Arc<Self>, username: &str, password: &str, mfa_code: Option<&str>) -> Result<LoginResult> {
        self.ready().await?;

        let (generation, verifying_code) = {
            let data = self.data.lock();
            if data.phase.is_valid() {
                return Err(Error::AlreadyAuthenticated);
            }
            (data.generation, data.phase == SessionPhase::MfaPending && mfa_code.is_some())
        };

        match self.gateway.login(username, password, mfa_code).await {
            Ok(LoginOutcome::SecondFactorRequired) => {
                self.settle(generation, SessionPhase::MfaPending);
                if mfa_code.is_some() {
                    Err(Error::InvalidCredentials {
                        message: Some("Invalid verification code".to_string()),
                    })
                } else {
                    info!("Second factor required");
                    Ok(LoginResult::SecondFactorRequired)
                }
            }
            Ok(LoginOutcome::Authenticated { user, credentials }) => self.establish(generation, user, credentials).await,
            Err(e) => {
                debug!(error = %e, "Login failed");
                let phase = if verifying_code {
                    SessionPhase::MfaPending
                } else {
                    SessionPhase::Unauthenticated
                };
                self.settle(generation, phase);
                Err(e)
            }
        }
    }

    /// Move between unauthenticated phases, unless the session changed meanwhile.
    fn settle(&self, generation: u64, phase: SessionPhase) {
        let mut data = self.data.lock();
        if data.generation != generation || data.phase.is_valid() {
            return;
        }
        if data.phase != phase {
            data.phase = phase;
            self.publish(&data);
        }
    }

    async fn establish(self: &Arc<Self>, generation: u64, user: User, credentials: Credentials) -> Result<LoginResult> {
        if !user.status.is_active() {
            warn!(user_id = %abbrev_uuid(&user.id), status = ?user.status, "Refusing session for inactive user");
            self.settle(generation, SessionPhase::Unauthenticated);
            self.revoke(&credentials.access_token).await;
            return Err(Error::InvalidCredentials {
                message: Some("Account is not active".to_string()),
            });
        }

        let outcome = {
            let mut data = self.data.lock();
            if data.phase.is_valid() {
                Err(Error::AlreadyAuthenticated)
            } else if data.generation != generation {
                Err(Error::Unauthenticated)
            } else {
                let persisted = self.store.save(&user, &credentials);
                self.link.set_access_token(Some(credentials.access_token.clone()));
                data.user = Some(user.clone());
                data.credentials = Some(credentials.clone());
                data.phase = SessionPhase::Authenticated;
                self.arm_timers(data.generation);
                self.publish(&data);
                Ok(persisted)
            }
        };

        match outcome {
            Ok(persisted) => {
                if let Err(e) = persisted {
                    self.persistence_failed(e);
                }
                info!(user_id = %abbrev_uuid(&user.id), "Signed in");
                Ok(LoginResult::Authenticated(user))
            }
            Err(e) => {
                debug!(error = %e, "Session changed during login, discarding issued credential");
                self.revoke(&credentials.access_token).await;
                Err(e)
            }
        }
    }

    async fn refresh(self: &Arc<Self>) -> Result<()> {
        self.ready().await?;

        let shared = {
            let mut slot = self.refresh_in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight refresh");
                    in_flight.clone()
                }
                None => {
                    let inner = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        let result = inner.run_refresh().await;
                        *inner.refresh_in_flight.lock() = None;
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(Error::Internal {
                                operation: format!("refresh session: {e}"),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    #[instrument(skip(self))]
    async fn run_refresh(self: &Arc<Self>) -> Result<()> {
        let (generation, refresh_token) = {
            let mut data = self.data.lock();
            let refresh_token = match (&data.credentials, data.phase.is_valid()) {
                (Some(credentials), true) => credentials.refresh_token.clone(),
                _ => return Err(Error::Unauthenticated),
            };
            data.phase = SessionPhase::Refreshing;
            self.publish(&data);
            (data.generation, refresh_token)
        };

        match self.gateway.refresh_token(&refresh_token).await {
            Ok(credentials) => {
                let persisted = {
                    let mut data = self.data.lock();
                    if data.generation != generation {
                        debug!("Session ended during refresh, discarding new credentials");
                        return Err(Error::Unauthenticated);
                    }
                    let persisted = self.store.save_credentials(&credentials);
                    self.link.set_access_token(Some(credentials.access_token.clone()));
                    data.credentials = Some(credentials);
                    data.phase = SessionPhase::Authenticated;
                    self.arm_cadence(&mut self.timers.lock(), data.generation);
                    self.publish(&data);
                    persisted
                };
                if let Err(e) = persisted {
                    self.persistence_failed(e);
                }
                debug!("Session credentials refreshed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed, signing out");
                let _ = self.end_session(EndReason::RefreshFailed, Some(generation)).await;
                Err(e)
            }
        }
    }

    fn update_user(&self, update: UserUpdate) -> Option<User> {
        let (user, persisted) = {
            let mut data = self.data.lock();
            if !data.phase.is_valid() {
                debug!("No session, ignoring user update");
                return None;
            }
            let user = data.user.as_mut()?;
            user.apply(update);
            let user = user.clone();
            let persisted = self.store.save_user(&user);
            self.publish(&data);
            (user, persisted)
        };
        if let Err(e) = persisted {
            self.persistence_failed(e);
        }
        Some(user)
    }

    async fn handle_unauthorized(self: &Arc<Self>, credential: Option<String>) {
        let generation = {
            let data = self.data.lock();
            let current = data.credentials.as_ref().map(|c| c.access_token.as_str());
            if credential.is_none() || credential.as_deref() != current || !data.phase.is_valid() {
                debug!("Ignoring 401 for a credential the session no longer holds");
                return;
            }
            data.generation
        };
        let _ = self.end_session(EndReason::Unauthorized, Some(generation)).await;
    }

    /// The single exit path. Returns the outcome of clearing the persisted
    /// entries, which has already been reported as a notice when it failed.
    ///
    /// With `only_generation` set, nothing happens unless the session is still the
    /// one that generation refers to. An explicit logout clears the store even when
    /// no session is live in memory, since another process may have written one.
    async fn end_session(
        self: &Arc<Self>,
        reason: EndReason,
        only_generation: Option<u64>,
    ) -> std::result::Result<(), StoreError> {
        let (credentials, cleared) = {
            let mut data = self.data.lock();
            if only_generation.is_some_and(|generation| generation != data.generation) {
                return Ok(());
            }
            if !matches!(
                data.phase,
                SessionPhase::Authenticated | SessionPhase::Refreshing | SessionPhase::MfaPending
            ) {
                if reason != EndReason::Logout {
                    return Ok(());
                }
                let cleared = self.store.clear();
                self.link.set_access_token(None);
                drop(data);
                if let Err(e) = &cleared {
                    self.persistence_failed(e.clone());
                }
                return cleared;
            }

            let credentials = data.credentials.take();
            let user = data.user.take();
            data.generation += 1;
            let cleared = self.store.clear();
            self.link.set_access_token(None);
            self.timers.lock().cancel_all();

            if reason == EndReason::Expired {
                data.phase = SessionPhase::Expired;
                self.publish(&data);
            }
            data.phase = SessionPhase::Unauthenticated;
            self.publish(&data);

            info!(
                reason = ?reason,
                user_id = ?user.as_ref().map(|u| abbrev_uuid(&u.id)),
                "Session ended"
            );
            (credentials, cleared)
        };

        if let Err(e) = &cleared {
            self.persistence_failed(e.clone());
        }

        let sign_in_route = self.config.sign_in_route.clone();
        match reason {
            EndReason::Logout => {}
            EndReason::Expired => self.link.notices().emit(Notice::SessionExpired { sign_in_route }),
            EndReason::RefreshFailed | EndReason::Unauthorized => self.link.notices().emit(Notice::SignInRequired { sign_in_route }),
        }

        if let Some(credentials) = credentials {
            self.revoke(&credentials.access_token).await;
        }
        cleared
    }

    /// Best-effort server-side revocation.
    async fn revoke(&self, access_token: &str) {
        if let Err(e) = self.gateway.logout(access_token).await {
            warn!(error = %e, "Failed to revoke session with the authentication service");
        }
    }

    fn arm_timers(self: &Arc<Self>, generation: u64) {
        let mut timers = self.timers.lock();
        self.arm_lifetime(&mut timers, generation);
        self.arm_cadence(&mut timers, generation);
    }

    fn arm_lifetime(self: &Arc<Self>, timers: &mut Timers, generation: u64) {
        let token = self.shutdown.child_token();
        if let Some(previous) = timers.lifetime.replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::downgrade(self);
        let warn_after = self.config.expiry_warning_after;
        let expire_after = self.config.expiry_after;
        tokio::spawn(async move {
            let mut remaining = expire_after;
            if warn_after < expire_after {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(warn_after) => {}
                }
                let Some(manager) = inner.upgrade() else {
                    return;
                };
                remaining = expire_after - warn_after;
                manager.link.notices().emit(Notice::ExpiryWarning { remaining });
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(remaining) => {}
            }
            if let Some(manager) = inner.upgrade() {
                let _ = manager.end_session(EndReason::Expired, Some(generation)).await;
            }
        });
    }

    fn arm_cadence(self: &Arc<Self>, timers: &mut Timers, generation: u64) {
        let token = self.shutdown.child_token();
        if let Some(previous) = timers.cadence.replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::downgrade(self);
        let interval: Duration = self.config.refresh_interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(manager) = inner.upgrade() else {
                return;
            };
            if manager.data.lock().generation != generation {
                return;
            }
            if let Err(e) = manager.refresh().await {
                debug!(error = %e, "Scheduled refresh did not complete");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::permissions::catalog;
    use crate::test_utils::{
        FailingBackend, MockGateway, RefreshBehavior, manager_with, manager_with_config, manager_with_store, sample_user,
        store_over,
    };
    use crate::types::UserStatus;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    fn alice_gateway() -> Arc<MockGateway> {
        Arc::new(MockGateway::new(sample_user("alice"), "correct-pw"))
    }

    async fn signed_in(gateway: &Arc<MockGateway>) -> (SessionManager, AuthStore) {
        let (manager, store) = manager_with(gateway.clone());
        manager.bootstrap().await;
        manager.login("alice", "correct-pw", None).await.unwrap();
        (manager, store)
    }

    #[tokio::test(start_paused = true)]
    #[test_log::test]
    async fn test_login_persists_and_logout_clears() {
        let gateway = alice_gateway();
        let (manager, store) = manager_with(gateway.clone());
        assert_eq!(manager.bootstrap().await.phase, SessionPhase::Unauthenticated);

        let result = manager.login("alice", "correct-pw", None).await.unwrap();
        assert!(matches!(result, LoginResult::Authenticated(ref user) if user.username == "alice"));

        let snapshot = manager.snapshot();
        assert!(snapshot.session_valid());
        assert_eq!(snapshot.user.as_ref().map(|u| u.username.as_str()), Some("alice"));
        let persisted = store.load();
        assert_eq!(persisted.access_token.as_deref(), Some("access-1"));
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-1"));
        assert!(persisted.user.is_some());
        assert_eq!(manager.link().access_token().as_deref(), Some("access-1"));

        manager.logout().await.unwrap();

        assert_eq!(manager.snapshot(), SessionSnapshot::new(SessionPhase::Unauthenticated, None));
        assert!(store.load().is_empty());
        assert_eq!(manager.link().access_token(), None);
        assert_eq!(gateway.logout_calls(), 1);

        // Timers were cancelled: nothing fires later.
        tokio::time::sleep(60 * MINUTE).await;
        assert_eq!(gateway.refresh_calls(), 0);
        assert_eq!(gateway.logout_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_credentials_leave_nothing_behind() {
        let gateway = alice_gateway();
        let (manager, store) = manager_with(gateway.clone());
        manager.bootstrap().await;

        let err = manager.login("alice", "wrong", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials { .. }));
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mfa_flow() {
        let gateway = Arc::new(MockGateway::new(sample_user("alice"), "correct-pw").with_mfa_code("123456"));
        let (manager, store) = manager_with(gateway.clone());
        manager.bootstrap().await;

        let result = manager.login("alice", "correct-pw", None).await.unwrap();
        assert_eq!(result, LoginResult::SecondFactorRequired);
        assert!(manager.snapshot().mfa_pending());
        assert!(store.load().is_empty());

        let err = manager.login("alice", "correct-pw", Some("000000")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials { .. }));
        assert!(manager.snapshot().mfa_pending());

        let result = manager.login("alice", "correct-pw", Some("123456")).await.unwrap();
        assert!(matches!(result, LoginResult::Authenticated(_)));
        assert!(manager.snapshot().session_valid());
        assert!(store.load().complete().is_some());
        assert_eq!(gateway.login_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_rejected_when_authenticated() {
        let gateway = alice_gateway();
        let (manager, _store) = signed_in(&gateway).await;

        let err = manager.login("alice", "correct-pw", None).await.unwrap_err();
        assert_eq!(err, Error::AlreadyAuthenticated);
        assert_eq!(gateway.login_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_before_bootstrap() {
        let (manager, _store) = manager_with(alice_gateway());

        assert_eq!(manager.login("alice", "correct-pw", None).await.unwrap_err(), Error::BootstrapPending);
        assert_eq!(manager.refresh().await.unwrap_err(), Error::BootstrapPending);
        assert_eq!(manager.logout().await.unwrap_err(), Error::BootstrapPending);
        assert!(manager.snapshot().loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_waits_for_bootstrap() {
        let gateway = Arc::new(MockGateway::new(sample_user("alice"), "correct-pw").with_validate_delay(Duration::from_secs(2)));
        let (manager, store) = manager_with(gateway.clone());
        store
            .save(
                &sample_user("alice"),
                &Credentials {
                    access_token: "persisted-access".to_string(),
                    refresh_token: "persisted-refresh".to_string(),
                },
            )
            .unwrap();

        let bootstrapping = tokio::spawn({
            let manager = manager.clone();
            async move { manager.bootstrap().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.snapshot().loading());

        // Restored session is valid, so the queued login is rejected rather than racing it.
        let err = manager.login("alice", "correct-pw", None).await.unwrap_err();
        assert_eq!(err, Error::AlreadyAuthenticated);
        assert!(bootstrapping.await.unwrap().session_valid());
        assert_eq!(gateway.login_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_restores_valid_session() {
        let gateway = alice_gateway();
        let (first, store) = signed_in(&gateway).await;
        drop(first);

        let (manager, _) = crate::test_utils::manager_with_store(gateway.clone(), store);
        let snapshot = manager.bootstrap().await;

        assert_eq!(snapshot.phase, SessionPhase::Authenticated);
        assert_eq!(snapshot.user.map(|u| u.username), Some("alice".to_string()));
        assert_eq!(gateway.validate_calls(), 1);
        assert_eq!(manager.link().access_token().as_deref(), Some("access-1"));
        assert!(manager.check("threats", "read"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_invalid_token_clears_store() {
        let gateway = alice_gateway();
        gateway.set_validate(Ok(false));
        let (manager, store) = manager_with(gateway.clone());
        store
            .save(
                &sample_user("alice"),
                &Credentials {
                    access_token: "revoked".to_string(),
                    refresh_token: "r".to_string(),
                },
            )
            .unwrap();

        let snapshot = manager.bootstrap().await;

        assert_eq!(snapshot, SessionSnapshot::new(SessionPhase::Unauthenticated, None));
        assert!(store.load().is_empty());
        assert_eq!(gateway.validate_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_fails_closed_when_unreachable() {
        let gateway = alice_gateway();
        gateway.set_validate(Err(Error::NetworkUnavailable {
            message: "connection refused".to_string(),
        }));
        let (manager, store) = manager_with(gateway.clone());
        store
            .save(
                &sample_user("alice"),
                &Credentials {
                    access_token: "a".to_string(),
                    refresh_token: "r".to_string(),
                },
            )
            .unwrap();

        assert_eq!(manager.bootstrap().await.phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_partial_group_is_cleared() {
        let gateway = alice_gateway();
        let (manager, store) = manager_with(gateway.clone());
        store.save_user(&sample_user("alice")).unwrap();

        assert_eq!(manager.bootstrap().await.phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
        assert_eq!(gateway.validate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_inactive_user_is_not_restored() {
        let gateway = alice_gateway();
        let (manager, store) = manager_with(gateway.clone());
        let mut user = sample_user("alice");
        user.status = UserStatus::Suspended;
        store
            .save(
                &user,
                &Credentials {
                    access_token: "a".to_string(),
                    refresh_token: "r".to_string(),
                },
            )
            .unwrap();

        assert_eq!(manager.bootstrap().await.phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
        assert_eq!(gateway.validate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_is_coalesced() {
        let gateway = Arc::new(MockGateway::new(sample_user("alice"), "correct-pw").with_refresh_delay(Duration::from_secs(1)));
        let (manager, store) = signed_in(&gateway).await;

        let (first, second) = tokio::join!(manager.refresh(), manager.refresh());

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(gateway.refresh_calls(), 1);
        assert_eq!(store.load().access_token.as_deref(), Some("access-2"));
        assert_eq!(manager.link().access_token().as_deref(), Some("access-2"));
        assert_eq!(manager.snapshot().phase, SessionPhase::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_failure_is_shared() {
        let gateway = Arc::new(MockGateway::new(sample_user("alice"), "correct-pw").with_refresh_delay(Duration::from_secs(1)));
        gateway.set_refresh(RefreshBehavior::Reject);
        let (manager, _store) = signed_in(&gateway).await;

        let (first, second) = tokio::join!(manager.refresh(), manager.refresh());

        assert!(matches!(first, Err(Error::RefreshRejected { .. })));
        assert_eq!(first, second);
        assert_eq!(gateway.refresh_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_user() {
        let gateway = alice_gateway();
        let (manager, _store) = signed_in(&gateway).await;
        let before = manager.snapshot().user;

        manager.refresh().await.unwrap();

        assert_eq!(manager.snapshot().user, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_signs_out() {
        let gateway = alice_gateway();
        gateway.set_refresh(RefreshBehavior::Reject);
        let (manager, store) = signed_in(&gateway).await;
        let mut notices = manager.notices();

        let err = manager.refresh().await.unwrap_err();

        assert!(err.requires_reauthentication());
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
        assert_eq!(manager.link().access_token(), None);
        assert_eq!(gateway.logout_calls(), 1);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::SignInRequired {
                sign_in_route: "/login".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_network_failure_signs_out() {
        let gateway = alice_gateway();
        gateway.set_refresh(RefreshBehavior::NetworkError);
        let (manager, store) = signed_in(&gateway).await;

        let err = manager.refresh().await.unwrap_err();

        assert!(matches!(err, Error::NetworkUnavailable { .. }));
        assert!(!manager.snapshot().session_valid());
        assert!(store.load().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_requires_session() {
        let (manager, _store) = manager_with(alice_gateway());
        manager.bootstrap().await;
        assert_eq!(manager.refresh().await.unwrap_err(), Error::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_wins_over_in_flight_refresh() {
        let gateway = Arc::new(MockGateway::new(sample_user("alice"), "correct-pw").with_refresh_delay(Duration::from_secs(5)));
        let (manager, store) = signed_in(&gateway).await;

        let refreshing = tokio::spawn({
            let manager = manager.clone();
            async move { manager.refresh().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.snapshot().phase, SessionPhase::Refreshing);

        manager.logout().await.unwrap();
        let result = refreshing.await.unwrap();

        assert_eq!(result, Err(Error::Unauthenticated));
        assert_eq!(gateway.refresh_calls(), 1);
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
        assert_eq!(manager.link().access_token(), None);
    }

    #[tokio::test(start_paused = true)]
    #[test_log::test]
    async fn test_hard_expiry_despite_successful_refresh() {
        let gateway = alice_gateway();
        let (manager, store) = signed_in(&gateway).await;
        let mut notices = manager.notices();

        tokio::time::sleep(31 * MINUTE).await;

        assert_eq!(gateway.refresh_calls(), 1);
        assert_eq!(gateway.logout_calls(), 1);
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());

        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::ExpiryWarning { remaining: 5 * MINUTE }
        );
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::SessionExpired {
                sign_in_route: "/login".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_warning_is_advisory() {
        let gateway = alice_gateway();
        let (manager, _store) = signed_in(&gateway).await;
        let mut notices = manager.notices();

        tokio::time::sleep(26 * MINUTE).await;

        assert_eq!(
            notices.try_recv().unwrap(),
            Notice::ExpiryWarning { remaining: 5 * MINUTE }
        );
        assert!(manager.snapshot().session_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_cadence_repeats() {
        let gateway = alice_gateway();
        let config = SessionConfig {
            refresh_interval: 5 * MINUTE,
            ..Default::default()
        };
        let (manager, _store) = manager_with_config(gateway.clone(), config);
        manager.bootstrap().await;
        manager.login("alice", "correct-pw", None).await.unwrap();

        tokio::time::sleep(16 * MINUTE).await;

        assert_eq!(gateway.refresh_calls(), 3);
        assert_eq!(manager.link().access_token().as_deref(), Some("access-4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_unauthorized_signal_is_ignored() {
        let gateway = alice_gateway();
        let (manager, _store) = signed_in(&gateway).await;
        manager.refresh().await.unwrap();

        manager.inner.handle_unauthorized(Some("access-1".to_string())).await;
        assert!(manager.snapshot().session_valid());

        manager.inner.handle_unauthorized(Some("access-2".to_string())).await;
        manager.inner.handle_unauthorized(Some("access-2".to_string())).await;
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert_eq!(gateway.logout_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_user() {
        let gateway = alice_gateway();
        let (manager, store) = signed_in(&gateway).await;
        let mut updates = manager.subscribe();
        updates.mark_unchanged();

        let updated = manager
            .update_user(UserUpdate {
                email: Some("alice@ops.sra.local".to_string()),
                mfa_enabled: Some(true),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(updated.email, "alice@ops.sra.local");
        assert!(updated.mfa_enabled);
        assert_eq!(updated.username, "alice");
        assert_eq!(store.load().user, Some(updated.clone()));
        assert!(updates.has_changed().unwrap());
        assert_eq!(gateway.login_calls(), 1);
        assert_eq!(gateway.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_user_without_session_is_noop() {
        let (manager, store) = manager_with(alice_gateway());
        manager.bootstrap().await;

        let result = manager.update_user(UserUpdate {
            email: Some("x@example.com".to_string()),
            ..Default::default()
        });

        assert_eq!(result, None);
        assert!(store.load().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_checks_follow_session() {
        let gateway = alice_gateway();
        let (manager, _store) = manager_with(gateway.clone());
        manager.bootstrap().await;
        assert!(!manager.check("threats", "read"));

        manager.login("alice", "correct-pw", None).await.unwrap();
        assert!(manager.check("threats", "read"));
        assert!(!manager.check("missions", "execute"));
        assert_eq!(
            manager.require(&catalog::missions_execute()).unwrap_err(),
            Error::InsufficientPermissions {
                required: catalog::missions_execute()
            }
        );

        manager.logout().await.unwrap();
        assert!(!manager.check("threats", "read"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_survives_gateway_failure() {
        let gateway = alice_gateway();
        gateway.fail_logout();
        let (manager, store) = signed_in(&gateway).await;

        manager.logout().await.unwrap();

        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
        assert_eq!(gateway.logout_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_user_login_is_refused() {
        let mut user = sample_user("alice");
        user.status = UserStatus::Inactive;
        let gateway = Arc::new(MockGateway::new(user, "correct-pw"));
        let (manager, store) = manager_with(gateway.clone());
        manager.bootstrap().await;

        let err = manager.login("alice", "correct-pw", None).await.unwrap_err();

        assert!(matches!(err, Error::InvalidCredentials { .. }));
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert!(store.load().is_empty());
        assert_eq!(gateway.logout_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[test_log::test]
    async fn test_logout_clears_session_written_elsewhere() {
        let gateway = alice_gateway();
        let (manager, store) = manager_with(gateway.clone());
        assert_eq!(manager.bootstrap().await.phase, SessionPhase::Unauthenticated);

        // Another tab signs in after this one bootstrapped.
        store
            .save(
                &sample_user("alice"),
                &Credentials {
                    access_token: "other-tab".to_string(),
                    refresh_token: "other-r".to_string(),
                },
            )
            .unwrap();

        manager.logout().await.unwrap();

        assert!(store.load().is_empty());
        assert_eq!(manager.link().access_token(), None);
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert_eq!(gateway.logout_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_reports_failed_clear() {
        let gateway = alice_gateway();
        let backend = Arc::new(FailingBackend::new());
        let (manager, store) = manager_with_store(gateway.clone(), store_over(backend.clone()));
        manager.bootstrap().await;
        manager.login("alice", "correct-pw", None).await.unwrap();
        let mut notices = manager.notices();

        backend.fail_removes(true);
        let err = manager.logout().await.unwrap_err();

        assert!(matches!(err, Error::PersistenceFailure(StoreError::Io { .. })));
        assert_eq!(manager.snapshot().phase, SessionPhase::Unauthenticated);
        assert_eq!(manager.link().access_token(), None);
        assert!(matches!(notices.try_recv(), Ok(Notice::PersistenceFailure { .. })));

        // Retrying once storage recovers removes what was left behind.
        backend.fail_removes(false);
        assert!(!store.load().is_empty());
        manager.logout().await.unwrap();
        assert!(store.load().is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[test_log::test]
    async fn test_persistence_failure_keeps_session_in_memory() {
        let gateway = alice_gateway();
        let backend = Arc::new(FailingBackend::new().failing_writes_to("sra_refresh_token"));
        let (manager, store) = manager_with_store(gateway.clone(), store_over(backend.clone()));
        manager.bootstrap().await;
        let mut notices = manager.notices();

        manager.login("alice", "correct-pw", None).await.unwrap();

        assert!(manager.snapshot().session_valid());
        assert_eq!(manager.link().access_token().as_deref(), Some("access-1"));
        assert!(matches!(notices.try_recv(), Ok(Notice::PersistenceFailure { .. })));
        // The group write was rolled back: no credential without its pair.
        assert!(store.load().is_empty());
        assert!(backend.inner.keys().is_empty());

        manager.refresh().await.unwrap();

        assert!(manager.snapshot().session_valid());
        assert_eq!(manager.link().access_token().as_deref(), Some("access-2"));
        assert!(matches!(notices.try_recv(), Ok(Notice::PersistenceFailure { .. })));
        let persisted = store.load();
        assert_eq!(persisted.access_token, None);
        assert_eq!(persisted.refresh_token, None);
        assert!(notices.try_recv().is_err());
    }
}
