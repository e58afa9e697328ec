use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::credentials::{CredentialField, CredentialStore, Credentials};
use crate::api::{parse_json, ApiClient, ApiError};
use crate::config::{Config, RefreshTransport};
use crate::models::{LoginRequest, RefreshRequest, TokenResponse, User};

pub const LOGIN_PATH: &str = "/auth/login/";
pub const REFRESH_PATH: &str = "/auth/refresh/";
pub const ME_PATH: &str = "/auth/me/";
pub const LOGOUT_PATH: &str = "/auth/logout/";

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    RefreshingCredential,
}

type RefreshOutcome = Result<String, ApiError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Client side of the backend's login/refresh/logout protocol.
///
/// Clone is cheap: all clones share one session, one HTTP connection pool and
/// one refresh slot.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    http: Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    transport: RefreshTransport,
    refresh_timeout: Duration,
    /// The refresh currently in flight, shared by every caller that needs it.
    refresh_slot: Mutex<Option<SharedRefresh>>,
    /// Serializes writes that replace or wipe the session.
    writes: Mutex<()>,
    /// Bumped whenever the session is replaced or wiped. A refresh started
    /// under an older epoch must not write its result.
    epoch: AtomicU64,
    state: watch::Sender<SessionState>,
}

impl SessionClient {
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .cookie_store(config.refresh_transport == RefreshTransport::Cookie)
            .build()?;
        Ok(Self::with_http_client(http, config, store))
    }

    /// Build on an existing `reqwest::Client`, sharing its connection pool
    /// (and cookie jar, for cookie transport).
    pub fn with_http_client(http: Client, config: &Config, store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        Self {
            inner: Arc::new(SessionInner {
                http,
                base_url: config.api_url.trim_end_matches('/').to_string(),
                store,
                transport: config.refresh_transport,
                refresh_timeout: config.refresh_timeout(),
                refresh_slot: Mutex::new(None),
                writes: Mutex::new(()),
                epoch: AtomicU64::new(0),
                state,
            }),
        }
    }

    /// Authenticated request wrapper bound to this session.
    pub fn api(&self) -> ApiClient {
        ApiClient::new(self.clone())
    }

    /// Rebuild the in-process state from whatever the store persisted.
    ///
    /// Tokens without a confirmed user restore as `Anonymous`, in line with
    /// `is_authenticated()`. They are kept, so `fetch_identity` can still
    /// confirm them.
    pub async fn restore(&self) -> Result<SessionState, ApiError> {
        let credentials = self.inner.store.get().await?;
        let state = if credentials.user.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        };
        debug!(
            ?state,
            has_token = credentials.access_token().is_some(),
            "Session restored"
        );
        self.set_state(state);
        Ok(state)
    }

    // ===== Login / identity =====

    /// Log in and populate the user profile.
    ///
    /// A rejected login leaves any existing session exactly as it was.
    pub async fn login(&self, username: &str, password: &str) -> Result<User, ApiError> {
        let previous = self.state();
        self.set_state(SessionState::Authenticating);

        let tokens = match self.exchange_credentials(username, password).await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.set_state(previous);
                return Err(e);
            }
        };

        let refresh = match self.inner.transport {
            RefreshTransport::Body => tokens.refresh_token().map(str::to_string),
            RefreshTransport::Cookie => None,
        };
        {
            let _guard = self.inner.writes.lock().await;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            let write = self
                .inner
                .store
                .set(CredentialField::NewSession {
                    access: tokens.access_token,
                    refresh,
                })
                .await;
            if let Err(e) = write {
                self.set_state(previous);
                return Err(e.into());
            }
        }
        self.set_state(SessionState::Authenticated);
        info!(username = username, "Logged in");

        self.fetch_identity().await
    }

    async fn exchange_credentials(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError> {
        let response = self
            .inner
            .http
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "Login rejected");
            return Err(ApiError::InvalidCredentials);
        }
        parse_json(response).await
    }

    /// Ask the backend who the current credentials belong to.
    ///
    /// Any failure clears the cached profile but keeps the tokens, so a later
    /// attempt can still succeed without a new login.
    ///
    /// If the session is wiped or replaced while the check is in flight, the
    /// answer belongs to a session that no longer exists and nothing is written.
    pub async fn fetch_identity(&self) -> Result<User, ApiError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let outcome = self.api().get::<User>(ME_PATH).await;

        let _guard = self.inner.writes.lock().await;
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Session replaced during identity check; discarding result");
            return match outcome {
                Ok(_) => Err(ApiError::SessionExpired),
                Err(e) => Err(e),
            };
        }
        match outcome {
            Ok(user) => {
                self.inner
                    .store
                    .set(CredentialField::User(Some(user.clone())))
                    .await?;
                self.set_state(SessionState::Authenticated);
                debug!(user_id = user.id, role = %user.role, "Identity confirmed");
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "Identity check failed");
                if let Err(store_err) = self.inner.store.set(CredentialField::User(None)).await {
                    warn!(error = %store_err, "Failed to clear cached user");
                }
                self.set_state(SessionState::Anonymous);
                Err(e)
            }
        }
    }

    // ===== Refresh =====

    /// Exchange the refresh credential for a new access token.
    ///
    /// Concurrent callers share a single exchange. Rejection or timeout wipes
    /// the session and yields `SessionExpired`.
    pub async fn refresh(&self) -> Result<String, ApiError> {
        self.refresh_after(None).await
    }

    /// Refresh because `rejected` was refused by the server.
    ///
    /// When the stored token no longer matches `rejected`, another caller has
    /// already renewed it (or the session ended) and no new exchange is made.
    pub(crate) async fn refresh_after(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        let refresh = {
            let mut slot = self.inner.refresh_slot.lock().await;
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight refresh");
                    in_flight.clone()
                }
                None => {
                    if let Some(rejected) = rejected {
                        let current = self.inner.store.get().await?;
                        match current.access_token() {
                            Some(token) if token != rejected => {
                                debug!("Access token already renewed");
                                return Ok(token.to_string());
                            }
                            None => return Err(ApiError::SessionExpired),
                            Some(_) => {}
                        }
                    }
                    let refresh = self.spawn_refresh();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    /// Start the exchange on its own task so that callers giving up on their
    /// request do not cancel it for everyone else.
    fn spawn_refresh(&self) -> SharedRefresh {
        let session = self.clone();
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let task = tokio::spawn(async move {
            let previous = {
                let _guard = session.inner.writes.lock().await;
                let previous = session.state();
                if session.inner.epoch.load(Ordering::SeqCst) == epoch {
                    session.set_state(SessionState::RefreshingCredential);
                }
                previous
            };

            let outcome = session.run_refresh(epoch).await;
            {
                // After a wipe or a new login the state is no longer ours to set
                let _guard = session.inner.writes.lock().await;
                if session.inner.epoch.load(Ordering::SeqCst) == epoch {
                    session.set_state(match &outcome {
                        // Identity still unconfirmed
                        Ok(_) if previous == SessionState::Anonymous => SessionState::Anonymous,
                        Ok(_) => SessionState::Authenticated,
                        Err(_) => previous,
                    });
                }
            }

            // Release the slot only after the store holds the outcome, so a
            // late 401 sees the renewed token instead of starting over.
            session.inner.refresh_slot.lock().await.take();
            outcome
        });

        async move {
            task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Refresh task did not complete");
                Err(ApiError::SessionExpired)
            })
        }
        .boxed()
        .shared()
    }

    async fn run_refresh(&self, epoch: u64) -> RefreshOutcome {
        let credentials = self.inner.store.get().await?;
        let refresh_token = match self.inner.transport {
            RefreshTransport::Body => match credentials.refresh_token() {
                Some(token) => Some(token.to_string()),
                None => {
                    info!("No refresh credential available");
                    return self.expire(epoch).await;
                }
            },
            RefreshTransport::Cookie => None,
        };

        let exchange = self.exchange_refresh_token(refresh_token.as_deref());
        let tokens = match tokio::time::timeout(self.inner.refresh_timeout, exchange).await {
            Ok(Ok(tokens)) => tokens,
            Err(_) => {
                warn!(timeout_secs = self.inner.refresh_timeout.as_secs_f64(), "Refresh timed out");
                return self.expire(epoch).await;
            }
            Ok(Err(ApiError::NetworkError(e))) if e.is_timeout() => {
                warn!(error = %e, "Refresh timed out");
                return self.expire(epoch).await;
            }
            Ok(Err(e @ ApiError::NetworkError(_))) => {
                // The credential was never evaluated; keep it for the next attempt
                warn!(error = %e, "Refresh endpoint unreachable");
                return Err(e);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Refresh rejected");
                return self.expire(epoch).await;
            }
        };

        let rotated = tokens.refresh_token().map(str::to_string);
        let refresh = match self.inner.transport {
            RefreshTransport::Body => rotated.clone().or(refresh_token),
            RefreshTransport::Cookie => None,
        };

        let _guard = self.inner.writes.lock().await;
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            info!("Session replaced during refresh; discarding renewed token");
            return Err(ApiError::SessionExpired);
        }
        self.inner
            .store
            .set(CredentialField::Tokens {
                access: tokens.access_token.clone(),
                refresh,
            })
            .await?;
        info!(rotated = rotated.is_some(), "Access token renewed");
        Ok(tokens.access_token)
    }

    async fn exchange_refresh_token(&self, refresh_token: Option<&str>) -> Result<TokenResponse, ApiError> {
        let response = self
            .inner
            .http
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        parse_json(response).await
    }

    /// Wipe the session if it is still the one `epoch` refers to.
    async fn expire(&self, epoch: u64) -> RefreshOutcome {
        let _guard = self.inner.writes.lock().await;
        if self.inner.epoch.load(Ordering::SeqCst) == epoch {
            warn!("Session expired");
            if let Err(e) = self.clear_locked().await {
                warn!(error = %e, "Failed to clear expired session");
            }
        }
        Err(ApiError::SessionExpired)
    }

    /// Wipe the session after a renewed `token` was itself rejected.
    pub(crate) async fn expire_rejected(&self, token: &str) {
        let _guard = self.inner.writes.lock().await;
        let current = match self.inner.store.get().await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Failed to read session");
                return;
            }
        };
        if current.access_token() == Some(token) {
            warn!("Renewed access token rejected; session expired");
            if let Err(e) = self.clear_locked().await {
                warn!(error = %e, "Failed to clear expired session");
            }
        }
    }

    // ===== Logout =====

    /// Tell the backend, then clear local state whatever the backend said.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let credentials = self.inner.store.get().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read session before logout");
            Credentials::default()
        });

        let mut request = self
            .inner
            .http
            .post(self.url(LOGOUT_PATH))
            .timeout(self.inner.refresh_timeout);
        if let Some(token) = credentials.access_token() {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => debug!("Backend session closed"),
            Ok(response) => {
                warn!(status = %response.status(), "Logout rejected by backend; clearing local session anyway")
            }
            Err(e) => warn!(error = %e, "Logout request failed; clearing local session anyway"),
        }

        let _guard = self.inner.writes.lock().await;
        self.clear_locked().await?;
        info!("Logged out");
        Ok(())
    }

    /// Caller must hold `writes`.
    async fn clear_locked(&self) -> Result<(), ApiError> {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(SessionState::Anonymous);
        self.inner.store.clear().await?;
        Ok(())
    }

    // ===== Accessors =====

    /// True iff the last identity check succeeded and the session was not
    /// cleared since. Token presence alone does not count.
    pub async fn is_authenticated(&self) -> bool {
        match self.inner.store.get().await {
            Ok(credentials) => credentials.user.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to read session");
                false
            }
        }
    }

    pub async fn current_user(&self) -> Result<Option<User>, ApiError> {
        Ok(self.inner.store.get().await?.user)
    }

    pub async fn credentials(&self) -> Result<Credentials, ApiError> {
        Ok(self.inner.store.get().await?)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions, e.g. to send the user to login on expiry.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn refresh_transport(&self) -> RefreshTransport {
        self.inner.transport
    }

    pub(crate) fn http(&self) -> &Client {
        &self.inner.http
    }

    pub(crate) fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.inner.base_url, path)
        } else {
            format!("{}/{}", self.inner.base_url, path)
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Session state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;

    fn client(api_url: &str) -> SessionClient {
        let config = Config {
            api_url: api_url.to_string(),
            ..Config::default()
        };
        SessionClient::new(&config, Arc::new(MemoryCredentialStore::new())).unwrap()
    }

    #[test]
    fn test_url_joins_paths() {
        let session = client("http://localhost:8000/");
        assert_eq!(session.url(ME_PATH), "http://localhost:8000/auth/me/");
        assert_eq!(session.url("orders/"), "http://localhost:8000/orders/");
    }

    #[tokio::test]
    async fn test_restore_empty_store_is_anonymous() {
        let session = client("http://localhost:8000");
        assert_eq!(session.restore().await.unwrap(), SessionState::Anonymous);
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_restore_persisted_session() {
        let mut credentials = Credentials::default();
        credentials.apply(CredentialField::Tokens {
            access: "A1".to_string(),
            refresh: Some("R1".to_string()),
        });
        credentials.apply(CredentialField::User(Some(User {
            id: 7,
            username: "alice".to_string(),
            role: "driver".to_string(),
        })));
        let store = Arc::new(MemoryCredentialStore::with_credentials(credentials));
        let session = SessionClient::new(&Config::default(), store).unwrap();

        assert_eq!(session.state(), SessionState::Anonymous);
        assert_eq!(session.restore().await.unwrap(), SessionState::Authenticated);
        assert!(session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_token_without_identity_is_not_authenticated() {
        let mut credentials = Credentials::default();
        credentials.apply(CredentialField::AccessToken(Some("A1".to_string())));
        let store = Arc::new(MemoryCredentialStore::with_credentials(credentials));
        let session = SessionClient::new(&Config::default(), store.clone()).unwrap();
        assert!(!session.is_authenticated().await);

        assert_eq!(session.restore().await.unwrap(), SessionState::Anonymous);
        assert_eq!(session.state(), SessionState::Anonymous);
        // Kept for a later identity check
        assert_eq!(store.get().await.unwrap().access_token(), Some("A1"));
    }

    #[tokio::test]
    async fn test_late_unauthorized_reuses_renewed_token() {
        let mut credentials = Credentials::default();
        credentials.apply(CredentialField::Tokens {
            access: "A2".to_string(),
            refresh: Some("R1".to_string()),
        });
        let store = Arc::new(MemoryCredentialStore::with_credentials(credentials));
        // Answered from the store, no exchange is attempted
        let session = SessionClient::new(&Config::default(), store).unwrap();

        assert_eq!(session.refresh_after(Some("A1")).await.unwrap(), "A2");
    }

    #[tokio::test]
    async fn test_late_unauthorized_after_logout_is_expired() {
        let session = client("http://localhost:8000");
        let err = session.refresh_after(Some("A1")).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_expires() {
        let mut credentials = Credentials::default();
        credentials.apply(CredentialField::AccessToken(Some("A1".to_string())));
        let store = Arc::new(MemoryCredentialStore::with_credentials(credentials));
        // No server is contacted: the body transport has nothing to send
        let session = SessionClient::new(&Config::default(), store.clone()).unwrap();

        let mut states = session.subscribe();
        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired));
        assert!(store.get().await.unwrap().is_empty());
        assert_eq!(*states.borrow_and_update(), SessionState::Anonymous);
    }
}
