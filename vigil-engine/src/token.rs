//! Token lifecycle coordination.
//!
//! [`TokenLifecycleGuard`] hands out bearer tokens to the snapshot fetcher and
//! the realtime channel. At most one refresh is in flight at a time; every
//! concurrent caller awaits the same refresh. A refreshed token is written to a
//! [`SharedTokenStore`] so other sessions of the same principal adopt it
//! instead of starting their own refresh. A failed refresh invalidates the
//! session: every waiter is rejected and dependents are told to stop.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use directories::BaseDirs;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::errors::AuthError;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    clock::{Clock, SystemClock},
    http::{self, endpoint},
};

/// Bearer token with its expiry.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    /// Opaque bearer value.
    #[serde(alias = "token", alias = "accessToken")]
    pub value: String,
    /// Instant after which the server refuses the token.
    #[serde(alias = "expires_at")]
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Token `value` valid until `expires_at`.
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Whether the token is still usable `skew` before its expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: TimeDelta) -> bool {
        self.expires_at - skew > now
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of new tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync + fmt::Debug {
    /// Exchanges the current token (if any) for a new one.
    ///
    /// # Errors
    /// Returns an [`AuthError`] when the token source refuses or is unreachable.
    async fn refresh(&self, current: Option<AccessToken>) -> Result<AccessToken, AuthError>;
}

/// Storage visible to every session of the same principal.
pub trait SharedTokenStore: Send + Sync + fmt::Debug {
    /// Token most recently saved by any session, if any.
    fn load(&self) -> Option<AccessToken>;

    /// # Errors
    /// Returns an error if the token cannot be persisted.
    fn save(&self, token: &AccessToken) -> io::Result<()>;

    /// # Errors
    /// Returns an error if the stored token cannot be removed.
    fn clear(&self) -> io::Result<()>;
}

/// Notification emitted to dependents of the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// A refresh succeeded; carries the new token.
    Refreshed(AccessToken),
    /// A refresh failed; sign-in is required.
    SessionInvalidated,
}

/// Whether the session can still produce tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Tokens can be produced or refreshed.
    #[default]
    Active,
    /// A refresh failed; only `reset_session` revives the session.
    Invalid,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<AccessToken, AuthError>>>;

#[derive(Default)]
struct GuardState {
    current: Option<AccessToken>,
    rejected: Option<String>,
    in_flight: Option<(u64, RefreshFuture)>,
    next_refresh_id: u64,
    session_invalid: bool,
}

impl GuardState {
    fn usable(&self, token: &AccessToken, now: DateTime<Utc>, skew: TimeDelta) -> bool {
        token.is_fresh(now, skew) && self.rejected.as_deref() != Some(token.value.as_str())
    }
}

/// Hands out valid tokens and coordinates a single in-flight refresh
/// across every caller of one principal.
pub struct TokenLifecycleGuard {
    refresher: Arc<dyn TokenRefresher>,
    store: Arc<dyn SharedTokenStore>,
    clock: Arc<dyn Clock>,
    skew: TimeDelta,
    state: Mutex<GuardState>,
    events: broadcast::Sender<TokenEvent>,
    session: watch::Sender<SessionState>,
}

impl fmt::Debug for TokenLifecycleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLifecycleGuard")
            .field("refresher", &self.refresher)
            .field("store", &self.store)
            .field("skew", &self.skew)
            .field("session", &*self.session.borrow())
            .finish_non_exhaustive()
    }
}

impl TokenLifecycleGuard {
    /// Guard using the system clock.
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        store: Arc<dyn SharedTokenStore>,
        skew: TimeDelta,
    ) -> Self {
        Self::with_clock(refresher, store, skew, Arc::new(SystemClock))
    }

    /// Guard with an explicit clock for expiry checks.
    pub fn with_clock(
        refresher: Arc<dyn TokenRefresher>,
        store: Arc<dyn SharedTokenStore>,
        skew: TimeDelta,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let (session, _) = watch::channel(SessionState::Active);
        Self {
            refresher,
            store,
            clock,
            skew,
            state: Mutex::new(GuardState::default()),
            events,
            session,
        }
    }

    /// Refresh and invalidation events.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    /// Change notification for the session state.
    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }

    /// Whether the session has not been invalidated.
    pub fn is_session_valid(&self) -> bool {
        *self.session.borrow() == SessionState::Active
    }

    /// Returns a token that is valid for at least the refresh skew.
    ///
    /// # Errors
    /// Returns [`AuthError::SessionInvalid`] once a refresh has failed, or the
    /// refresh failure itself for the callers that were waiting on it.
    pub async fn valid_token(&self) -> Result<AccessToken, AuthError> {
        let (refresh_id, refresh) = {
            let mut state = self.state.lock().await;
            if state.session_invalid {
                return Err(AuthError::SessionInvalid);
            }

            let now = self.clock.now();
            if let Some(token) = state
                .current
                .as_ref()
                .filter(|token| state.usable(token, now, self.skew))
            {
                return Ok(token.clone());
            }

            if let Some(token) = self
                .store
                .load()
                .filter(|token| state.usable(token, now, self.skew))
            {
                debug!(target: "vigil::token", expires_at = %token.expires_at, "adopting token refreshed by another session");
                state.current = Some(token.clone());
                return Ok(token);
            }

            match &state.in_flight {
                Some((id, refresh)) => (*id, refresh.clone()),
                None => {
                    let id = state.next_refresh_id;
                    state.next_refresh_id += 1;
                    let refresher = Arc::clone(&self.refresher);
                    let current = state.current.clone().or_else(|| self.store.load());
                    let refresh = async move { refresher.refresh(current).await }
                        .boxed()
                        .shared();
                    state.in_flight = Some((id, refresh.clone()));
                    debug!(target: "vigil::token", refresh_id = id, "starting token refresh");
                    (id, refresh)
                }
            }
        };

        let result = refresh.await;
        self.settle(refresh_id, &result).await;
        result
    }

    async fn settle(&self, refresh_id: u64, result: &Result<AccessToken, AuthError>) {
        let mut state = self.state.lock().await;
        if !matches!(&state.in_flight, Some((id, _)) if *id == refresh_id) {
            return;
        }
        state.in_flight = None;

        match result {
            Ok(token) => {
                counter!("vigil_token_refreshes_total", "outcome" => "ok").increment(1);
                state.current = Some(token.clone());
                state.rejected = None;
                if let Err(err) = self.store.save(token) {
                    warn!(target: "vigil::token", error = %err, "failed to share refreshed token");
                }
                info!(target: "vigil::token", expires_at = %token.expires_at, "token refreshed");
                let _ = self.events.send(TokenEvent::Refreshed(token.clone()));
            }
            Err(err) => {
                counter!("vigil_token_refreshes_total", "outcome" => "failed").increment(1);
                state.session_invalid = true;
                state.current = None;
                if let Err(clear_err) = self.store.clear() {
                    warn!(target: "vigil::token", error = %clear_err, "failed to clear shared token");
                }
                warn!(target: "vigil::token", error = %err, "token refresh failed; session invalidated");
                let _ = self.events.send(TokenEvent::SessionInvalidated);
                self.session.send_replace(SessionState::Invalid);
            }
        }
    }

    /// Marks `token` as rejected by a server so the next call refreshes.
    pub async fn reject(&self, token: &AccessToken) {
        let mut state = self.state.lock().await;
        if state.rejected.as_deref() != Some(token.value.as_str()) {
            debug!(target: "vigil::token", "server rejected token; refreshing on next use");
            state.rejected = Some(token.value.clone());
        }
    }

    /// Installs a token obtained out of band (sign-in) and revives the session.
    pub async fn reset_session(&self, token: AccessToken) {
        let mut state = self.state.lock().await;
        state.session_invalid = false;
        state.rejected = None;
        if let Err(err) = self.store.save(&token) {
            warn!(target: "vigil::token", error = %err, "failed to share new session token");
        }
        state.current = Some(token);
        self.session.send_replace(SessionState::Active);
    }

    /// Drops the session locally and in the shared store (logout).
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.session_invalid = true;
        state.current = None;
        state.in_flight = None;
        if let Err(err) = self.store.clear() {
            warn!(target: "vigil::token", error = %err, "failed to clear shared token");
        }
        let _ = self.events.send(TokenEvent::SessionInvalidated);
        self.session.send_replace(SessionState::Invalid);
    }
}

/// Refreshes tokens against `POST {base}/api/auth/refresh`.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    base_url: Url,
}

impl HttpTokenRefresher {
    /// Refresher against the API at `base_url`.
    pub fn new(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, current: Option<AccessToken>) -> Result<AccessToken, AuthError> {
        let current = current.ok_or_else(|| AuthError::Rejected("no session token".into()))?;
        let url = endpoint(&self.base_url, "api/auth/refresh")
            .map_err(|err| AuthError::Unavailable(format!("invalid refresh endpoint: {err}")))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&current.value)
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        let status = response.status();
        if http::is_auth_status(status) {
            return Err(AuthError::Rejected(http::failure_body(response).await));
        }
        if !status.is_success() {
            let body = http::failure_body(response).await;
            return Err(AuthError::Unavailable(format!("{status}: {body}")));
        }

        response
            .json::<AccessToken>()
            .await
            .map_err(|err| AuthError::Unavailable(format!("invalid refresh response: {err}")))
    }
}

/// In-process shared storage with change notification.
#[derive(Debug)]
pub struct MemoryTokenStore {
    token: watch::Sender<Option<AccessToken>>,
}

impl MemoryTokenStore {
    /// Store seeded with `initial`.
    pub fn new(initial: Option<AccessToken>) -> Self {
        let (token, _) = watch::channel(initial);
        Self { token }
    }

    /// Change notification for sessions sharing this store.
    pub fn watch(&self) -> watch::Receiver<Option<AccessToken>> {
        self.token.subscribe()
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SharedTokenStore for MemoryTokenStore {
    fn load(&self) -> Option<AccessToken> {
        self.token.borrow().clone()
    }

    fn save(&self, token: &AccessToken) -> io::Result<()> {
        self.token.send_replace(Some(token.clone()));
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        self.token.send_replace(None);
        Ok(())
    }
}

/// JSON token file shared by every process of the same user.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: StdMutex<()>,
}

impl FileTokenStore {
    /// Store backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: StdMutex::new(()),
        }
    }

    /// Default location under the user's config directory.
    pub fn default_path() -> PathBuf {
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("vigil").join("session.json"))
            .unwrap_or_else(|| PathBuf::from("./vigil-session.json"))
    }

    /// Location of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SharedTokenStore for FileTokenStore {
    fn load(&self) -> Option<AccessToken> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(target: "vigil::token", path = %self.path.display(), error = %err, "ignoring unreadable token file");
                None
            }
        }
    }

    fn save(&self, token: &AccessToken) -> io::Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| io::Error::other("token store lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename so concurrent readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(token).map_err(io::Error::other)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}
