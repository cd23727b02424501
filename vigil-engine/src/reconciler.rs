//! Reconciliation of snapshot polling and realtime push into one view.
//!
//! A running [`Reconciler`] owns five background tasks per scope: the push
//! pump, the safety-net poll, the age-out ticker, the channel health watcher
//! and the session watcher. All of them share one [`CancellationToken`];
//! every write into the store checks it first so results that arrive after
//! teardown are ignored.

use std::{fmt, sync::Arc};

use shared::{
    config::ReconcilerConfig,
    errors::{ChannelError, ConfigError, ErrorKind, FetchError},
    models::{ActiveView, ChannelPhase, ChannelState, ConnectionHealth, LocationPatch, Viewport},
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{Identity, RealtimeChannel},
    clock::{Clock, SystemClock},
    snapshot::SnapshotFetcher,
    store::LocationStore,
    token::{SessionState, TokenLifecycleGuard},
};

/// Failures surfaced by [`Reconciler`] operations.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The session can no longer produce accepted tokens.
    #[error("session expired: {0}")]
    SessionExpired(FetchError),

    /// The operation needs a started reconciler.
    #[error("reconciler is not running")]
    NotRunning,

    /// Invalid reconciler settings.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct Inner {
    store: Mutex<LocationStore>,
    fetcher: SnapshotFetcher,
    channel: RealtimeChannel,
    tokens: Arc<TokenLifecycleGuard>,
    clock: Arc<dyn Clock>,
    settings: ReconcilerConfig,
    view: watch::Sender<ActiveView>,
    health: watch::Sender<ConnectionHealth>,
}

struct Run {
    scope: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Fuses the snapshot poll and the realtime channel into one active view
/// per scope, and derives user-facing connection health.
pub struct Reconciler {
    inner: Arc<Inner>,
    identity: Identity,
    run: Mutex<Option<Run>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("identity", &self.identity)
            .field("settings", &self.inner.settings)
            .field("health", &*self.inner.health.borrow())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// # Errors
    /// Returns an error when the staleness horizon in `settings` is negative.
    pub fn new(
        settings: ReconcilerConfig,
        identity: Identity,
        fetcher: SnapshotFetcher,
        channel: RealtimeChannel,
        tokens: Arc<TokenLifecycleGuard>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(settings, identity, fetcher, channel, tokens, Arc::new(SystemClock))
    }

    /// # Errors
    /// Returns an error when the staleness horizon in `settings` is negative.
    pub fn with_clock(
        settings: ReconcilerConfig,
        identity: Identity,
        fetcher: SnapshotFetcher,
        channel: RealtimeChannel,
        tokens: Arc<TokenLifecycleGuard>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if settings.poll_interval_ms == 0 || settings.prune_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "reconciler",
                "poll and prune intervals must be positive",
            ));
        }
        let store = LocationStore::new(settings.staleness_policy()?);
        let (view, _) = watch::channel(ActiveView::default());
        let (health, _) = watch::channel(ConnectionHealth::Stopped);
        Ok(Self {
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                fetcher,
                channel,
                tokens,
                clock,
                settings,
                view,
                health,
            }),
            identity,
            run: Mutex::new(None),
        })
    }

    /// Starts reconciling `scope`, replacing any other running scope.
    ///
    /// # Errors
    /// Returns [`ReconcileError::SessionExpired`] when the bootstrap fetch is
    /// refused for authentication reasons. Network and server failures are
    /// logged and the periodic poll recovers from them.
    pub async fn start(&self, scope: &str) -> Result<(), ReconcileError> {
        let cancel = CancellationToken::new();
        let previous = {
            let mut run = self.run.lock().await;
            // An expired run keeps its slot until replaced, so it never counts as running.
            if run
                .as_ref()
                .is_some_and(|current| current.scope == scope && !current.cancel.is_cancelled())
            {
                debug!(target: "vigil::reconciler", scope, "already reconciling scope");
                return Ok(());
            }
            run.replace(Run {
                scope: scope.to_string(),
                cancel: cancel.clone(),
                tasks: Vec::new(),
            })
        };
        if let Some(previous) = previous {
            self.teardown(previous);
            self.inner.store.lock().await.clear();
            // A channel halted on auth only clears the flag once the disconnect lands.
            let _ = self
                .inner
                .channel
                .watch_state()
                .wait_for(|state| !state.auth_failed)
                .await;
        }

        info!(target: "vigil::reconciler", scope, "starting reconciliation");
        self.inner.view.send_replace(ActiveView {
            scope: scope.to_string(),
            records: Vec::new(),
            computed_at: None,
        });
        self.inner
            .health
            .send_replace(ConnectionHealth::Reconnecting { attempt: 0 });

        match self.inner.fetch_with_reauth(scope).await {
            Ok(patches) => self.inner.merge(scope, patches, &cancel).await,
            Err(err) if err.kind() == ErrorKind::Auth => {
                self.inner.expire_session(&cancel, &err);
                let mut run = self.run.lock().await;
                if run.as_ref().is_some_and(|current| current.scope == scope) {
                    run.take();
                }
                return Err(ReconcileError::SessionExpired(err));
            }
            Err(err) => {
                warn!(target: "vigil::reconciler", scope, error = %err, "bootstrap snapshot failed; continuing with polling");
            }
        }

        if cancel.is_cancelled() {
            debug!(target: "vigil::reconciler", scope, "stopped during bootstrap");
            return Ok(());
        }

        let (listener, patches) = mpsc::unbounded_channel();
        self.inner.channel.subscribe(scope, listener);
        self.inner.channel.connect(self.identity.clone());

        let tasks = vec![
            tokio::spawn(Arc::clone(&self.inner).pump(scope.to_string(), patches, cancel.clone())),
            tokio::spawn(Arc::clone(&self.inner).poll(scope.to_string(), cancel.clone())),
            tokio::spawn(Arc::clone(&self.inner).age_out(scope.to_string(), cancel.clone())),
            tokio::spawn(Arc::clone(&self.inner).watch_channel(cancel.clone())),
            tokio::spawn(Arc::clone(&self.inner).watch_session(cancel.clone())),
        ];

        let mut run = self.run.lock().await;
        match run.as_mut() {
            Some(current) if !cancel.is_cancelled() => {
                current.tasks = tasks;
            }
            _ => {
                debug!(target: "vigil::reconciler", scope, "stopped during bootstrap");
                for task in tasks {
                    task.abort();
                }
            }
        }
        Ok(())
    }

    /// Stops every background task and disconnects the channel. Safe in any
    /// state, including mid-fetch.
    pub async fn stop(&self) {
        let Some(run) = self.run.lock().await.take() else {
            return;
        };
        self.teardown(run);
        self.inner.health.send_replace(ConnectionHealth::Stopped);
    }

    fn teardown(&self, run: Run) {
        run.cancel.cancel();
        self.inner.channel.unsubscribe(run.scope.as_str());
        self.inner.channel.disconnect();
        for task in run.tasks {
            task.abort();
        }
        info!(target: "vigil::reconciler", scope = %run.scope, "reconciliation stopped");
    }

    /// Fetches immediately and returns the viewport fitted to the result.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotRunning`] before `start`, or
    /// [`ReconcileError::SessionExpired`] when the fetch is refused.
    pub async fn refresh_now(&self) -> Result<Viewport, ReconcileError> {
        let (scope, cancel) = {
            let run = self.run.lock().await;
            let run = run.as_ref().ok_or(ReconcileError::NotRunning)?;
            (run.scope.clone(), run.cancel.clone())
        };

        match self.inner.fetch_with_reauth(&scope).await {
            Ok(patches) => self.inner.merge(&scope, patches, &cancel).await,
            Err(err) if err.kind() == ErrorKind::Auth => {
                self.inner.expire_session(&cancel, &err);
                return Err(ReconcileError::SessionExpired(err));
            }
            Err(err) => {
                warn!(target: "vigil::reconciler", scope = %scope, error = %err, "refresh failed; recentering on current view");
            }
        }
        Ok(self.viewport())
    }

    /// Change notification for the active set.
    pub fn view(&self) -> watch::Receiver<ActiveView> {
        self.inner.view.subscribe()
    }

    /// Change notification for connection health.
    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.inner.health.subscribe()
    }

    /// Viewport fitted to the current active set, or the configured default.
    pub fn viewport(&self) -> Viewport {
        Viewport::fit(
            &self.inner.view.borrow().records,
            self.inner.settings.default_viewport(),
        )
    }

    /// # Errors
    /// Returns [`ChannelError::NotConnected`] unless the channel is connected.
    pub async fn report_own_location(&self, latitude: f64, longitude: f64) -> Result<(), ChannelError> {
        self.inner.channel.publish_location(latitude, longitude).await
    }

    /// Scope of the current run, if any.
    pub async fn scope(&self) -> Option<String> {
        self.run.lock().await.as_ref().map(|run| run.scope.clone())
    }

    /// Raw state of the underlying channel.
    pub fn channel_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.channel.watch_state()
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
            for task in run.tasks {
                task.abort();
            }
        }
    }
}

/// Maps channel state to user-facing health; `None` keeps the current value.
pub fn health_for(state: &ChannelState, max_attempts: u32) -> Option<ConnectionHealth> {
    if state.auth_failed {
        return Some(ConnectionHealth::SessionExpired);
    }
    match state.phase {
        ChannelPhase::Connected => Some(ConnectionHealth::Live),
        ChannelPhase::Connecting | ChannelPhase::Backoff if state.reconnect_attempt >= max_attempts => {
            Some(ConnectionHealth::PollingOnly)
        }
        ChannelPhase::Connecting | ChannelPhase::Backoff => Some(ConnectionHealth::Reconnecting {
            attempt: state.reconnect_attempt,
        }),
        ChannelPhase::Disconnected => None,
    }
}

impl Inner {
    /// Fetches once more when the server rejected a token the guard can
    /// still replace.
    async fn fetch_with_reauth(&self, scope: &str) -> Result<Vec<LocationPatch>, FetchError> {
        match self.fetcher.fetch(scope).await {
            Err(err) if err.kind() == ErrorKind::Auth && self.tokens.is_session_valid() => {
                debug!(target: "vigil::reconciler", scope, "token rejected; fetching again with a refreshed token");
                self.fetcher.fetch(scope).await
            }
            other => other,
        }
    }

    async fn merge(&self, scope: &str, patches: Vec<LocationPatch>, cancel: &CancellationToken) {
        let mut store = self.store.lock().await;
        if cancel.is_cancelled() {
            debug!(target: "vigil::reconciler", scope, "discarding result that arrived after teardown");
            return;
        }
        let mut changed = 0_usize;
        for patch in patches {
            if store.merge(patch).changed() {
                changed += 1;
            }
        }
        debug!(target: "vigil::reconciler", scope, changed, "merged updates");
        self.publish(scope, &mut store);
    }

    async fn recompute(&self, scope: &str, cancel: &CancellationToken) {
        let mut store = self.store.lock().await;
        if !cancel.is_cancelled() {
            self.publish(scope, &mut store);
        }
    }

    fn publish(&self, scope: &str, store: &mut LocationStore) {
        let now = self.clock.now();
        let records = store.active_snapshot(now);
        self.view.send_if_modified(|view| {
            if view.scope == scope && view.records == records {
                return false;
            }
            view.scope = scope.to_string();
            view.records = records;
            view.computed_at = Some(now);
            true
        });
    }

    fn expire_session(&self, cancel: &CancellationToken, reason: &dyn fmt::Display) {
        cancel.cancel();
        self.health.send_replace(ConnectionHealth::SessionExpired);
        warn!(target: "vigil::reconciler", reason = %reason, "session expired; background work halted");
    }

    async fn pump(
        self: Arc<Self>,
        scope: String,
        mut patches: mpsc::UnboundedReceiver<LocationPatch>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                patch = patches.recv() => {
                    let Some(patch) = patch else { break };
                    let mut batch = vec![patch];
                    while let Ok(more) = patches.try_recv() {
                        batch.push(more);
                    }
                    self.merge(&scope, batch, &cancel).await;
                }
            }
        }
    }

    async fn poll(self: Arc<Self>, scope: String, cancel: CancellationToken) {
        let period = self.settings.poll_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match self.fetch_with_reauth(&scope).await {
                    Ok(patches) => self.merge(&scope, patches, &cancel).await,
                    Err(err) if err.kind() == ErrorKind::Auth => {
                        self.expire_session(&cancel, &err);
                        break;
                    }
                    Err(err) => {
                        warn!(target: "vigil::reconciler", scope = %scope, error = %err, "snapshot poll failed");
                    }
                },
            }
        }
    }

    async fn age_out(self: Arc<Self>, scope: String, cancel: CancellationToken) {
        let period = self.settings.prune_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.recompute(&scope, &cancel).await,
            }
        }
    }

    async fn watch_channel(self: Arc<Self>, cancel: CancellationToken) {
        let mut state = self.channel.watch_state();
        let max_attempts = self.settings.max_reconnect_attempts;
        // The channel may already be past Connecting by the time this task runs.
        self.apply_channel_state(&state.borrow_and_update(), max_attempts);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_channel_state(&state.borrow_and_update(), max_attempts);
                }
            }
        }
    }

    fn apply_channel_state(&self, state: &ChannelState, max_attempts: u32) {
        let Some(next) = health_for(state, max_attempts) else {
            return;
        };
        self.health.send_if_modified(|health| {
            if health.is_terminal() || *health == next {
                return false;
            }
            info!(target: "vigil::reconciler", from = health.label(), to = next.label(), "connection health changed");
            *health = next;
            true
        });
    }

    async fn watch_session(self: Arc<Self>, cancel: CancellationToken) {
        let mut session = self.tokens.session_state();
        loop {
            if *session.borrow_and_update() == SessionState::Invalid {
                self.expire_session(&cancel, &"token refresh failed");
                break;
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = session.changed() => if changed.is_err() { break },
            }
        }
    }
}
