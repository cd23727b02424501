//! Realtime push channel.
//!
//! [`RealtimeChannel`] is a handle to a driver task that owns the transport
//! session, the listeners and the reconnect timer. Commands travel over an
//! unbounded mpsc; the observable [`ChannelState`] is published through a
//! `watch` channel.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Backoff -> Connecting -> ...
//! ```

pub mod backoff;
pub mod sse;
pub mod transport;

use std::{collections::BTreeMap, sync::Arc};

use metrics::counter;
use shared::{
    errors::{AuthError, ChannelError, ErrorKind},
    models::{ChannelPhase, ChannelState, LocationPatch, LocationRow, Position},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, trace, warn};

pub use backoff::BackoffPolicy;
pub use sse::{SseDecoder, SseEvent, SseTransport};
pub use transport::{Handshake, Identity, InboundFrame, Transport, TransportSession};

use crate::{
    clock::{Clock, SystemClock},
    store::report_data_quality,
    token::{AccessToken, SessionState, TokenLifecycleGuard},
};

enum Command {
    Connect(Identity),
    Subscribe {
        scope: String,
        listener: mpsc::UnboundedSender<LocationPatch>,
    },
    Unsubscribe(String),
    Publish {
        position: Position,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Disconnect,
}

/// Handle to a realtime channel driver.
///
/// Dropping the handle stops the driver.
#[derive(Debug)]
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    driver: JoinHandle<()>,
}

impl RealtimeChannel {
    /// Spawns the driver task on the current runtime.
    pub fn spawn<T: Transport>(
        transport: T,
        policy: BackoffPolicy,
        tokens: Arc<TokenLifecycleGuard>,
    ) -> Self {
        Self::spawn_with_clock(transport, policy, tokens, Arc::new(SystemClock))
    }

    /// Like [`RealtimeChannel::spawn`], with an explicit wall clock for
    /// payloads that carry no timestamp.
    pub fn spawn_with_clock<T: Transport>(
        transport: T,
        policy: BackoffPolicy,
        tokens: Arc<TokenLifecycleGuard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::default());
        let driver = Driver {
            transport: Arc::new(transport),
            policy,
            tokens,
            clock,
            state: state_tx,
            identity: None,
            session: None,
            pending: None,
            retry_at: None,
            listeners: BTreeMap::new(),
        };
        let driver = tokio::spawn(driver.run(receiver));
        Self {
            commands,
            state,
            driver,
        }
    }

    /// Starts connecting unless already connected, connecting or scheduled to
    /// reconnect.
    pub fn connect(&self, identity: Identity) {
        self.send(Command::Connect(identity));
    }

    /// Registers `listener` for `scope`; issued immediately when connected,
    /// otherwise on the next successful connect.
    pub fn subscribe(&self, scope: impl Into<String>, listener: mpsc::UnboundedSender<LocationPatch>) {
        self.send(Command::Subscribe {
            scope: scope.into(),
            listener,
        });
    }

    /// Drops the listener and subscription for `scope`.
    pub fn unsubscribe(&self, scope: impl Into<String>) {
        self.send(Command::Unsubscribe(scope.into()));
    }

    /// Emits the caller's own location.
    ///
    /// # Errors
    /// Returns [`ChannelError::NotConnected`] unless the channel is connected,
    /// [`ChannelError::Protocol`] for invalid coordinates, or the transport
    /// failure.
    pub async fn publish_location(&self, latitude: f64, longitude: f64) -> Result<(), ChannelError> {
        let position = Position::checked("self", latitude, longitude)
            .map_err(|err| ChannelError::Protocol(err.to_string()))?;
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Publish { position, reply }).is_err() {
            return Err(ChannelError::Closed);
        }
        response.await.unwrap_or(Err(ChannelError::Closed))
    }

    /// Cancels any pending reconnect or handshake and drops every subscription.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    /// Change notification for the channel state.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(target: "vigil::channel", "channel driver is gone; command ignored");
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

enum AttemptError {
    Token(AuthError),
    Handshake { token: AccessToken, error: ChannelError },
}

type Attempt<S> = JoinHandle<Result<S, AttemptError>>;

struct Driver<T: Transport> {
    transport: Arc<T>,
    policy: BackoffPolicy,
    tokens: Arc<TokenLifecycleGuard>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<ChannelState>,
    identity: Option<Identity>,
    session: Option<T::Session>,
    pending: Option<Attempt<T::Session>>,
    retry_at: Option<Instant>,
    listeners: BTreeMap<String, mpsc::UnboundedSender<LocationPatch>>,
}

impl<T: Transport> Drop for Driver<T> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }
}

async fn next_attempt<S>(pending: &mut Option<Attempt<S>>) -> Result<Result<S, AttemptError>, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn next_frame<S: TransportSession>(
    session: &mut Option<S>,
) -> Option<Result<InboundFrame, ChannelError>> {
    match session {
        Some(session) => session.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(retry_at: Option<Instant>) {
    match retry_at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<T: Transport> Driver<T> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut session_state = self.tokens.session_state();
        let mut session_watch_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        self.teardown();
                        break;
                    }
                },
                result = next_attempt(&mut self.pending) => {
                    self.pending = None;
                    self.on_attempt(result).await;
                }
                frame = next_frame(&mut self.session) => self.on_frame(frame),
                () = retry_due(self.retry_at) => {
                    self.retry_at = None;
                    self.begin_attempt();
                }
                changed = session_state.changed(), if session_watch_open => {
                    if changed.is_err() {
                        session_watch_open = false;
                    } else if *session_state.borrow_and_update() == SessionState::Invalid {
                        self.halt_auth(&AuthError::SessionInvalid);
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(identity) => {
                if self.state.borrow().phase != ChannelPhase::Disconnected {
                    trace!(target: "vigil::channel", "connect ignored; channel already active");
                    return;
                }
                self.identity = Some(identity);
                self.state.send_modify(|state| {
                    state.reconnect_attempt = 0;
                    state.auth_failed = false;
                });
                self.begin_attempt();
            }
            Command::Subscribe { scope, listener } => {
                self.listeners.insert(scope.clone(), listener);
                self.state.send_modify(|state| {
                    state.subscribed_scopes.insert(scope.clone());
                });
                if let Some(session) = self.session.as_mut() {
                    if let Err(err) = session.subscribe(&scope).await {
                        warn!(target: "vigil::channel", scope = %scope, error = %err, "subscribe failed; will retry on reconnect");
                    }
                }
            }
            Command::Unsubscribe(scope) => {
                self.listeners.remove(&scope);
                self.state.send_modify(|state| {
                    state.subscribed_scopes.remove(&scope);
                });
                if let Some(session) = self.session.as_mut() {
                    if let Err(err) = session.unsubscribe(&scope).await {
                        debug!(target: "vigil::channel", scope = %scope, error = %err, "unsubscribe failed");
                    }
                }
            }
            Command::Publish { position, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.publish_location(position).await,
                    None => Err(ChannelError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Disconnect => {
                self.teardown();
                info!(target: "vigil::channel", "channel disconnected");
            }
        }
    }

    fn begin_attempt(&mut self) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        let attempt = self.state.borrow().reconnect_attempt;
        debug!(target: "vigil::channel", attempt, role = %identity.role, "connecting");

        let transport = Arc::clone(&self.transport);
        let tokens = Arc::clone(&self.tokens);
        self.pending = Some(tokio::spawn(async move {
            let token = tokens.valid_token().await.map_err(AttemptError::Token)?;
            transport
                .connect(Handshake {
                    token: token.clone(),
                    identity,
                })
                .await
                .map_err(|error| AttemptError::Handshake { token, error })
        }));
        self.state.send_modify(|state| {
            state.phase = ChannelPhase::Connecting;
            state.retry_in = None;
        });
    }

    async fn on_attempt(&mut self, result: Result<Result<T::Session, AttemptError>, JoinError>) {
        match result {
            Ok(Ok(mut session)) => {
                let scopes = self.state.borrow().subscribed_scopes.clone();
                for scope in &scopes {
                    if let Err(err) = session.subscribe(scope).await {
                        warn!(target: "vigil::channel", scope = %scope, error = %err, "resubscribe failed");
                    }
                }
                self.session = Some(session);
                self.state.send_modify(|state| {
                    state.phase = ChannelPhase::Connected;
                    state.reconnect_attempt = 0;
                    state.retry_in = None;
                });
                info!(target: "vigil::channel", scopes = scopes.len(), "channel connected");
            }
            Ok(Err(AttemptError::Token(err))) => self.halt_auth(&err),
            Ok(Err(AttemptError::Handshake { token, error })) => {
                if error.kind() == ErrorKind::Auth {
                    self.tokens.reject(&token).await;
                }
                self.schedule_retry(&error);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => self.schedule_retry(&ChannelError::Protocol(err.to_string())),
        }
    }

    fn on_frame(&mut self, frame: Option<Result<InboundFrame, ChannelError>>) {
        match frame {
            Some(Ok(InboundFrame::Location(value))) => self.deliver(value),
            Some(Ok(InboundFrame::Heartbeat)) => trace!(target: "vigil::channel", "heartbeat"),
            Some(Ok(InboundFrame::Closed { reason })) => {
                self.session = None;
                self.schedule_retry(&ChannelError::Server {
                    status: 503,
                    message: format!("server closed the channel: {reason}"),
                });
            }
            Some(Err(err)) => {
                self.session = None;
                self.schedule_retry(&err);
            }
            None => {
                self.session = None;
                self.schedule_retry(&ChannelError::Closed);
            }
        }
    }

    fn deliver(&mut self, value: serde_json::Value) {
        let arrival = self.clock.now();
        let patch = match LocationRow::from_value(value).and_then(|row| row.into_patch(arrival)) {
            Ok(patch) => patch,
            Err(err) => {
                report_data_quality("channel", &err);
                return;
            }
        };

        match patch.scope.clone() {
            Some(scope) => match self.listeners.get(&scope) {
                Some(listener) => {
                    let _ = listener.send(patch);
                }
                None => trace!(target: "vigil::channel", scope = %scope, "no listener for scope"),
            },
            None => {
                for (scope, listener) in &self.listeners {
                    let mut patch = patch.clone();
                    patch.ensure_scope(scope);
                    let _ = listener.send(patch);
                }
            }
        }
    }

    fn schedule_retry(&mut self, error: &ChannelError) {
        let attempt = self.state.borrow().reconnect_attempt;
        let delay = self.policy.delay_for(attempt);
        self.retry_at = Some(Instant::now() + delay);
        self.state.send_modify(|state| {
            state.phase = ChannelPhase::Backoff;
            state.reconnect_attempt = attempt.saturating_add(1);
            state.retry_in = Some(delay);
        });
        counter!("vigil_channel_reconnects_total").increment(1);
        warn!(
            target: "vigil::channel",
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "channel down; scheduling reconnect"
        );
    }

    fn halt_auth(&mut self, error: &AuthError) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.session = None;
        self.retry_at = None;
        self.state.send_modify(|state| {
            state.phase = ChannelPhase::Disconnected;
            state.retry_in = None;
            state.auth_failed = true;
        });
        warn!(target: "vigil::channel", error = %error, "channel halted; session is not valid");
    }

    fn teardown(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        self.session = None;
        self.retry_at = None;
        self.listeners.clear();
        self.state.send_replace(ChannelState::default());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::token::{
        MemoryTokenStore,
        tests::{CountingRefresher, ready_guard},
    };
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use serde_json::json;
    use std::{
        collections::VecDeque,
        sync::Mutex as StdMutex,
        time::Duration,
    };

    /// Scripted in-memory transport.
    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        script: Arc<StdMutex<VecDeque<Result<(), ChannelError>>>>,
        pub attempts: Arc<StdMutex<Vec<(Instant, String)>>>,
        pub log: Arc<StdMutex<Vec<String>>>,
        server: Arc<StdMutex<Option<mpsc::UnboundedSender<Result<InboundFrame, ChannelError>>>>>,
    }

    impl FakeTransport {
        pub(crate) fn scripted(outcomes: impl IntoIterator<Item = Result<(), ChannelError>>) -> Self {
            let fake = Self::default();
            fake.script.lock().unwrap().extend(outcomes);
            fake
        }

        pub(crate) fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }

        pub(crate) fn push(&self, frame: InboundFrame) {
            if let Some(server) = self.server.lock().unwrap().as_ref() {
                let _ = server.send(Ok(frame));
            }
        }

        /// Ends the current session as if the server hung up.
        pub(crate) fn hang_up(&self) {
            self.server.lock().unwrap().take();
        }

        pub(crate) fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    pub(crate) struct FakeSession {
        frames: mpsc::UnboundedReceiver<Result<InboundFrame, ChannelError>>,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Session = FakeSession;

        async fn connect(&self, handshake: Handshake) -> Result<FakeSession, ChannelError> {
            self.attempts
                .lock()
                .unwrap()
                .push((Instant::now(), handshake.token.value.clone()));
            let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            outcome?;
            let (server, frames) = mpsc::unbounded_channel();
            *self.server.lock().unwrap() = Some(server);
            Ok(FakeSession {
                frames,
                log: Arc::clone(&self.log),
            })
        }
    }

    #[async_trait]
    impl TransportSession for FakeSession {
        async fn subscribe(&mut self, scope: &str) -> Result<(), ChannelError> {
            self.log.lock().unwrap().push(format!("subscribe:{scope}"));
            Ok(())
        }

        async fn unsubscribe(&mut self, scope: &str) -> Result<(), ChannelError> {
            self.log.lock().unwrap().push(format!("unsubscribe:{scope}"));
            Ok(())
        }

        async fn publish_location(&mut self, position: Position) -> Result<(), ChannelError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("publish:{},{}", position.latitude, position.longitude));
            Ok(())
        }

        async fn next_frame(&mut self) -> Option<Result<InboundFrame, ChannelError>> {
            self.frames.recv().await
        }
    }

    fn network_down() -> Result<(), ChannelError> {
        Err(ChannelError::Network("connection refused".into()))
    }

    fn identity() -> Identity {
        Identity::new("dispatch-1", "medic")
    }

    async fn wait_phase(channel: &RealtimeChannel, phase: ChannelPhase) -> ChannelState {
        channel
            .watch_state()
            .wait_for(|state| state.phase == phase)
            .await
            .unwrap()
            .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_resets_after_connect() {
        let fake = FakeTransport::scripted([network_down(), network_down(), network_down()]);
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());

        channel.connect(identity());
        let connected = wait_phase(&channel, ChannelPhase::Connected).await;
        assert_eq!(connected.reconnect_attempt, 0);

        let times: Vec<Instant> = fake.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect();
        let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![1_000, 2_000, 4_000]);

        fake.hang_up();
        let backoff = wait_phase(&channel, ChannelPhase::Backoff).await;
        assert_eq!(backoff.retry_in, Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.reconnect_attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_a_noop_while_active() {
        let fake = FakeTransport::scripted([network_down()]);
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());

        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Backoff).await;
        channel.connect(identity());
        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Connected).await;
        assert_eq!(fake.attempt_count(), 2);

        channel.connect(identity());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_backoff_stops_reconnecting() {
        let fake = FakeTransport::scripted(std::iter::repeat_with(network_down).take(100));
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());

        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Backoff).await;
        channel.disconnect();
        let state = wait_phase(&channel, ChannelPhase::Disconnected).await;
        assert_eq!(state, ChannelState::default());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fake.attempt_count(), 1);
        assert_eq!(channel.state().phase, ChannelPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_reissued_after_reconnect() {
        let fake = FakeTransport::default();
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());
        let (listener, _rx) = mpsc::unbounded_channel();

        channel.subscribe("medic", listener);
        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Connected).await;

        fake.hang_up();
        wait_phase(&channel, ChannelPhase::Backoff).await;
        let state = wait_phase(&channel, ChannelPhase::Connected).await;
        assert!(state.subscribed_scopes.contains("medic"));
        assert_eq!(fake.log(), vec!["subscribe:medic", "subscribe:medic"]);

        channel.unsubscribe("medic");
        let state = channel
            .watch_state()
            .wait_for(|state| state.subscribed_scopes.is_empty())
            .await
            .unwrap()
            .clone();
        assert!(state.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_validated_and_scoped() {
        let fake = FakeTransport::default();
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());
        let (listener, mut rx) = mpsc::unbounded_channel();
        channel.subscribe("medic", listener);
        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Connected).await;

        fake.push(InboundFrame::Location(json!({"userId": "r1", "lat": 1.5, "lng": 2.5})));
        fake.push(InboundFrame::Location(json!({"lat": 1.0, "lng": 2.0})));
        fake.push(InboundFrame::Heartbeat);
        fake.push(InboundFrame::Location(json!({"id": "r2", "lat": 3, "lng": 4, "role": "fire"})));
        fake.push(InboundFrame::Location(json!({"id": "r3", "lat": 5, "lng": 6, "role": "medic"})));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.subject_id, "r1");
        assert_eq!(first.scope.as_deref(), Some("medic"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.subject_id, "r3");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_requires_connection() {
        let fake = FakeTransport::default();
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());

        assert_eq!(
            channel.publish_location(1.0, 2.0).await,
            Err(ChannelError::NotConnected)
        );

        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Connected).await;
        channel.publish_location(1.0, 2.0).await.unwrap();
        assert_eq!(fake.log(), vec!["publish:1,2"]);

        assert!(matches!(
            channel.publish_location(f64::NAN, 2.0).await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_handshake_refreshes_the_token() {
        let fake = FakeTransport::scripted([Err(ChannelError::Auth("expired".into()))]);
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), ready_guard());

        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Backoff).await;
        wait_phase(&channel, ChannelPhase::Connected).await;

        let tokens: Vec<String> = fake.attempts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(tokens, vec!["ready".to_string(), "token-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_session_halts_without_retrying() {
        let guard = Arc::new(TokenLifecycleGuard::new(
            Arc::new(CountingRefresher::failing()),
            Arc::new(MemoryTokenStore::default()),
            TimeDelta::seconds(30),
        ));
        let fake = FakeTransport::default();
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), guard);

        channel.connect(identity());
        let state = channel
            .watch_state()
            .wait_for(|state| state.auth_failed)
            .await
            .unwrap()
            .clone();
        assert_eq!(state.phase, ChannelPhase::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fake.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_invalidation_halts_a_connected_channel() {
        let guard = ready_guard();
        let fake = FakeTransport::default();
        let channel = RealtimeChannel::spawn(fake.clone(), BackoffPolicy::default(), Arc::clone(&guard));
        channel.connect(identity());
        wait_phase(&channel, ChannelPhase::Connected).await;

        guard.invalidate().await;
        let state = channel
            .watch_state()
            .wait_for(|state| state.auth_failed)
            .await
            .unwrap()
            .clone();
        assert_eq!(state.phase, ChannelPhase::Disconnected);
    }
}
