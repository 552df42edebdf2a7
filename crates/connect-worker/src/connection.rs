// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker connection orchestrator.
//!
//! [`WorkerConnection`] owns the reconnect loop. One connection attempt at a
//! time goes through the HTTP start request, the socket open and the setup
//! handshake; a successful attempt becomes a session served by an
//! [`ActiveHandler`] until it is lost, drained or shut down.
//!
//! Draining hands over without dropping work: the draining session keeps
//! serving while a replacement connects, and outgoing traffic switches to the
//! replacement once it is ready.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use connect_protocol::Envelope;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::ApiClient;
use crate::buffer::ReplyBuffer;
use crate::config::ConnectConfig;
use crate::credentials::CredentialPair;
use crate::error::{ConnectError, Result};
use crate::events::{ConnectionEvents, NoopEvents};
use crate::executor::HandlerRegistry;
use crate::handler::active::{ActiveHandler, DrainCallback};
use crate::handler::setup::{SetupHandler, WorkerIdentity, system_attributes};
use crate::inflight::InflightCounter;
use crate::lease::LeaseTable;
use crate::signals;
use crate::socket::{EnvelopeSink, SocketEvent, SocketManager, SocketSender};
use crate::state::{ConnectionState, ConnectionStateMachine, StateEvent, StateTransition};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Outgoing traffic goes through whichever socket is currently installed.
#[derive(Debug, Default)]
struct SocketSlot {
    current: Mutex<Option<SocketSender>>,
}

impl SocketSlot {
    fn install(&self, sender: SocketSender) {
        *lock(&self.current) = Some(sender);
    }

    fn clear(&self) {
        *lock(&self.current) = None;
    }
}

impl EnvelopeSink for SocketSlot {
    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let sender = lock(&self.current).clone();
        match sender {
            Some(sender) => sender.send_message(&envelope),
            None => Err(ConnectError::SocketNotOpen),
        }
    }
}

/// Reported by session tasks to the reconnect loop.
#[derive(Debug)]
enum SessionSignal {
    /// The gateway asked this connection to drain
    Draining(String),
    /// The connection is gone
    Ended { connection_id: String, reason: String },
}

/// A connection that completed setup but does not read gateway messages yet.
///
/// The reader dispatches work immediately, so it must only start once the
/// socket is installed in the [`SocketSlot`].
struct PendingSession {
    connection_id: String,
    gateway_group: String,
    socket: SocketManager,
    reader: BoxFuture<'static, ()>,
}

impl PendingSession {
    fn serve(self) -> Session {
        Session {
            connection_id: self.connection_id,
            gateway_group: self.gateway_group,
            socket: self.socket,
            task: tokio::spawn(self.reader),
        }
    }
}

/// A connection that completed setup.
struct Session {
    connection_id: String,
    gateway_group: String,
    socket: SocketManager,
    task: JoinHandle<()>,
}

impl Session {
    async fn close(mut self) {
        self.socket.graceful_close().await;
        self.task.abort();
    }

    fn abort(mut self) {
        self.socket.force_close();
        self.task.abort();
    }
}

struct Shared {
    config: ConnectConfig,
    identity: WorkerIdentity,
    api: ApiClient,
    registry: HandlerRegistry,
    events: Arc<dyn ConnectionEvents>,
    state: Mutex<ConnectionStateMachine>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    credentials: Mutex<CredentialPair>,
    buffer: ReplyBuffer,
    leases: LeaseTable,
    inflight: InflightCounter,
    slot: Arc<SocketSlot>,
    excluded_gateways: Mutex<HashSet<String>>,
    connection_id: Mutex<Option<String>>,
    cancel: CancellationToken,
    closing: AtomicBool,
    run_task: Mutex<Option<JoinHandle<Vec<Session>>>>,
    signal_task: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn new(config: ConnectConfig, events: Arc<dyn ConnectionEvents>) -> Result<Self> {
        let api = ApiClient::new(config.api_base_url.clone(), config.environment.clone())?;
        let buffer = ReplyBuffer::new(api.clone());

        let instance_id = config
            .instance_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let identity = WorkerIdentity {
            instance_id,
            apps: config.apps.iter().map(|app| app.to_proto()).collect(),
            environment: config.environment.clone(),
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            system: system_attributes(),
            max_worker_concurrency: config.max_worker_concurrency,
        };

        let state_tx = Arc::new(watch::Sender::new(ConnectionState::Connecting));
        let mut state = ConnectionStateMachine::new();
        {
            let state_tx = state_tx.clone();
            let events = events.clone();
            state.on_transition(move |t: &StateTransition| {
                debug!(from = %t.from, to = %t.to, event = %t.event, "Connection state changed");
                state_tx.send_replace(t.to.external());
                events.on_state_change(t);
            });
        }

        let credentials =
            CredentialPair::new(config.signing_key.clone(), config.signing_key_fallback.clone());

        Ok(Self {
            registry: HandlerRegistry::from_apps(&config.apps),
            identity,
            api,
            events,
            state: Mutex::new(state),
            state_tx,
            credentials: Mutex::new(credentials),
            buffer,
            leases: LeaseTable::new(),
            inflight: InflightCounter::new(),
            slot: Arc::new(SocketSlot::default()),
            excluded_gateways: Mutex::new(HashSet::new()),
            connection_id: Mutex::new(None),
            cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
            run_task: Mutex::new(None),
            signal_task: Mutex::new(None),
            config,
        })
    }

    fn transition(&self, event: StateEvent) -> bool {
        lock(&self.state).transition(event)
    }

    fn internal_state(&self) -> ConnectionState {
        lock(&self.state).internal_state()
    }

    fn exclude_gateway(&self, group: &str) {
        if !group.is_empty() {
            debug!(gateway_group = %group, "Excluding gateway group");
            lock(&self.excluded_gateways).insert(group.to_string());
        }
    }

    /// The reconnect loop. Returns the sessions still open when it stops.
    async fn run(self: Arc<Self>) -> Vec<Session> {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let mut active: Option<Session> = None;
        let mut retiring: Option<Session> = None;
        let mut attempt: u32 = 0;
        let mut backed_off = false;

        'reconnect: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if backed_off && self.internal_state() == ConnectionState::Reconnecting {
                self.transition(StateEvent::RetryConnect);
            }
            backed_off = false;

            let connect = self.connect_once(signal_tx.clone());
            tokio::pin!(connect);
            let result = loop {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => break 'reconnect,

                    Some(signal) = signal_rx.recv() => self.on_retiring_signal(signal, &mut retiring),

                    result = &mut connect => break result,
                }
            };

            match result {
                Ok(pending) => {
                    attempt = 0;
                    self.slot.install(pending.socket.sender());
                    let session = pending.serve();
                    if let Some(old) = retiring.take() {
                        debug!(connection_id = %old.connection_id, "Closing drained connection");
                        old.close().await;
                    }

                    lock(&self.excluded_gateways).remove(&session.gateway_group);
                    *lock(&self.connection_id) = Some(session.connection_id.clone());

                    let event = if self.internal_state() == ConnectionState::Connecting {
                        StateEvent::ConnectionReady
                    } else {
                        StateEvent::NewConnectionReady
                    };
                    self.transition(event);
                    info!(connection_id = %session.connection_id, "Worker connected");
                    self.events.on_connected(&session.connection_id);

                    let flusher = self.clone();
                    tokio::spawn(async move {
                        let credential = lock(&flusher.credentials).current().to_string();
                        if let Err(e) = flusher.buffer.flush(&credential).await {
                            warn!(error = %e, "Failed to flush buffered replies");
                        }
                    });

                    active = Some(session);
                }
                Err(e) => {
                    if e.is_auth() {
                        self.transition(StateEvent::AuthFailed);
                        if lock(&self.credentials).switch_to_fallback() {
                            warn!(error = %e, "Authentication failed, switching to fallback signing key");
                            continue 'reconnect;
                        }
                    } else if e.is_connection_limit() {
                        warn!(error = %e, "Gateway connection limit reached");
                        self.transition(StateEvent::SetupFailed);
                    } else {
                        self.transition(StateEvent::SetupFailed);
                    }

                    let delay = self.config.reconnect_backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    self.events.on_reconnecting(attempt, delay);

                    if !self.sleep_unless_cancelled(delay, &mut signal_rx, &mut retiring).await {
                        break 'reconnect;
                    }
                    backed_off = true;
                    continue 'reconnect;
                }
            }

            // Serve the active session until it ends or drains.
            loop {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => break 'reconnect,

                    Some(signal) = signal_rx.recv() => match signal {
                        SessionSignal::Draining(id) if is_session(&active, &id) => {
                            info!(connection_id = %id, "Gateway draining connection, connecting replacement");
                            self.transition(StateEvent::DrainRequested);
                            self.events.on_draining();
                            retiring = active.take();
                            continue 'reconnect;
                        }
                        SessionSignal::Ended { connection_id, reason } if is_session(&active, &connection_id) => {
                            warn!(connection_id = %connection_id, reason = %reason, "Connection lost, reconnecting");
                            self.slot.clear();
                            if let Some(session) = active.take() {
                                session.abort();
                            }
                            self.transition(StateEvent::ConnectionLost);

                            // Lost connections wait the base delay before reconnecting.
                            let delay = self.config.reconnect_backoff.delay(0);
                            self.events.on_reconnecting(0, delay);
                            if !self.sleep_unless_cancelled(delay, &mut signal_rx, &mut retiring).await {
                                break 'reconnect;
                            }
                            continue 'reconnect;
                        }
                        other => debug!(signal = ?other, "Ignoring signal from a previous connection"),
                    },
                }
            }
        }

        active.into_iter().chain(retiring).collect()
    }

    /// Sleep for `delay` while still handling session signals. Returns
    /// `false` if the connection was cancelled first.
    async fn sleep_unless_cancelled(
        &self,
        delay: Duration,
        signal_rx: &mut mpsc::UnboundedReceiver<SessionSignal>,
        retiring: &mut Option<Session>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return false,

                Some(signal) = signal_rx.recv() => self.on_retiring_signal(signal, retiring),

                _ = &mut sleep => return true,
            }
        }
    }

    /// Handle a session signal while no session is active.
    fn on_retiring_signal(&self, signal: SessionSignal, retiring: &mut Option<Session>) {
        match signal {
            SessionSignal::Ended {
                connection_id,
                reason,
            } if is_session(retiring, &connection_id) => {
                warn!(
                    connection_id = %connection_id,
                    reason = %reason,
                    "Draining connection lost before its replacement was ready"
                );
                self.slot.clear();
                if let Some(session) = retiring.take() {
                    session.abort();
                }
                self.transition(StateEvent::ConnectionLost);
            }
            other => debug!(signal = ?other, "Ignoring signal while connecting"),
        }
    }

    /// One connection attempt: start request, socket open, setup handshake.
    #[instrument(skip_all)]
    async fn connect_once(
        self: &Arc<Self>,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Result<PendingSession> {
        let credential = lock(&self.credentials).current().to_string();
        let excluded: Vec<String> = lock(&self.excluded_gateways).iter().cloned().collect();

        let start = self.api.start(&credential, excluded).await?;
        let connection_id = start.connection_id.clone();
        let gateway_group = start.gateway_group.clone();
        debug!(
            connection_id = %connection_id,
            endpoint = %start.gateway_endpoint,
            "Opening gateway socket"
        );

        let (mut socket, mut socket_events) =
            match SocketManager::connect(&start.gateway_endpoint, self.config.socket_timeout()).await
            {
                Ok(pair) => pair,
                Err(e) => {
                    self.events.on_socket_error(&e.to_string());
                    self.exclude_gateway(&gateway_group);
                    return Err(e);
                }
            };
        self.events.on_socket_open(socket.url());

        let setup = SetupHandler::new(self.identity.connect_data(&start));
        let sender = socket.sender();
        let intervals = match tokio::time::timeout(
            self.config.setup_timeout(),
            setup.run(&sender, &mut socket_events),
        )
        .await
        {
            Ok(Ok(intervals)) => intervals,
            Ok(Err(e)) => {
                self.exclude_gateway(&gateway_group);
                socket.force_close();
                return Err(e);
            }
            Err(_) => {
                self.exclude_gateway(&gateway_group);
                socket.force_close();
                return Err(ConnectError::SetupTimeout(self.config.setup_timeout_ms));
            }
        };

        {
            let signals = signals.clone();
            let connection_id = connection_id.clone();
            socket.start_heartbeat(intervals.heartbeat, move || {
                let _ = signals.send(SessionSignal::Ended {
                    connection_id,
                    reason: ConnectError::HeartbeatMissed.to_string(),
                });
            });
        }

        let on_drain: DrainCallback = {
            let signals = signals.clone();
            let connection_id = connection_id.clone();
            Arc::new(move || {
                let _ = signals.send(SessionSignal::Draining(connection_id.clone()));
                async {}.boxed()
            })
        };

        let handler = ActiveHandler::new(
            self.slot.clone(),
            self.registry.clone(),
            self.leases.clone(),
            self.inflight.clone(),
            self.buffer.clone(),
        )
        .with_heartbeat(socket.heartbeat_handle())
        .with_events(self.events.clone())
        .with_drain_callback(on_drain)
        .with_extend_lease_interval(intervals.extend_lease)
        .with_reply_ack_timeout(self.config.reply_ack_timeout())
        .with_shutdown_token(self.cancel.clone());

        let events = self.events.clone();
        let session_id = connection_id.clone();
        let reader = async move {
            let reason = loop {
                match socket_events.recv().await {
                    Some(SocketEvent::Message(envelope)) => handler.handle(envelope).await,
                    Some(SocketEvent::Closed(reason)) => {
                        events.on_socket_close(reason.as_deref());
                        break reason.unwrap_or_else(|| "socket closed".to_string());
                    }
                    Some(SocketEvent::Error(e)) => {
                        events.on_socket_error(&e);
                        break e;
                    }
                    None => break "socket closed".to_string(),
                }
            };
            let _ = signals.send(SessionSignal::Ended {
                connection_id: session_id,
                reason,
            });
        };

        Ok(PendingSession {
            connection_id,
            gateway_group,
            socket,
            reader: reader.boxed(),
        })
    }

    async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            let mut rx = self.state_tx.subscribe();
            let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
            return Ok(());
        }

        info!("Closing worker connection");
        self.cancel.cancel();
        self.transition(StateEvent::ShutdownRequested);

        let run_task = lock(&self.run_task).take();
        let sessions = match run_task {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "Reconnect loop ended abnormally");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let inflight = self.inflight.count();
        if inflight > 0 {
            info!(inflight, "Waiting for in-flight requests to finish");
        }
        self.inflight.wait().await;

        let (primary, fallback) = {
            let credentials = lock(&self.credentials);
            (
                credentials.primary().to_string(),
                credentials.fallback().map(str::to_string),
            )
        };
        let mut flushed = self.buffer.flush(&primary).await;
        if let Err(e) = &flushed {
            warn!(error = %e, "Flush with primary signing key failed");
            if let Some(fallback) = fallback {
                flushed = self.buffer.flush(&fallback).await;
            }
        }

        for session in sessions {
            session.close().await;
        }
        self.slot.clear();
        self.leases.clear();
        if let Some(handle) = lock(&self.signal_task).take() {
            handle.abort();
        }

        self.transition(StateEvent::ShutdownComplete);
        lock(&self.state).clear_listeners();
        info!("Worker connection closed");
        flushed
    }
}

fn is_session(session: &Option<Session>, connection_id: &str) -> bool {
    session
        .as_ref()
        .is_some_and(|s| s.connection_id == connection_id)
}

fn spawn_signal_listener(shared: &Arc<Shared>) -> Option<AbortHandle> {
    let watched = shared.config.shutdown_signals.clone();
    if watched.is_empty() {
        return None;
    }

    let weak: Weak<Shared> = Arc::downgrade(shared);
    let task = tokio::spawn(async move {
        match signals::wait_for_any(&watched).await {
            Ok(signal) => {
                info!(signal = signal.as_str(), "Shutdown signal received");
                if let Some(shared) = weak.upgrade() {
                    // Closing aborts this listener, so run it on its own task.
                    tokio::spawn(async move {
                        if let Err(e) = shared.close().await {
                            warn!(error = %e, "Graceful shutdown finished with errors");
                        }
                    });
                }
            }
            Err(e) => warn!(error = %e, "Failed to install shutdown signal handlers"),
        }
    });
    Some(task.abort_handle())
}

/// A worker connected to the gateway.
///
/// # Example
///
/// ```ignore
/// use connect_worker::{AppRegistration, ConnectConfig, ExecutionReply, WorkItem, WorkerConnection, handler_fn};
///
/// let app = AppRegistration::new(
///     "shop",
///     serde_json::json!([{ "id": "checkout", "name": "Checkout" }]),
///     handler_fn(|item: WorkItem| async move { Ok(ExecutionReply::done(item.payload)) }),
/// );
/// let worker = WorkerConnection::connect(ConnectConfig::from_env(vec![app])?).await?;
/// worker.closed().await;
/// ```
pub struct WorkerConnection {
    shared: Arc<Shared>,
}

impl WorkerConnection {
    /// Start the reconnect loop in the background and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ConnectConfig) -> Result<Self> {
        Self::start_with_events(config, Arc::new(NoopEvents))
    }

    /// Like [`WorkerConnection::start`], reporting lifecycle events to `events`.
    pub fn start_with_events(
        config: ConnectConfig,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config, events)?);

        let run_task = tokio::spawn(shared.clone().run());
        *lock(&shared.run_task) = Some(run_task);
        *lock(&shared.signal_task) = spawn_signal_listener(&shared);

        info!(
            instance_id = %shared.identity.instance_id,
            apps = shared.registry.len(),
            "Worker connection started"
        );
        Ok(Self { shared })
    }

    /// Start and wait until the first connection is active.
    ///
    /// Connection failures are retried in the background; this only fails if
    /// the connection is closed before it ever becomes active.
    pub async fn connect(config: ConnectConfig) -> Result<Self> {
        let connection = Self::start(config)?;
        connection.wait_ready().await?;
        Ok(connection)
    }

    /// Wait until the connection is active.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Active | ConnectionState::Closing | ConnectionState::Closed
                )
            })
            .await
            .map_err(|_| ConnectError::Closed)?;
        match state {
            ConnectionState::Active => Ok(()),
            _ => Err(ConnectError::Closed),
        }
    }

    /// Resolve once the connection reaches [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Current state. Draining is reported as [`ConnectionState::Active`].
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.state).state()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Recent state transitions, oldest first.
    pub fn state_history(&self) -> Vec<StateTransition> {
        lock(&self.shared.state).history().cloned().collect()
    }

    /// Id of the most recent active connection.
    pub fn connection_id(&self) -> Option<String> {
        lock(&self.shared.connection_id).clone()
    }

    /// Number of work items currently executing.
    pub fn in_flight(&self) -> usize {
        self.shared.inflight.count()
    }

    /// Replies waiting for acknowledgement or HTTP delivery.
    pub fn unacknowledged_replies(&self) -> usize {
        self.shared.buffer.buffered_len() + self.shared.buffer.pending_len()
    }

    /// Gracefully shut down.
    ///
    /// Stops reconnecting and new work, waits for in-flight work items to
    /// reply, flushes unacknowledged replies (retrying with the fallback key
    /// if the primary one fails) and closes the socket. Calling it again
    /// waits for the first call to finish.
    #[instrument(skip(self), fields(connection_id = ?self.connection_id()))]
    pub async fn close(&self) -> Result<()> {
        self.shared.close().await
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if let Some(handle) = lock(&self.shared.signal_task).take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
