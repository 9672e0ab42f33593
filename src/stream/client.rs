//! Push stream client, controller handle, and connection worker.
//!
//! The client spawns one background worker that owns the subscription
//! registry, the per-connection session and every timer. Callers drive it
//! through a cloneable [`PushController`] and read inbound envelopes from the
//! returned [`PushConnection`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, info, warn};

use crate::retry::{BackoffPolicy, ReconnectBackoff};
use crate::stream::auth::{token_provider, AuthStep, TokenProvider};
use crate::stream::proto::{ClientFrame, Envelope, FilterConfig, FilterRequest};
use crate::stream::registry::{FilterDedup, SubscriptionRegistry, SubscriptionSnapshot};
use crate::stream::replay::ReplayPolicy;
use crate::stream::session::{Session, SessionEvent};
use crate::stream::transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};

/// Production websocket endpoint for the push service.
pub const PUSH_ENDPOINT: &str = "wss://push.pushstream.io/v1/ws";
/// Local development websocket endpoint for the push service.
pub const LOCAL_PUSH_ENDPOINT: &str = "ws://localhost:8082/v1/ws";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const PING_INTERVAL: Duration = Duration::from_secs(30);
    pub const STALL_THRESHOLD: Duration = Duration::from_secs(60);
    pub const REPLAY_MAX_TIME: Duration = Duration::from_millis(300_000);
    pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Tunables for the connection worker.
#[derive(Clone, Debug)]
pub struct PushClientOptions {
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Inbound silence after which the connection is recycled.
    pub stall_threshold: Duration,
    /// Longest gap since the previous connection for which replay is requested.
    pub replay_max_time: Duration,
    /// Bound on the wait for the auth reply. `None` waits indefinitely.
    pub auth_timeout: Option<Duration>,
    /// How repeated `filter` calls are recognised as unchanged.
    pub filter_dedup: FilterDedup,
    /// Reconnect delay growth.
    pub backoff: BackoffPolicy,
}

impl Default for PushClientOptions {
    fn default() -> Self {
        Self {
            ping_interval: StreamDefaults::PING_INTERVAL,
            stall_threshold: StreamDefaults::STALL_THRESHOLD,
            replay_max_time: StreamDefaults::REPLAY_MAX_TIME,
            auth_timeout: Some(StreamDefaults::AUTH_TIMEOUT),
            filter_dedup: FilterDedup::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Entry point for creating push connections.
#[derive(Clone)]
pub struct PushClient {
    local: bool,
    endpoint_override: Option<String>,
    options: PushClientOptions,
    token_provider: Option<TokenProvider>,
    transport: Arc<dyn Transport>,
}

impl PushClient {
    /// Creates a client for the production endpoint over websockets.
    pub fn new() -> Self {
        Self {
            local: false,
            endpoint_override: None,
            options: PushClientOptions::default(),
            token_provider: None,
            transport: Arc::new(WebSocketTransport),
        }
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    pub fn with_options(mut self, options: PushClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the async credential source consulted after every successful
    /// connect. Without one, connections skip authentication.
    pub fn with_token_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<SecretString>> + Send + 'static,
    {
        self.token_provider = Some(token_provider(provider));
        self
    }

    /// Replaces the websocket transport.
    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Spawns the connection worker on the current tokio runtime.
    ///
    /// The worker starts closed; call [`PushController::open`] to connect.
    /// Channels and filters registered before that are sent on connect.
    pub fn start(&self) -> PushConnection {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let worker = ConnectionWorker {
            endpoint: self.endpoint().to_string(),
            transport: Arc::clone(&self.transport),
            token_provider: self.token_provider.clone(),
            registry: SubscriptionRegistry::new(self.options.filter_dedup),
            replay: ReplayPolicy::new(self.options.replay_max_time),
            backoff: ReconnectBackoff::new(self.options.backoff.clone()),
            options: self.options.clone(),
            state: ConnectionState::Closed,
            reconnect_at: None,
            connected_at: None,
            previous_connected_at: None,
            last_seen_id: None,
            commands: command_rx,
            inbound_tx,
            status_tx,
        };
        tokio::spawn(worker.run());

        PushConnection {
            controller: PushController { tx: command_tx },
            receiver: inbound_rx,
            status: status_rx,
        }
    }

    fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_PUSH_ENDPOINT
        } else {
            PUSH_ENDPOINT
        }
    }
}

impl Default for PushClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection lifecycle updates produced by the worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushConnectionStatus {
    /// Transport opened; authentication and resync are in progress.
    Connected,
    /// Filters and channels were resent (and replay requested if eligible).
    Synchronized,
    Disconnected,
}

/// Handle pair returned by [`PushClient::start`].
#[derive(Debug)]
pub struct PushConnection {
    controller: PushController,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    status: mpsc::UnboundedReceiver<PushConnectionStatus>,
}

impl PushConnection {
    /// Returns a cloneable controller.
    pub fn controller(&self) -> PushController {
        self.controller.clone()
    }

    /// Splits into controller and inbound envelope receiver.
    pub fn split(self) -> (PushController, mpsc::UnboundedReceiver<Envelope>) {
        (self.controller, self.receiver)
    }

    /// Splits into controller, inbound envelope receiver, and connection
    /// status receiver.
    pub fn split_with_status(
        self,
    ) -> (
        PushController,
        mpsc::UnboundedReceiver<Envelope>,
        mpsc::UnboundedReceiver<PushConnectionStatus>,
    ) {
        (self.controller, self.receiver, self.status)
    }

    /// Receives the next application envelope. `ack` frames never appear here.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

/// Cloneable command handle for the connection worker.
///
/// Every method only enqueues a command; it fails solely when the worker has
/// stopped. The worker stops once all controllers are dropped.
#[derive(Clone, Debug)]
pub struct PushController {
    tx: mpsc::UnboundedSender<Command>,
}

impl PushController {
    /// Connects unless a connection exists or is being established.
    pub fn open(&self) -> Result<(), PushClientError> {
        self.send(Command::Open)
    }

    /// Closes the connection and cancels any scheduled reconnect.
    pub fn close(&self) -> Result<(), PushClientError> {
        self.send(Command::Close)
    }

    /// Subscribes to `channel`. Repeated joins are ignored.
    pub fn join(&self, channel: impl Into<String>) -> Result<(), PushClientError> {
        self.send(Command::Join(channel.into()))
    }

    /// Unsubscribes from `channel`. While connected a leave frame is sent
    /// even for channels that were never joined.
    pub fn leave(&self, channel: impl Into<String>) -> Result<(), PushClientError> {
        self.send(Command::Leave(channel.into()))
    }

    /// Installs `spec` for `filter_type`.
    ///
    /// By default a call is skipped only when the very same `Arc` is already
    /// installed; see [`FilterDedup`].
    pub fn filter(
        &self,
        filter_type: impl Into<String>,
        spec: Arc<FilterConfig>,
    ) -> Result<(), PushClientError> {
        self.send(Command::Filter {
            filter_type: filter_type.into(),
            spec,
        })
    }

    /// Returns the channels and filters the worker currently tracks.
    pub async fn subscriptions(&self) -> Result<SubscriptionSnapshot, PushClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.map_err(|_| PushClientError::SendQueueClosed)
    }

    fn send(&self, command: Command) -> Result<(), PushClientError> {
        self.tx
            .send(command)
            .map_err(|_| PushClientError::SendQueueClosed)
    }
}

/// Errors produced by the push client.
#[derive(Debug, Error)]
pub enum PushClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection worker has stopped.
    #[error("send queue is closed")]
    SendQueueClosed,

    /// The transport link is no longer usable.
    #[error("transport is closed")]
    TransportClosed,

    /// The server did not answer the auth frame in time.
    #[error("auth reply not received within {0:?}")]
    AuthTimeout(Duration),
}

#[derive(Debug)]
enum Command {
    Open,
    Close,
    Join(String),
    Leave(String),
    Filter {
        filter_type: String,
        spec: Arc<FilterConfig>,
    },
    Snapshot(oneshot::Sender<SubscriptionSnapshot>),
}

enum ConnectionState {
    Closed,
    Connecting(BoxFuture<'static, Result<TransportLink, PushClientError>>),
    Open(Box<Session>),
}

enum WorkerEvent {
    Command(Option<Command>),
    Connected(Result<TransportLink, PushClientError>),
    Session(SessionEvent),
    ReconnectDue,
}

struct ConnectionWorker {
    endpoint: String,
    options: PushClientOptions,
    transport: Arc<dyn Transport>,
    token_provider: Option<TokenProvider>,
    registry: SubscriptionRegistry,
    replay: ReplayPolicy,
    backoff: ReconnectBackoff,
    state: ConnectionState,
    reconnect_at: Option<Instant>,
    connected_at: Option<Instant>,
    previous_connected_at: Option<Instant>,
    last_seen_id: Option<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    status_tx: mpsc::UnboundedSender<PushConnectionStatus>,
}

impl ConnectionWorker {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => WorkerEvent::Command(command),
                event = next_state_event(&mut self.state) => event,
                _ = reconnect_due(self.reconnect_at) => WorkerEvent::ReconnectDue,
            };

            match event {
                WorkerEvent::Command(Some(command)) => self.handle_command(command),
                WorkerEvent::Command(None) => {
                    self.close();
                    break;
                }
                WorkerEvent::Connected(outcome) => self.on_connect_outcome(outcome),
                WorkerEvent::Session(event) => self.on_session_event(event),
                WorkerEvent::ReconnectDue => {
                    self.reconnect_at = None;
                    self.open();
                }
            }
        }
        debug!(event = "push_worker_stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open => self.open(),
            Command::Close => self.close(),
            Command::Join(channel) => {
                if self.registry.join(&channel) {
                    self.send_if_connected(ClientFrame::Join {
                        channels: vec![channel],
                    });
                }
            }
            Command::Leave(channel) => {
                self.registry.leave(&channel);
                self.send_if_connected(ClientFrame::Leave {
                    channels: vec![channel],
                });
            }
            Command::Filter { filter_type, spec } => {
                if self.registry.set_filter(&filter_type, Arc::clone(&spec)) {
                    self.send_if_connected(ClientFrame::Filter(FilterRequest {
                        filter_type,
                        filter: spec.as_ref().clone(),
                    }));
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    fn open(&mut self) {
        self.reconnect_at = None;
        if !matches!(self.state, ConnectionState::Closed) {
            return;
        }
        debug!(event = "push_connecting", endpoint = %self.endpoint);
        self.state = ConnectionState::Connecting(self.transport.connect(&self.endpoint));
    }

    fn close(&mut self) {
        self.reconnect_at = None;
        match std::mem::replace(&mut self.state, ConnectionState::Closed) {
            ConnectionState::Closed => {}
            ConnectionState::Connecting(_) => debug!(event = "push_connect_cancelled"),
            ConnectionState::Open(session) => {
                session.close();
                info!(event = "push_closed");
                let _ = self.status_tx.send(PushConnectionStatus::Disconnected);
            }
        }
    }

    fn on_connect_outcome(&mut self, outcome: Result<TransportLink, PushClientError>) {
        match outcome {
            Ok(link) => {
                let now = Instant::now();
                self.previous_connected_at = self.connected_at.replace(now);
                self.backoff.reset();
                self.state = ConnectionState::Open(Box::new(Session::start(
                    link,
                    now,
                    self.options.ping_interval,
                    self.options.stall_threshold,
                    self.token_provider.as_ref(),
                )));
                info!(event = "push_connected", endpoint = %self.endpoint);
                let _ = self.status_tx.send(PushConnectionStatus::Connected);
            }
            Err(err) => {
                warn!(event = "push_connect_failed", error = %err);
                self.state = ConnectionState::Closed;
                self.schedule_reconnect();
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport(TransportEvent::Text(text)) => self.on_frame(&text),
            SessionEvent::Transport(TransportEvent::Closed) => self.on_transport_down("closed"),
            SessionEvent::Transport(TransportEvent::Error(err)) => {
                warn!(event = "push_transport_error", error = %err);
                self.on_transport_down("error");
            }
            SessionEvent::Auth(step) => self.on_auth_step(step),
            SessionEvent::LivenessTick => self.on_liveness_tick(),
        }
    }

    fn on_frame(&mut self, text: &str) {
        let ConnectionState::Open(session) = &mut self.state else {
            return;
        };
        match session.handle_frame(text, &mut self.last_seen_id, Instant::now()) {
            Ok(Some(envelope)) => {
                let _ = self.inbound_tx.send(envelope);
            }
            Ok(None) => {}
            Err(err) => warn!(event = "push_frame_decode_failed", error = %err),
        }
    }

    fn on_auth_step(&mut self, step: AuthStep) {
        match step {
            AuthStep::Credential(None) => self.synchronize(),
            AuthStep::Credential(Some(credential)) => {
                let timeout = self.options.auth_timeout;
                let ConnectionState::Open(session) = &mut self.state else {
                    return;
                };
                match session.authenticate(credential, timeout) {
                    Ok(()) => debug!(event = "push_auth_sent"),
                    Err(err) => {
                        warn!(event = "push_auth_send_failed", error = %err);
                        self.on_transport_down("auth_send_failed");
                    }
                }
            }
            AuthStep::Accepted(reply) => {
                debug!(event = "push_authenticated", kind = %reply.kind);
                self.synchronize();
            }
            AuthStep::Failed(err) => {
                warn!(event = "push_auth_failed", error = %err);
                self.on_transport_down("auth_failed");
            }
        }
    }

    /// Resends every filter, then the full channel set, then a replay request
    /// when the previous connection is recent enough.
    fn synchronize(&mut self) {
        let ConnectionState::Open(session) = &mut self.state else {
            return;
        };

        let mut frames: Vec<ClientFrame> = self
            .registry
            .filters()
            .map(|(filter_type, spec)| {
                ClientFrame::Filter(FilterRequest {
                    filter_type: filter_type.to_string(),
                    filter: spec.clone(),
                })
            })
            .collect();
        let filter_count = frames.len();
        let channels = self.registry.channels();
        let channel_count = channels.len();
        frames.push(ClientFrame::Join {
            channels: channels.clone(),
        });
        let replay = self.replay.evaluate(
            channels,
            self.last_seen_id.as_deref(),
            self.previous_connected_at,
            Instant::now(),
        );
        let replaying = replay.is_some();
        if let Some(request) = replay {
            frames.push(ClientFrame::Replay(request));
        }

        for frame in frames {
            if let Err(err) = session.send(frame) {
                warn!(event = "push_resync_failed", error = %err);
                return;
            }
        }

        info!(
            event = "push_synchronized",
            filters = filter_count,
            channels = channel_count,
            replaying
        );
        let _ = self.status_tx.send(PushConnectionStatus::Synchronized);
    }

    fn on_liveness_tick(&mut self) {
        let now = Instant::now();
        let ConnectionState::Open(session) = &mut self.state else {
            return;
        };
        if session.is_open() {
            if let Err(err) = session.send(ClientFrame::Ping) {
                debug!(event = "push_ping_failed", error = %err);
            }
        }
        if session.is_stalled(now) {
            warn!(
                event = "push_stalled",
                idle_ms = session.idle_for(now).as_millis() as u64
            );
            self.close();
            self.open();
        }
    }

    fn on_transport_down(&mut self, reason: &str) {
        if let ConnectionState::Open(session) =
            std::mem::replace(&mut self.state, ConnectionState::Closed)
        {
            session.close();
        }
        warn!(event = "push_disconnected", reason);
        let _ = self.status_tx.send(PushConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(Instant::now() + delay);
        info!(
            event = "push_reconnect_scheduled",
            delay_ms = delay.as_millis() as u64
        );
    }

    fn send_if_connected(&mut self, frame: ClientFrame) {
        let ConnectionState::Open(session) = &mut self.state else {
            debug!(event = "push_frame_deferred", kind = %frame.kind());
            return;
        };
        if !session.is_open() {
            debug!(event = "push_frame_deferred", kind = %frame.kind());
            return;
        }
        if let Err(err) = session.send(frame) {
            warn!(event = "push_send_failed", error = %err);
        }
    }
}

async fn next_state_event(state: &mut ConnectionState) -> WorkerEvent {
    match state {
        ConnectionState::Closed => std::future::pending().await,
        ConnectionState::Connecting(attempt) => WorkerEvent::Connected(attempt.await),
        ConnectionState::Open(session) => WorkerEvent::Session(session.next_event().await),
    }
}

async fn reconnect_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{PushClient, PushClientOptions, StreamDefaults, LOCAL_PUSH_ENDPOINT, PUSH_ENDPOINT};
    use crate::stream::registry::FilterDedup;

    #[test]
    fn push_client_uses_production_endpoint_by_default() {
        let client = PushClient::new();
        assert_eq!(client.endpoint(), PUSH_ENDPOINT);
    }

    #[test]
    fn push_client_uses_local_endpoint_when_enabled() {
        let client = PushClient::new().with_local_mode(true);
        assert_eq!(client.endpoint(), LOCAL_PUSH_ENDPOINT);
    }

    #[test]
    fn push_client_endpoint_override_takes_precedence() {
        let client = PushClient::new()
            .with_local_mode(true)
            .with_endpoint("wss://push-dev.example/ws   \n");
        assert_eq!(client.endpoint(), "wss://push-dev.example/ws");
    }

    #[test]
    fn default_options_bound_the_auth_wait() {
        let options = PushClientOptions::default();
        assert_eq!(options.auth_timeout, Some(StreamDefaults::AUTH_TIMEOUT));
        assert_eq!(options.ping_interval, Duration::from_secs(30));
        assert_eq!(options.stall_threshold, Duration::from_secs(60));
        assert_eq!(options.replay_max_time, Duration::from_millis(300_000));
        assert_eq!(options.filter_dedup, FilterDedup::Identity);
    }

    #[tokio::test]
    async fn cloned_controllers_keep_worker_alive() {
        let connection = PushClient::new().start();
        let (controller, receiver) = connection.split();
        drop(receiver);

        let snapshot = controller.subscriptions().await.expect("snapshot");
        assert!(snapshot.channels.is_empty());

        let stale = controller.clone();
        drop(controller);
        // The clone keeps the worker alive.
        assert!(stale.join("repo:team:1").is_ok());
        let snapshot = stale.subscriptions().await.expect("snapshot");
        assert_eq!(snapshot.channels, vec!["repo:team:1".to_string()]);
    }
}
