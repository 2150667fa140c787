mod registry;
mod retry;

pub use feed_core::wire::InboundMessage;
pub use registry::Subscription;
pub use retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_JITTER_RATIO, DEFAULT_MAX_DELAY};

use feed_core::wire::{decode_message, ping_frame};
use futures_util::{SinkExt, StreamExt};
use registry::SubscriberRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 2;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("unsupported endpoint scheme `{0}`, expected ws or wss")]
    UnsupportedScheme(String),
    #[error("connection run loop already started")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    /// Gave up after this many consecutive failed attempts.
    Failed { attempts: u32 },
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting { .. } => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed { .. } => "failed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: Url,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
    pub retry: RetryPolicy,
}

impl ConnectionConfig {
    pub fn new(endpoint: Url) -> Result<Self, SocketError> {
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(SocketError::UnsupportedScheme(endpoint.scheme().to_string()));
        }
        Ok(Self {
            endpoint,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            retry: RetryPolicy::default(),
        })
    }

    pub fn parse(endpoint: &str) -> Result<Self, SocketError> {
        Self::new(Url::parse(endpoint)?)
    }

    /// Longest silence tolerated before the socket is recycled: every
    /// allowed ping goes unanswered, then one more interval passes.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.max_missed_heartbeats.max(1).saturating_add(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatAction {
    Ping,
    Stale,
}

/// Pings sent since the last inbound frame.
#[derive(Debug)]
struct Heartbeat {
    unanswered: u32,
    max_missed: u32,
}

impl Heartbeat {
    fn new(max_missed: u32) -> Self {
        Self {
            unanswered: 0,
            max_missed: max_missed.max(1),
        }
    }

    fn on_traffic(&mut self) {
        self.unanswered = 0;
    }

    fn on_tick(&mut self) -> HeartbeatAction {
        if self.unanswered >= self.max_missed {
            return HeartbeatAction::Stale;
        }
        self.unanswered += 1;
        HeartbeatAction::Ping
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Closed,
    Error,
    Stale,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Closed => "closed",
            CloseReason::Error => "error",
            CloseReason::Stale => "stale",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    registry: Mutex<SubscriberRegistry>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

/// One persistent socket to the explorer's event endpoint, fanned out to
/// subscribers by topic.
///
/// Clones are handles to the same connection: they share the subscriber
/// table, the state and the socket. Build one in the composition root and
/// hand clones to every consumer.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(SubscriberRegistry::default()),
                outbound: Mutex::new(None),
                state,
                shutdown,
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &ConnectionManager) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Spawns the connect/reconnect loop. A connection has at most one loop,
    /// hence at most one live socket.
    pub fn start(&self) -> Result<JoinHandle<()>, SocketError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(SocketError::AlreadyRunning);
        }
        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        let manager = self.clone();
        Ok(tokio::spawn(async move {
            manager.run(shutdown).await;
        }))
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        let subscription = registry.insert(topic, Arc::new(handler));
        let total = registry.total();
        drop(registry);
        debug!(event = "subscribed", topic = topic, total = total);
        subscription
    }

    /// Subscribes a handler that forwards every message into a channel.
    pub fn subscribe_channel(
        &self,
        topic: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(topic, move |message| {
            let _ = tx.send(message.clone());
        });
        (subscription, rx)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = self.registry().remove(subscription);
        debug!(event = "unsubscribed", topic = subscription.topic(), removed = removed);
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry().count(topic)
    }

    /// Queues `raw` for the socket while connected. Anything sent in another
    /// state is dropped, never queued for later.
    pub fn send(&self, raw: impl Into<String>) -> bool {
        if !self.state().is_connected() {
            debug!(event = "send_dropped", reason = "not_connected");
            return false;
        }
        let outbound = self.outbound();
        let Some(tx) = outbound.as_ref() else {
            debug!(event = "send_dropped", reason = "no_socket");
            return false;
        };
        match tx.try_send(raw.into()) {
            Ok(()) => true,
            Err(err) => {
                warn!(event = "send_dropped", reason = "queue", error = %err);
                false
            }
        }
    }

    /// Decodes one inbound frame and hands it to every subscriber of its
    /// topic. Returns how many handlers ran.
    pub fn dispatch(&self, text: &str) -> usize {
        let message = match decode_message(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "frame_invalid", error = %err);
                return 0;
            }
        };
        if message.is_pong() {
            return 0;
        }
        let handlers = self.registry().handlers_for(message.topic());
        if handlers.is_empty() {
            trace!(event = "frame_unrouted", kind = message.kind());
            return 0;
        }
        for handler in &handlers {
            handler(&message);
        }
        handlers.len()
    }

    fn registry(&self) -> MutexGuard<'_, SubscriberRegistry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!(event = "socket_state", from = previous.as_str(), to = state.as_str());
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.shared.config;
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting {
                attempt: failures + 1,
            });
            let attempt = tokio::time::timeout(
                config.connect_timeout,
                connect_async(config.endpoint.as_str()),
            );
            let connected = tokio::select! {
                result = attempt => result,
                _ = shutdown.changed() => break,
            };
            let result = match connected {
                Ok(Ok((socket, _))) => Ok(socket),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("connect timed out".to_string()),
            };
            let socket = match result {
                Ok(socket) => socket,
                Err(err) => {
                    failures += 1;
                    warn!(
                        event = "socket_connect_error",
                        endpoint = %config.endpoint,
                        attempt = failures,
                        error = %err
                    );
                    if config.retry.exhausted(failures) {
                        error!(
                            event = "socket_failed",
                            endpoint = %config.endpoint,
                            attempts = failures
                        );
                        self.set_state(ConnectionState::Failed { attempts: failures });
                        self.shared.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    if wait_or_shutdown(config.retry.delay(failures), &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            failures = 0;
            let reason = self.drive(socket, &mut shutdown).await;
            self.set_state(ConnectionState::Disconnected);
            info!(
                event = "socket_closed",
                endpoint = %config.endpoint,
                reason = reason.as_str()
            );
            if reason == CloseReason::Shutdown {
                break;
            }
            if wait_or_shutdown(config.retry.delay(0), &mut shutdown).await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        self.shared.running.store(false, Ordering::SeqCst);
    }

    async fn drive(&self, socket: Socket, shutdown: &mut watch::Receiver<bool>) -> CloseReason {
        let config = &self.shared.config;
        let (tx, mut rx) = mpsc::channel::<String>(config.outbound_capacity.max(1));
        *self.outbound() = Some(tx);
        self.set_state(ConnectionState::Connected);
        info!(event = "socket_connected", endpoint = %config.endpoint);

        let (mut sink, mut stream) = socket.split();
        let period = config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut liveness = Heartbeat::new(config.max_missed_heartbeats);
        let mut last_seen = Instant::now();

        let reason = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        liveness.on_traffic();
                        self.dispatch(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::Closed,
                    Some(Ok(_)) => {
                        last_seen = Instant::now();
                        liveness.on_traffic();
                    }
                    Some(Err(err)) => {
                        warn!(event = "socket_read_error", error = %err);
                        break CloseReason::Error;
                    }
                },
                Some(out) = rx.recv() => {
                    if let Err(err) = sink.send(Message::Text(out)).await {
                        warn!(event = "socket_write_error", error = %err);
                        break CloseReason::Error;
                    }
                }
                _ = heartbeat.tick() => {
                    if liveness.on_tick() == HeartbeatAction::Stale {
                        warn!(
                            event = "socket_stale",
                            silent_ms = last_seen.elapsed().as_millis() as u64,
                            unanswered = liveness.unanswered
                        );
                        break CloseReason::Stale;
                    }
                    if let Err(err) = sink.send(Message::Text(ping_frame())).await {
                        warn!(event = "heartbeat_failed", error = %err);
                        break CloseReason::Error;
                    }
                }
                _ = shutdown.changed() => break CloseReason::Shutdown,
            }
        };

        self.outbound().take();
        let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
        reason
    }
}

/// Sleeps for `delay`; returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown.changed() => true,
    }
}
