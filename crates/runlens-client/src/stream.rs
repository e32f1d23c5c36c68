//! Live output stream for one task.
//!
//! A [`StreamClient`] owns at most one socket at a time. Its worker task
//! connects, waits for the server's `connected` acknowledgment, appends
//! events to a shared [`EventLog`] in arrival order, and reconnects with
//! backoff on abnormal close while the task is still active.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use runlens_core::{AppendOutcome, Backoff, EventLog, ReconnectPolicy, SequencedEvent};
use runlens_types::{ConnectionState, ConnectionStatus, StreamMessage, ACCESS_TOKEN_PROTOCOL};
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{ClientError, Result};

// ============================================================================
// Transport
// ============================================================================

/// One frame as seen by the stream worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

/// An open stream connection.
pub trait Connection: Send + 'static {
    /// Next frame, or `None` once the transport has ended.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens stream connections.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(
        &self,
        url: &Url,
        token: Option<&str>,
    ) -> impl Future<Output = Result<Self::Conn>> + Send;
}

/// WebSocket connector. The token travels as a sub-protocol pair
/// (`access_token`, `<token>`) since browsers cannot set headers at connect.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &Url, token: Option<&str>) -> Result<WsConnection> {
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("{ACCESS_TOKEN_PROTOCOL}, {token}"))
                .map_err(|e| ClientError::InvalidHeader(e.to_string()))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (inner, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout(self.connect_timeout.as_millis() as u64))??;
        Ok(WsConnection { inner })
    }
}

impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => {
                        debug!(target: "runlens::stream::frames", len = bytes.len(), "Dropping non-UTF-8 binary frame");
                    }
                },
                Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return Some(Ok(Frame::Closed { code, reason }));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            trace!(target: "runlens::stream", error = %e, "Close handshake failed");
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Which message kinds a client accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamVariant {
    /// Output, errors, stage markers.
    #[default]
    Output,
    /// Output plus per-resource updates, for the apply phase.
    Apply,
}

impl StreamVariant {
    fn accepts(self, message: &StreamMessage) -> bool {
        match message {
            StreamMessage::ResourceStatusUpdate(_) | StreamMessage::ResourceIdUpdate(_) => {
                self == StreamVariant::Apply
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub task_id: u64,
    pub url: Url,
    pub token: Option<String>,
    pub variant: StreamVariant,
    pub policy: ReconnectPolicy,
    pub max_buffered_events: usize,
}

/// Observable state of a stream client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub connection: ConnectionState,
    /// A `completed` event was received.
    pub completed: bool,
    /// Terminal error after the reconnect ceiling. Cleared by `start()`.
    pub error: Option<String>,
}

impl StreamState {
    pub fn connected(&self) -> bool {
        self.connection.status == ConnectionStatus::Connected
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    options: StreamOptions,
    log: RwLock<EventLog>,
    seq_tx: watch::Sender<u64>,
    state_tx: watch::Sender<StreamState>,
    task_active: AtomicBool,
    /// Set while a worker is alive. Guards against duplicate sockets.
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

/// Handle to a task's live stream. Cheap to clone.
pub struct StreamClient<C: Connector = WsConnector> {
    shared: Arc<Shared>,
    connector: Arc<C>,
}

impl<C: Connector> Clone for StreamClient<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<C: Connector> StreamClient<C> {
    pub fn new(options: StreamOptions, connector: Arc<C>) -> Self {
        let (seq_tx, _) = watch::channel(0);
        let (state_tx, _) = watch::channel(StreamState::default());
        Self {
            shared: Arc::new(Shared {
                log: RwLock::new(EventLog::new(options.max_buffered_events)),
                options,
                seq_tx,
                state_tx,
                task_active: AtomicBool::new(true),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
            connector,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.shared.options.task_id
    }

    /// Start the worker. Returns `false` if one is already running.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            debug!(
                target: "runlens::stream",
                task_id = self.task_id(),
                "Start suppressed, stream already running"
            );
            return false;
        }

        self.shared.task_active.store(true, Ordering::Release);
        self.shared.state_tx.send_modify(|state| {
            state.error = None;
            state.connection.reconnect_attempt = 0;
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            shutdown_rx,
        ));
        let previous = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Worker { shutdown, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        true
    }

    /// Stop the worker, cancelling any pending reconnect and closing the
    /// socket. Buffered events stay readable.
    pub async fn stop(&self) {
        let worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                if e.is_panic() {
                    warn!(target: "runlens::stream", task_id = self.task_id(), "Stream worker panicked");
                }
            }
        }
    }

    /// Stop and release this handle.
    pub async fn dispose(self) {
        self.stop().await;
    }

    /// Tell the client whether the task is still running. Once inactive, no
    /// reconnect is scheduled and the open socket is closed.
    pub fn set_task_active(&self, active: bool) {
        self.shared.task_active.store(active, Ordering::Release);
        if !active {
            if let Some(worker) = self
                .shared
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                let _ = worker.shutdown.send(true);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StreamState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state_tx.subscribe()
    }

    /// Cursor over all buffered events, oldest first.
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            shared: Arc::clone(&self.shared),
            next: 0,
            seq_rx: self.shared.seq_tx.subscribe(),
        }
    }

    /// Copy of everything currently buffered.
    pub async fn events(&self) -> Vec<SequencedEvent> {
        self.shared.log.read().await.since(0)
    }
}

/// Reads events in order, waiting for new ones.
pub struct EventCursor {
    shared: Arc<Shared>,
    next: u64,
    seq_rx: watch::Receiver<u64>,
}

impl EventCursor {
    /// Wait for and return all events not yet seen by this cursor.
    pub async fn next_batch(&mut self) -> Vec<SequencedEvent> {
        loop {
            let _ = self.seq_rx.borrow_and_update();
            let events = self.shared.log.read().await.since(self.next);
            if let Some(last) = events.last() {
                self.next = last.seq + 1;
                return events;
            }
            // Shared holds the sender, so this never errors while we exist.
            if self.seq_rx.changed().await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Events available right now, without waiting.
    pub async fn try_next_batch(&mut self) -> Vec<SequencedEvent> {
        let events = self.shared.log.read().await.since(self.next);
        if let Some(last) = events.last() {
            self.next = last.seq + 1;
        }
        events
    }
}

// ============================================================================
// Worker
// ============================================================================

enum SessionEnd {
    Shutdown,
    Completed,
    Failed(String),
}

async fn run<C: Connector>(
    shared: Arc<Shared>,
    connector: Arc<C>,
    mut shutdown: watch::Receiver<bool>,
) {
    let options = &shared.options;
    let task_id = options.task_id;
    let mut backoff = Backoff::new(options.policy);
    let mut connection_no = 0u32;

    loop {
        if *shutdown.borrow() || !shared.task_active.load(Ordering::Acquire) {
            break;
        }

        shared.state_tx.send_modify(|state| {
            state.connection.status = ConnectionStatus::Connecting;
        });
        connection_no += 1;
        debug!(
            target: "runlens::stream",
            task_id,
            connection = connection_no,
            attempt = backoff.attempt(),
            "Connecting"
        );

        let connected = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = connector.connect(&options.url, options.token.as_deref()) => result,
        };

        let end = match connected {
            Ok(conn) => session(&shared, conn, connection_no, &mut backoff, &mut shutdown).await,
            Err(e) => SessionEnd::Failed(e.to_string()),
        };

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Completed => {
                info!(target: "runlens::stream", task_id, "Stream completed");
                shared.state_tx.send_modify(|state| state.completed = true);
                break;
            }
            SessionEnd::Failed(reason) => {
                shared.state_tx.send_modify(|state| {
                    state.connection.status = ConnectionStatus::Disconnected;
                    state.connection.last_error = Some(reason.clone());
                });
                if !shared.task_active.load(Ordering::Acquire) {
                    debug!(target: "runlens::stream", task_id, "Task inactive, not reconnecting");
                    break;
                }

                let Some(delay) = backoff.next_delay() else {
                    let attempts = backoff.attempt();
                    warn!(
                        target: "runlens::stream",
                        task_id,
                        attempts,
                        error = %reason,
                        "Reconnect attempts exhausted"
                    );
                    shared.state_tx.send_modify(|state| {
                        state.error = Some(format!(
                            "Connection lost after {attempts} reconnect attempts: {reason}"
                        ));
                    });
                    break;
                };

                warn!(
                    target: "runlens::stream",
                    task_id,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Stream disconnected, reconnecting"
                );
                shared.state_tx.send_modify(|state| {
                    state.connection.reconnect_attempt = backoff.attempt();
                });

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    shared.state_tx.send_modify(|state| {
        state.connection.status = ConnectionStatus::Disconnected;
    });
    debug!(target: "runlens::stream", task_id, "Stream worker exited");
}

async fn session<Conn: Connection>(
    shared: &Shared,
    mut conn: Conn,
    connection_no: u32,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let options = &shared.options;
    let task_id = options.task_id;
    let mut acknowledged = false;
    let mut held: Vec<StreamMessage> = Vec::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                conn.close().await;
                return SessionEnd::Shutdown;
            }
            frame = conn.recv() => frame,
        };

        let text = match frame {
            None => return SessionEnd::Failed("connection closed".to_string()),
            Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
            Some(Ok(Frame::Closed { code, reason })) => {
                let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                return SessionEnd::Failed(format!("closed (code {code}) {reason}").trim_end().to_string());
            }
            Some(Ok(Frame::Text(text))) => text,
        };
        trace!(target: "runlens::stream::frames", task_id, frame = %text, "Frame");

        let message = match StreamMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "runlens::stream", task_id, error = %e, "Dropping malformed frame");
                continue;
            }
        };

        match &message {
            StreamMessage::Unknown => {
                debug!(target: "runlens::stream", task_id, "Dropping frame of unknown type");
                continue;
            }
            StreamMessage::Connected { client_id, .. } => {
                info!(
                    target: "runlens::stream",
                    task_id,
                    connection = connection_no,
                    client_id = client_id.as_deref().unwrap_or("-"),
                    "Stream connected"
                );
                acknowledged = true;
                backoff.reset();
                shared.state_tx.send_modify(|state| {
                    state.connection = ConnectionState {
                        status: ConnectionStatus::Connected,
                        reconnect_attempt: 0,
                        last_error: None,
                    };
                });
                for pending in held.drain(..) {
                    append(shared, connection_no, pending).await;
                }
                continue;
            }
            other if !options.variant.accepts(other) => {
                debug!(target: "runlens::stream", task_id, kind = other.kind(), "Dropping resource update on output stream");
                continue;
            }
            _ => {}
        }

        let completed = matches!(message, StreamMessage::Completed { .. });
        if completed && !acknowledged {
            warn!(
                target: "runlens::stream",
                task_id,
                dropped = held.len(),
                "Completion arrived before the connection was acknowledged"
            );
            conn.close().await;
            return SessionEnd::Failed("completed before connected".to_string());
        }
        if acknowledged {
            append(shared, connection_no, message).await;
        } else {
            held.push(message);
        }

        if completed {
            conn.close().await;
            return SessionEnd::Completed;
        }
    }
}

async fn append(shared: &Shared, connection_no: u32, message: StreamMessage) {
    let mut log = shared.log.write().await;
    match log.append(connection_no, message) {
        AppendOutcome::Appended { evicted, .. } => {
            if evicted > 0 {
                debug!(target: "runlens::stream", evicted, "Evicted oldest buffered events");
            }
            shared.seq_tx.send_replace(log.next_seq());
        }
        AppendOutcome::Duplicate => {
            trace!(target: "runlens::stream", connection = connection_no, "Dropping replayed event");
        }
    }
}
