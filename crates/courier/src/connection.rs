//! Per-server connection engine.
//!
//! Drives one server connection through its lifecycle, multiplexes
//! concurrent outbound requests over the single transport, correlates
//! replies to pending requests, and routes server notifications to the
//! configured event sink.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected ── connect ──▶ Connecting ──▶ Handshaking ──▶ Ready
//!       ▲                         │               │            │
//!       │                         └───── failure/cancel ───────┤
//!       │                                                      ▼
//!    (new attempt) ◀── Closed ◀── Closing ◀── disconnect     Error
//! ```
//!
//! `Closed` and `Error` are terminal for the attempt; a new `connect` call
//! starts a fresh attempt with a fresh transport. Only `Ready` admits user
//! requests.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use mcp_wire::{
    Id, IdGenerator, Message, Notification, Request, Response, ResponsePayload, Transport,
    TransportEvent,
};

use crate::config::{ClientConfig, ServerName};
use crate::error::Error;
use crate::events::ServerEvent;

/// Builds the transport for one connection attempt. The engine calls it on
/// every (re)connect so each attempt owns a fresh channel.
pub type TransportBuilder = Arc<dyn Fn() -> Result<Box<dyn Transport>, Error> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        label.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Negotiated session state; populated atomically on a successful handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    pub capabilities: Value,
    pub instructions: Option<String>,
}

type PendingMap = HashMap<Id, oneshot::Sender<Result<Response, Error>>>;

pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_name", &self.inner.server_name)
            .finish_non_exhaustive()
    }
}

struct Inner {
    server_name: ServerName,
    client: ClientConfig,
    ids: IdGenerator,
    builder: TransportBuilder,
    state_tx: watch::Sender<ConnectionStatus>,
    /// Bumped on every new connect attempt, inside the state-transition
    /// critical section. Signals from an earlier attempt's event loop carry
    /// their generation and are ignored once it is stale.
    generation: AtomicU64,
    pending: Mutex<PendingMap>,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    transport_closed: AtomicBool,
    session: Mutex<Option<SessionInfo>>,
    failure: Mutex<Option<Error>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    pub fn new(server_name: ServerName, client: ClientConfig, builder: TransportBuilder) -> Self {
        let ids = match client.id_prefix.as_deref() {
            Some(prefix) => IdGenerator::with_prefix(prefix),
            None => IdGenerator::new(),
        };
        let (state_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                server_name,
                client,
                ids,
                builder,
                state_tx,
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                transport: tokio::sync::Mutex::new(None),
                transport_closed: AtomicBool::new(false),
                session: Mutex::new(None),
                failure: Mutex::new(None),
                event_task: Mutex::new(None),
            }),
        }
    }

    pub fn server_name(&self) -> &ServerName {
        &self.inner.server_name
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.state_tx.borrow()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        lock(&self.inner.session).clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        lock(&self.inner.session)
            .as_ref()
            .map(|session| session.protocol_version.clone())
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.inner.session)
            .as_ref()
            .map(|session| session.server_info.clone())
    }

    pub fn server_capabilities(&self) -> Option<Value> {
        lock(&self.inner.session)
            .as_ref()
            .map(|session| session.capabilities.clone())
    }

    /// Drives the connection to `Ready`.
    ///
    /// Valid from `Disconnected`, `Closed`, or `Error`; a call that finds an
    /// attempt already in flight joins it instead of starting another.
    /// Dropping the driving future mid-attempt cancels the attempt: the
    /// connection moves to `Error` and the transport is closed.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut observed = ConnectionStatus::Disconnected;
        let proceed = self.inner.state_tx.send_if_modified(|state| {
            observed = *state;
            match *state {
                ConnectionStatus::Disconnected
                | ConnectionStatus::Closed
                | ConnectionStatus::Error => {
                    *state = ConnectionStatus::Connecting;
                    self.inner.generation.fetch_add(1, Ordering::SeqCst);
                    true
                }
                _ => false,
            }
        });
        if !proceed {
            return match observed {
                ConnectionStatus::Connecting | ConnectionStatus::Handshaking => {
                    self.wait_ready().await
                }
                status => Err(Error::connection(format!(
                    "bad state: cannot connect while {status}"
                ))),
            };
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);

        lock(&self.inner.failure).take();
        lock(&self.inner.session).take();

        let mut cancel_guard = ConnectGuard {
            inner: self.inner.clone(),
            armed: true,
        };
        let result = self.drive_connect(generation).await;
        cancel_guard.armed = false;
        drop(cancel_guard);

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.fail(err.clone_for_fanout()).await;
                Err(err)
            }
        }
    }

    /// Waits for an in-flight attempt to settle without starting one.
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                ConnectionStatus::Ready => return Ok(()),
                ConnectionStatus::Closed | ConnectionStatus::Error => {
                    return Err(self.inner.failure_for(status));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::client("connection state channel dropped"));
            }
        }
    }

    /// Submits a request and resolves with the server's response.
    ///
    /// A response carrying a JSON-RPC error object fails the call with
    /// [`Error::Request`]; the connection stays `Ready`. Dropping the
    /// returned future abandons the request: its pending entry is removed
    /// and a late reply is dropped with a warning.
    pub async fn send_request(&self, request: Request) -> Result<Response, Error> {
        self.send_request_checked(request, true).await
    }

    /// Like [`Connection::send_request`], but `check_status = false` skips
    /// the `Ready` gate (the handshake itself uses this path).
    pub async fn send_request_checked(
        &self,
        request: Request,
        check_status: bool,
    ) -> Result<Response, Error> {
        if check_status {
            let status = self.status();
            if status != ConnectionStatus::Ready {
                return Err(Error::client(format!(
                    "connection is not ready (status={status})"
                )));
            }
        }
        self.submit(request).await
    }

    /// Sends a one-way notification to the server.
    pub async fn send_notification(&self, notification: Notification) -> Result<(), Error> {
        let mut transport = self.inner.transport.lock().await;
        let transport = transport
            .as_mut()
            .ok_or_else(|| Error::connection("transport not attached"))?;
        transport
            .send(&Message::Notification(notification))
            .await
            .map_err(Error::Transport)
    }

    /// Tears the connection down.
    ///
    /// Idempotent. Outstanding requests are rejected before the transport is
    /// asked to close; if the transport does not confirm within the
    /// configured close grace, the engine abandons it and reports `Closed`
    /// anyway.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let initiated = self.inner.state_tx.send_if_modified(|state| match *state {
            ConnectionStatus::Disconnected
            | ConnectionStatus::Connecting
            | ConnectionStatus::Handshaking
            | ConnectionStatus::Ready => {
                *state = ConnectionStatus::Closing;
                true
            }
            _ => false,
        });

        if initiated {
            self.inner.drain_pending(&Error::connection("closing"));
            let closed_now = self.inner.close_transport().await;
            if !closed_now {
                // Nothing owes us a close signal.
                self.inner.finish_close();
                return Ok(());
            }
        } else if self.status().is_terminal() {
            return Ok(());
        }

        let grace = self.inner.client.close_grace;
        let mut rx = self.inner.state_tx.subscribe();
        let wait_closed = async {
            loop {
                let status = *rx.borrow_and_update();
                if status.is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(grace, wait_closed).await.is_err() {
            if self.inner.finish_close() {
                warn!(
                    server = %self.inner.server_name,
                    grace = ?grace,
                    "transport did not confirm close; abandoning it"
                );
            }
        }
        Ok(())
    }

    async fn drive_connect(&self, generation: u64) -> Result<(), Error> {
        let inner = &self.inner;

        let mut transport = (inner.builder)()?;
        transport
            .connect()
            .await
            .map_err(|err| Error::connection(format!("transport connect failed: {err}")))?;
        let events = transport
            .take_events()
            .ok_or_else(|| Error::client("transport produced no event stream"))?;

        inner.transport.lock().await.replace(transport);
        inner.transport_closed.store(false, Ordering::SeqCst);

        if !inner.advance(ConnectionStatus::Connecting, ConnectionStatus::Handshaking) {
            inner.close_transport().await;
            inner.finish_close();
            return Err(Error::connection("cancelled"));
        }

        let task = tokio::spawn(run_event_loop(inner.clone(), events, generation));
        if let Some(stale) = lock(&inner.event_task).replace(task) {
            stale.abort();
        }

        let session = self.handshake().await?;
        lock(&inner.session).replace(session);

        self.send_notification(Notification::new("notifications/initialized", None))
            .await
            .map_err(|err| Error::connection(format!("initialized notification failed: {err}")))?;

        if !inner.advance(ConnectionStatus::Handshaking, ConnectionStatus::Ready) {
            return Err(Error::connection("cancelled"));
        }
        Ok(())
    }

    async fn handshake(&self) -> Result<SessionInfo, Error> {
        let client = &self.inner.client;
        let params = serde_json::json!({
            "protocolVersion": client.protocol_version,
            "capabilities": client.capabilities,
            "clientInfo": {
                "name": client.name,
                "version": client.version,
            },
        });

        let response = self
            .submit(Request::new("initialize", Some(params)))
            .await
            .map_err(|err| Error::connection(format!("initialize failed: {err}")))?;
        let ResponsePayload::Result(result) = &response.payload else {
            return Err(Error::connection("initialize failed: error response"));
        };

        let negotiated = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if negotiated.is_empty() {
            return Err(Error::connection(
                "initialize response carried no usable protocolVersion",
            ));
        }
        if negotiated != client.protocol_version {
            warn!(
                server = %self.inner.server_name,
                offered = %client.protocol_version,
                negotiated = %negotiated,
                "server negotiated a different protocol version"
            );
        }

        let server_info = result.get("serverInfo");
        let name = server_info
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown Server")
            .to_string();
        let version = server_info
            .and_then(|info| info.get("version"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown Version")
            .to_string();
        let capabilities = result
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let instructions = result
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(SessionInfo {
            protocol_version: negotiated.to_string(),
            server_info: ServerInfo { name, version },
            capabilities,
            instructions,
        })
    }

    async fn submit(&self, mut request: Request) -> Result<Response, Error> {
        let id = match &request.id {
            Some(id) => id.clone(),
            None => {
                let id = self.inner.ids.next_id();
                request.id = Some(id.clone());
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.inner.pending);
            if pending.contains_key(&id) {
                return Err(Error::client(format!("duplicate request id: {id}")));
            }
            pending.insert(id.clone(), tx);
        }
        let mut entry_guard = PendingGuard {
            inner: &self.inner,
            id,
            armed: true,
        };

        {
            let mut transport = self.inner.transport.lock().await;
            let transport = transport
                .as_mut()
                .ok_or_else(|| Error::connection("transport not attached"))?;
            transport
                .send(&Message::Request(request))
                .await
                .map_err(Error::Transport)?;
        }

        match rx.await {
            Ok(outcome) => {
                entry_guard.armed = false;
                outcome
            }
            Err(_) => Err(Error::client(
                "response channel closed before a reply was observed",
            )),
        }
    }
}

impl Inner {
    fn advance(&self, from: ConnectionStatus, to: ConnectionStatus) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn finish_close(&self) -> bool {
        self.advance(ConnectionStatus::Closing, ConnectionStatus::Closed)
    }

    /// Moves the connection to `Error` and runs the teardown obligations:
    /// reject every pending request (before the transport closes, so callers
    /// see a protocol-level failure), then close the transport. Terminal and
    /// `Closing` states are left alone.
    async fn fail(&self, err: Error) {
        let transitioned = self.state_tx.send_if_modified(|state| match *state {
            ConnectionStatus::Connecting
            | ConnectionStatus::Handshaking
            | ConnectionStatus::Ready => {
                *state = ConnectionStatus::Error;
                true
            }
            _ => false,
        });
        if !transitioned {
            return;
        }
        lock(&self.failure).replace(err.clone_for_fanout());
        self.drain_pending(&err);
        self.close_transport().await;
    }

    /// Like [`Inner::fail`], but only on behalf of the attempt that is still
    /// current. The generation check runs inside the watch-channel critical
    /// section, so it cannot interleave with a new attempt's transition to
    /// `Connecting`.
    async fn fail_if_attempt(&self, generation: u64, err: Error) {
        let transitioned = self.state_tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            match *state {
                ConnectionStatus::Connecting
                | ConnectionStatus::Handshaking
                | ConnectionStatus::Ready => {
                    *state = ConnectionStatus::Error;
                    true
                }
                _ => false,
            }
        });
        if !transitioned {
            return;
        }
        lock(&self.failure).replace(err.clone_for_fanout());
        self.drain_pending(&err);
        self.close_transport().await;
    }

    fn finish_close_if(&self, generation: u64) -> bool {
        self.state_tx.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            if *state == ConnectionStatus::Closing {
                *state = ConnectionStatus::Closed;
                true
            } else {
                false
            }
        })
    }

    fn drain_pending(&self, err: &Error) {
        let drained = std::mem::take(&mut *lock(&self.pending));
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone_for_fanout()));
        }
    }

    /// Closes and drops the transport. Returns whether this call performed
    /// the close; at most one caller ever does.
    async fn close_transport(&self) -> bool {
        if self.transport_closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let transport = self.transport.lock().await.take();
        match transport {
            Some(mut transport) => {
                transport.close().await;
                true
            }
            None => false,
        }
    }

    fn failure_for(&self, status: ConnectionStatus) -> Error {
        match &*lock(&self.failure) {
            Some(err) => err.clone_for_fanout(),
            None => Error::connection(format!("connection is {status}")),
        }
    }

    fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => self.correlate(response),
            Message::Notification(notification) => {
                self.route(&notification.method, notification.params);
            }
            Message::Request(request) => {
                // Server-initiated requests share the notification routing
                // table; today only sampling arrives this way.
                self.route(&request.method, request.params);
            }
        }
    }

    fn correlate(&self, response: Response) {
        let waiter = lock(&self.pending).remove(&response.id);
        let Some(waiter) = waiter else {
            warn!(
                server = %self.server_name,
                id = %response.id,
                "dropping response with no matching pending request"
            );
            return;
        };

        let outcome = match &response.payload {
            ResponsePayload::Error(error) => Err(Error::Request {
                code: error.code,
                message: error.message.clone(),
                data: error.data.clone(),
            }),
            ResponsePayload::Result(_) => Ok(response),
        };
        let _ = waiter.send(outcome);
    }

    fn route(&self, method: &str, params: Option<Value>) {
        let server = self.server_name.clone();
        let event = match method {
            "notifications/tools/listChanged" => ServerEvent::ToolsListChanged { server },
            "notifications/resources/listChanged" => ServerEvent::ResourcesListChanged { server },
            "notifications/prompts/listChanged" => ServerEvent::PromptsListChanged { server },
            "notifications/resources/didChange" => {
                let uri = params
                    .as_ref()
                    .and_then(|params| params.get("uri"))
                    .and_then(Value::as_str);
                let Some(uri) = uri else {
                    warn!(server = %self.server_name, "resource change notification without a uri");
                    return;
                };
                ServerEvent::ResourceChanged {
                    server,
                    uri: uri.to_string(),
                }
            }
            "notifications/logging/log" => ServerEvent::LogReceived {
                server,
                params: params.unwrap_or(Value::Null),
            },
            "sampling/createMessage" => ServerEvent::SamplingRequestReceived {
                server,
                params: params.unwrap_or(Value::Null),
            },
            other => {
                warn!(
                    server = %self.server_name,
                    method = other,
                    "ignoring unknown server notification"
                );
                return;
            }
        };

        let Some(sink) = &self.client.event_sink else {
            debug!(server = %self.server_name, method, "no event sink configured; dropping event");
            return;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| sink.dispatch(event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(server = %self.server_name, method, "event sink failed: {err}");
            }
            Err(_) => {
                warn!(server = %self.server_name, method, "event sink panicked");
            }
        }
    }

    async fn observe_transport_closed(&self, generation: u64, reason: Option<String>) {
        let status = *self.state_tx.borrow();
        match status {
            ConnectionStatus::Closing => {
                self.finish_close_if(generation);
            }
            ConnectionStatus::Closed | ConnectionStatus::Error | ConnectionStatus::Disconnected => {
                debug!(server = %self.server_name, "ignoring late transport close");
            }
            _ => {
                let message = match reason {
                    Some(reason) => format!("transport closed unexpectedly: {reason}"),
                    None => "transport closed unexpectedly".to_string(),
                };
                self.fail_if_attempt(generation, Error::connection(message))
                    .await;
            }
        }
    }
}

async fn run_event_loop(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<TransportEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match event {
            TransportEvent::Message(message) => inner.handle_message(message),
            TransportEvent::Stderr(chunk) => {
                let text = String::from_utf8_lossy(&chunk);
                debug!(server = %inner.server_name, "server stderr: {}", text.trim_end());
            }
            TransportEvent::Error(err) => {
                inner
                    .fail_if_attempt(generation, Error::connection(format!("transport fault: {err}")))
                    .await;
            }
            TransportEvent::Closed { reason } => {
                inner.observe_transport_closed(generation, reason).await;
                break;
            }
        }
    }
}

struct ConnectGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let transitioned = self.inner.state_tx.send_if_modified(|state| match *state {
            ConnectionStatus::Connecting | ConnectionStatus::Handshaking => {
                *state = ConnectionStatus::Error;
                true
            }
            _ => false,
        });
        if !transitioned {
            return;
        }
        let err = Error::connection("cancelled");
        lock(&self.inner.failure).replace(err.clone_for_fanout());
        self.inner.drain_pending(&err);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                inner.close_transport().await;
            });
        }
    }
}

struct PendingGuard<'a> {
    inner: &'a Inner,
    id: Id,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock(&self.inner.pending).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
