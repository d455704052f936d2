//! Shared test doubles: a scriptable in-memory transport plus event sinks.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mcp_courier::wire::{
    Id, Message, Notification, Request, Response, ResponsePayload, Transport, TransportError,
    TransportEvent,
};
use mcp_courier::{
    ClientConfig, Connection, Error, EventSink, EventSinkError, ServerEvent, ServerName,
    TransportBuilder,
};

pub struct MockTransport {
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    fail_connect: bool,
    emit_closed_on_close: bool,
}

struct Shared {
    events_tx: mpsc::Sender<TransportEvent>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    close_emitted: AtomicBool,
}

/// Test-side handle: observe what the client sent, inject server traffic.
pub struct MockHandle {
    shared: Arc<Shared>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
}

pub fn mock_transport() -> (MockTransport, MockHandle) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        events_tx,
        outbound_tx,
        closed: AtomicBool::new(false),
        close_emitted: AtomicBool::new(false),
    });
    (
        MockTransport {
            shared: shared.clone(),
            events_rx: Some(events_rx),
            fail_connect: false,
            emit_closed_on_close: true,
        },
        MockHandle {
            shared,
            outbound_rx,
        },
    )
}

impl MockTransport {
    pub fn refuse_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// A transport that never confirms close, to exercise the watchdog.
    pub fn without_close_event(mut self) -> Self {
        self.emit_closed_on_close = false;
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.fail_connect {
            return Err(TransportError::Closed("connect refused".to_string()));
        }
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("mock transport closed".to_string()));
        }
        self.shared
            .outbound_tx
            .send(message.clone())
            .map_err(|_| TransportError::Closed("outbound receiver dropped".to_string()))
    }

    async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if self.emit_closed_on_close && !self.shared.close_emitted.swap(true, Ordering::SeqCst) {
            let _ = self
                .shared
                .events_tx
                .try_send(TransportEvent::Closed { reason: None });
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }
}

impl MockHandle {
    pub async fn recv_outbound(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.outbound_rx.recv())
            .await
            .expect("client sent a message in time")
            .expect("outbound channel open")
    }

    pub async fn expect_request(&mut self, method: &str) -> Request {
        let message = self.recv_outbound().await;
        let Message::Request(request) = message else {
            panic!("expected request {method:?}, got {message:?}");
        };
        assert_eq!(request.method, method);
        assert!(request.id.is_some(), "outbound request carried no id");
        request
    }

    pub async fn expect_notification(&mut self, method: &str) -> Notification {
        let message = self.recv_outbound().await;
        let Message::Notification(notification) = message else {
            panic!("expected notification {method:?}, got {message:?}");
        };
        assert_eq!(notification.method, method);
        notification
    }

    pub async fn push_message(&self, message: Message) {
        self.shared
            .events_tx
            .send(TransportEvent::Message(message))
            .await
            .expect("engine event loop alive");
    }

    pub async fn push_notification(&self, method: &str, params: Option<Value>) {
        self.push_message(Message::Notification(Notification::new(method, params)))
            .await;
    }

    pub async fn respond_ok(&self, id: Id, result: Value) {
        self.push_message(Message::Response(Response {
            id,
            payload: ResponsePayload::Result(result),
        }))
        .await;
    }

    pub async fn respond_error(&self, id: Id, code: i64, message: &str) {
        self.push_message(Message::Response(Response {
            id,
            payload: ResponsePayload::Error(mcp_courier::wire::ErrorObject {
                code,
                message: message.to_string(),
                data: None,
            }),
        }))
        .await;
    }

    /// Simulates the server side dropping the channel.
    pub async fn push_closed(&self, reason: Option<String>) {
        self.shared.close_emitted.store(true, Ordering::SeqCst);
        let _ = self
            .shared
            .events_tx
            .send(TransportEvent::Closed { reason })
            .await;
    }

    pub async fn push_error(&self, err: TransportError) {
        let _ = self.shared.events_tx.send(TransportEvent::Error(err)).await;
    }

    pub fn transport_was_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// A builder that hands out the queued transports in order; one more connect
/// attempt than the test scripted is itself a failure.
pub fn queue_builder(transports: Vec<MockTransport>) -> TransportBuilder {
    let queue = Mutex::new(std::collections::VecDeque::from(transports));
    Arc::new(move || {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .map(|transport| Box::new(transport) as Box<dyn Transport>)
            .ok_or_else(|| Error::client("mock transport supply exhausted"))
    })
}

pub fn single_use_builder(transport: MockTransport) -> TransportBuilder {
    queue_builder(vec![transport])
}

pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !predicate() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition met in time");
}

pub fn server_name() -> ServerName {
    ServerName::parse("srv").expect("valid name")
}

pub fn test_connection(client: ClientConfig) -> (Arc<Connection>, MockHandle) {
    let (transport, handle) = mock_transport();
    let connection = Connection::new(server_name(), client, single_use_builder(transport));
    (Arc::new(connection), handle)
}

pub fn init_result() -> Value {
    init_result_with_version(mcp_courier::MCP_PROTOCOL_VERSION)
}

pub fn init_result_with_version(version: &str) -> Value {
    json!({
        "protocolVersion": version,
        "capabilities": {},
        "serverInfo": { "name": "S", "version": "1" },
    })
}

/// Answers the `initialize` request and consumes the `initialized`
/// notification.
pub async fn serve_handshake(handle: &mut MockHandle, result: Value) {
    let request = handle.expect_request("initialize").await;
    let id = request.id.clone().expect("initialize id");
    handle.respond_ok(id, result).await;
    handle.expect_notification("notifications/initialized").await;
}

pub async fn connect_ready(connection: &Connection, handle: &mut MockHandle) {
    let (outcome, ()) = tokio::join!(connection.connect(), serve_handshake(handle, init_result()));
    outcome.expect("connect ok");
}

/// Drives one request/response exchange; also serves as an ordering barrier,
/// since the engine handles events sequentially.
pub async fn roundtrip(connection: &Arc<Connection>, handle: &mut MockHandle, method: &str) {
    let in_flight = tokio::spawn({
        let connection = connection.clone();
        let method = method.to_string();
        async move { connection.send_request(Request::new(method, None)).await }
    });
    let request = handle.expect_request(method).await;
    let id = request.id.clone().expect("request id");
    handle.respond_ok(id, json!({ "ok": true })).await;
    let response = in_flight
        .await
        .expect("request task ok")
        .expect("request ok");
    assert_eq!(response.result(), Some(&json!({ "ok": true })));
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn dispatch(&self, event: ServerEvent) -> Result<(), EventSinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct FailingSink;

impl EventSink for FailingSink {
    fn dispatch(&self, _event: ServerEvent) -> Result<(), EventSinkError> {
        Err("sink rejected the event".into())
    }
}

pub struct PanickingSink;

impl EventSink for PanickingSink {
    fn dispatch(&self, _event: ServerEvent) -> Result<(), EventSinkError> {
        panic!("sink panicked");
    }
}
