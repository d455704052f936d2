mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mcp_courier::wire::{Id, Message, Request};
use mcp_courier::{ClientConfig, ConnectionStatus, ServerEvent};

use support::*;

fn config_with_sink(sink: Arc<dyn mcp_courier::EventSink>) -> ClientConfig {
    ClientConfig {
        event_sink: Some(sink),
        ..Default::default()
    }
}

#[tokio::test]
async fn notifications_are_translated_and_dispatched_in_arrival_order() {
    let sink = Arc::new(RecordingSink::default());
    let (connection, mut handle) = test_connection(config_with_sink(sink.clone()));
    connect_ready(&connection, &mut handle).await;

    handle
        .push_notification("notifications/tools/listChanged", None)
        .await;
    handle
        .push_notification("notifications/resources/listChanged", None)
        .await;
    handle
        .push_notification("notifications/prompts/listChanged", None)
        .await;
    handle
        .push_notification(
            "notifications/resources/didChange",
            Some(json!({ "uri": "file:///notes.md" })),
        )
        .await;
    handle
        .push_notification(
            "notifications/logging/log",
            Some(json!({ "level": "info", "message": "hello" })),
        )
        .await;

    // The engine handles events sequentially, so one request/response
    // exchange doubles as a flush barrier.
    roundtrip(&connection, &mut handle, "ping").await;

    let events = sink.events();
    assert_eq!(events.len(), 5, "events={events:?}");
    assert!(matches!(events[0], ServerEvent::ToolsListChanged { .. }));
    assert!(matches!(events[1], ServerEvent::ResourcesListChanged { .. }));
    assert!(matches!(events[2], ServerEvent::PromptsListChanged { .. }));
    let ServerEvent::ResourceChanged { server, uri } = &events[3] else {
        panic!("expected resource change, got {:?}", events[3]);
    };
    assert_eq!(server.as_str(), "srv");
    assert_eq!(uri, "file:///notes.md");
    let ServerEvent::LogReceived { params, .. } = &events[4] else {
        panic!("expected log event, got {:?}", events[4]);
    };
    assert_eq!(params["level"], "info");
}

#[tokio::test]
async fn sampling_requests_are_routed_like_notifications() {
    let sink = Arc::new(RecordingSink::default());
    let (connection, mut handle) = test_connection(config_with_sink(sink.clone()));
    connect_ready(&connection, &mut handle).await;

    handle
        .push_message(Message::Request(Request::with_id(
            Id::String("s-1".to_string()),
            "sampling/createMessage",
            Some(json!({ "messages": [], "maxTokens": 64 })),
        )))
        .await;
    roundtrip(&connection, &mut handle, "ping").await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    let ServerEvent::SamplingRequestReceived { params, .. } = &events[0] else {
        panic!("expected sampling event, got {:?}", events[0]);
    };
    assert_eq!(params["maxTokens"], 64);
}

#[tokio::test]
async fn unknown_methods_and_malformed_params_are_ignored() {
    let sink = Arc::new(RecordingSink::default());
    let (connection, mut handle) = test_connection(config_with_sink(sink.clone()));
    connect_ready(&connection, &mut handle).await;

    handle
        .push_notification("notifications/experimental/other", None)
        .await;
    // didChange without a uri cannot be translated.
    handle
        .push_notification("notifications/resources/didChange", Some(json!({})))
        .await;
    roundtrip(&connection, &mut handle, "ping").await;

    assert!(sink.events().is_empty());
    assert_eq!(connection.status(), ConnectionStatus::Ready);
}

#[tokio::test]
async fn missing_sink_drops_events_silently() {
    let (connection, mut handle) = test_connection(ClientConfig::default());
    connect_ready(&connection, &mut handle).await;

    handle
        .push_notification("notifications/tools/listChanged", None)
        .await;
    roundtrip(&connection, &mut handle, "ping").await;
    assert_eq!(connection.status(), ConnectionStatus::Ready);
}

#[tokio::test]
async fn failing_sink_never_unseats_the_connection() {
    let (connection, mut handle) = test_connection(config_with_sink(Arc::new(FailingSink)));
    connect_ready(&connection, &mut handle).await;

    handle
        .push_notification("notifications/tools/listChanged", None)
        .await;
    roundtrip(&connection, &mut handle, "ping").await;

    handle
        .push_notification("notifications/prompts/listChanged", None)
        .await;
    roundtrip(&connection, &mut handle, "ping").await;
    assert_eq!(connection.status(), ConnectionStatus::Ready);
}

#[tokio::test]
async fn panicking_sink_never_unseats_the_connection() {
    let (connection, mut handle) = test_connection(config_with_sink(Arc::new(PanickingSink)));
    connect_ready(&connection, &mut handle).await;

    handle
        .push_notification("notifications/tools/listChanged", None)
        .await;
    roundtrip(&connection, &mut handle, "ping").await;
    assert_eq!(connection.status(), ConnectionStatus::Ready);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(connection.status(), ConnectionStatus::Ready);
}
