mod support;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use mcp_courier::wire::{Request, Transport};
use mcp_courier::{
    ClientConfig, Config, ConnectionStatus, Error, Manager, ServerConfig, ServerName,
    TransportFactory,
};

use support::*;

fn mock_factory(transports: Vec<MockTransport>) -> TransportFactory {
    let queue = Mutex::new(VecDeque::from(transports));
    Arc::new(move |_name, _server| {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .map(|transport| Box::new(transport) as Box<dyn Transport>)
            .ok_or_else(|| Error::client("mock transport supply exhausted"))
    })
}

fn config_with_servers(names: &[&str]) -> Config {
    let servers = names
        .iter()
        .map(|name| {
            (
                ServerName::parse(*name).expect("valid name"),
                ServerConfig::stdio("unused", Vec::new()).with_timeout(Duration::from_secs(2)),
            )
        })
        .collect::<BTreeMap<_, _>>();
    Config::new(ClientConfig::default(), servers)
}

#[tokio::test]
async fn unknown_server_is_a_configuration_error() {
    let mut manager = Manager::new(config_with_servers(&["srv"]));
    let err = manager
        .ensure_connected("nope")
        .await
        .expect_err("unknown server rejected");
    assert!(matches!(err, Error::Configuration(_)), "err={err:?}");
    assert!(err.to_string().contains("nope"));
}

#[tokio::test]
async fn ensure_connected_handshakes_once_and_caches_the_connection() {
    let (transport, mut handle) = mock_transport();
    let mut manager =
        Manager::new(config_with_servers(&["srv"])).with_transport_factory(mock_factory(vec![transport]));

    let server = tokio::spawn(async move {
        serve_handshake(&mut handle, init_result()).await;
        handle
    });

    let first = manager.ensure_connected("srv").await.expect("connect ok");
    assert_eq!(first.status(), ConnectionStatus::Ready);
    let _handle = server.await.expect("server task ok");

    // The factory queue is empty; a second dial would fail, so this must be
    // the cached connection.
    let second = manager.ensure_connected("srv").await.expect("cached ok");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.connected_server_names().len(), 1);
}

#[tokio::test]
async fn http_server_without_a_factory_is_a_configuration_error() {
    let servers = BTreeMap::from([(
        ServerName::parse("remote").expect("valid name"),
        ServerConfig::http("https://example.com/mcp").with_timeout(Duration::from_secs(2)),
    )]);
    let mut manager = Manager::new(Config::new(ClientConfig::default(), servers));

    let err = manager
        .ensure_connected("remote")
        .await
        .expect_err("should fail without an http transport");
    assert!(matches!(err, Error::Configuration(_)), "err={err:?}");
}

#[tokio::test]
async fn failed_attempt_is_cleared_and_a_retry_dials_again() {
    let (refusing, _refusing_handle) = mock_transport();
    let (working, mut handle) = mock_transport();
    let mut manager = Manager::new(config_with_servers(&["srv"]))
        .with_transport_factory(mock_factory(vec![refusing.refuse_connect(), working]));

    let err = manager
        .ensure_connected("srv")
        .await
        .expect_err("first dial refused");
    assert!(matches!(err, Error::Connection(_)), "err={err:?}");

    let server = tokio::spawn(async move {
        serve_handshake(&mut handle, init_result()).await;
        handle
    });
    let conn = manager.ensure_connected("srv").await.expect("retry ok");
    assert_eq!(conn.status(), ConnectionStatus::Ready);
    server.await.expect("server task ok");
}

#[tokio::test]
async fn request_timeout_names_the_method_and_leaves_the_engine_usable() {
    let (transport, mut handle) = mock_transport();
    let mut manager =
        Manager::new(config_with_servers(&["srv"])).with_transport_factory(mock_factory(vec![transport]));

    let server = tokio::spawn(async move {
        serve_handshake(&mut handle, init_result()).await;
        handle
    });
    manager.ensure_connected("srv").await.expect("connect ok");
    let mut handle = server.await.expect("server task ok");

    let (outcome, request) = tokio::join!(
        manager.send_request(
            "srv",
            Request::new("tools/list", None),
            Some(Duration::from_millis(100)),
        ),
        handle.expect_request("tools/list"),
    );
    let err = outcome.expect_err("no reply within the deadline");
    assert!(err.is_timeout(), "err={err:?}");
    assert!(err.to_string().contains("tools/list"), "err={err}");
    assert!(err.to_string().contains("srv"), "err={err}");

    // The abandoned completion absorbs the late reply; the connection stays
    // usable for fresh requests.
    handle
        .respond_ok(request.id.expect("id"), json!({ "tools": [] }))
        .await;

    let (outcome, ()) = tokio::join!(
        manager.send_request("srv", Request::new("tools/list", None), None),
        async {
            let request = handle.expect_request("tools/list").await;
            handle
                .respond_ok(request.id.expect("id"), json!({ "tools": [] }))
                .await;
        },
    );
    let response = outcome.expect("request ok");
    assert_eq!(response.result(), Some(&json!({ "tools": [] })));
}

#[tokio::test]
async fn disconnect_all_closes_every_connection() {
    let (first, mut first_handle) = mock_transport();
    let (second, mut second_handle) = mock_transport();
    let mut manager = Manager::new(config_with_servers(&["alpha", "beta"]))
        .with_transport_factory(mock_factory(vec![first, second]));

    let alpha_server = tokio::spawn(async move {
        serve_handshake(&mut first_handle, init_result()).await;
    });
    let alpha = manager.ensure_connected("alpha").await.expect("alpha ok");
    alpha_server.await.expect("server task ok");

    let beta_server = tokio::spawn(async move {
        serve_handshake(&mut second_handle, init_result()).await;
    });
    let beta = manager.ensure_connected("beta").await.expect("beta ok");
    beta_server.await.expect("server task ok");

    manager.disconnect_all().await.expect("disconnect all ok");
    assert_eq!(alpha.status(), ConnectionStatus::Closed);
    assert_eq!(beta.status(), ConnectionStatus::Closed);
    assert!(manager.connected_server_names().is_empty());
    assert!(manager.connection("alpha").is_none());
}

#[tokio::test]
async fn disconnect_of_an_unknown_server_is_a_no_op() {
    let mut manager = Manager::new(config_with_servers(&["srv"]));
    manager.disconnect("srv").await.expect("no-op ok");
    manager.disconnect("ghost").await.expect("no-op ok");
}
