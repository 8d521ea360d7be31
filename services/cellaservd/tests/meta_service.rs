// Integration tests for the cellaserv meta-service running against an
// in-process broker.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cellaserv_broker::test_support::TestBroker;
use cellaserv_broker::Broker;
use cellaserv_client::{Client, Error};
use cellaservd::meta;
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn wait_for_service(broker: &Arc<Broker>, name: &str) {
    for _ in 0..200 {
        if broker
            .list_services()
            .iter()
            .any(|service| service.name == name)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service {name} never registered");
}

async fn meta_broker() -> Result<(TestBroker, Client, Client)> {
    let tb = TestBroker::start().await?;
    let meta_client = meta::register_meta_service(Arc::clone(&tb.broker), tb.addr).await?;
    wait_for_service(&tb.broker, meta::META_SERVICE_NAME).await;
    let caller = Client::connect(tb.addr).await?;
    Ok((tb, meta_client, caller))
}

#[tokio::test]
async fn version_reports_the_crate_version() -> Result<()> {
    let (_tb, _meta, caller) = meta_broker().await?;
    let data = timeout(WAIT, caller.request("cellaserv", "", "version", None)).await??;
    let version: String = serde_json::from_slice(&data)?;
    assert_eq!(version, cellaserv_broker::VERSION);
    Ok(())
}

#[tokio::test]
async fn name_client_then_whoami_round_trip() -> Result<()> {
    let (_tb, _meta, caller) = meta_broker().await?;

    timeout(
        WAIT,
        caller.request("cellaserv", "", "name_client", Some(json!({"name": "brain"}))),
    )
    .await??;

    let data = timeout(WAIT, caller.request("cellaserv", "", "whoami", None)).await??;
    let me: serde_json::Value = serde_json::from_slice(&data)?;
    assert_eq!(me["name"], "brain");
    Ok(())
}

#[tokio::test]
async fn list_clients_and_services_include_the_meta_service() -> Result<()> {
    let (_tb, _meta, caller) = meta_broker().await?;

    let data = timeout(WAIT, caller.request("cellaserv", "", "list_clients", None)).await??;
    let clients: Vec<serde_json::Value> = serde_json::from_slice(&data)?;
    // At least the meta-service connection and our own.
    assert!(clients.len() >= 2, "clients: {clients:?}");

    let data = timeout(WAIT, caller.request("cellaserv", "", "list_services", None)).await??;
    let services: Vec<serde_json::Value> = serde_json::from_slice(&data)?;
    assert!(
        services.iter().any(|service| service["name"] == "cellaserv"),
        "services: {services:?}"
    );
    Ok(())
}

#[tokio::test]
async fn list_events_reflects_subscriptions() -> Result<()> {
    let (tb, _meta, caller) = meta_broker().await?;

    caller.subscribe("beacon", |_event, _data| {}).await?;
    for _ in 0..200 {
        if !tb.broker.list_events().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let data = timeout(WAIT, caller.request("cellaserv", "", "list_events", None)).await??;
    let events: Vec<serde_json::Value> = serde_json::from_slice(&data)?;
    assert!(
        events.iter().any(|event| event["event"] == "beacon"),
        "events: {events:?}"
    );
    Ok(())
}

#[tokio::test]
async fn get_logs_returns_matching_history() -> Result<()> {
    let (_tb, _meta, caller) = meta_broker().await?;

    // Connecting alone produced log.new_connection entries.
    let data = timeout(
        WAIT,
        caller.request(
            "cellaserv",
            "",
            "get_logs",
            Some(json!({"pattern": r"log\.new_connection"})),
        ),
    )
    .await??;
    let lines: Vec<String> = serde_json::from_slice(&data)?;
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|line| line.starts_with("log.new_connection")));
    Ok(())
}

#[tokio::test]
async fn get_logs_rejects_invalid_patterns() -> Result<()> {
    let (_tb, _meta, caller) = meta_broker().await?;
    let err = timeout(
        WAIT,
        caller.request("cellaserv", "", "get_logs", Some(json!({"pattern": "("}))),
    )
    .await?
    .expect_err("invalid pattern");
    assert!(matches!(err, Error::Remote { .. }));
    Ok(())
}

#[tokio::test]
async fn shutdown_request_stops_the_broker() -> Result<()> {
    let (tb, _meta, caller) = meta_broker().await?;

    let result = timeout(WAIT, caller.request("cellaserv", "", "shutdown", None)).await?;
    // The shutdown races our own reply: the broker fails pending requests
    // with a shutdown error before the meta reply can come back.
    match result {
        Ok(_) => {}
        Err(Error::Remote { what, .. }) => assert!(what.contains("shutting down")),
        Err(Error::ConnectionClosed) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
    }

    let shutdown = tb.broker.shutdown_token();
    timeout(WAIT, shutdown.cancelled()).await?;
    Ok(())
}
