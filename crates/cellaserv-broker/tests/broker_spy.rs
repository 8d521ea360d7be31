// Spy integration tests: passive duplication of a service's traffic and the
// teardown rules that go with it.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cellaserv_broker::test_support::TestBroker;
use cellaserv_broker::Broker;
use cellaserv_client::{Client, Service};
use cellaserv_wire as wire;
use serde_json::json;
use tokio::net::TcpStream;
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

/// Broker-side id of the connection whose peer address is `addr`.
async fn connection_id_for(broker: &Arc<Broker>, addr: &str) -> u64 {
    for _ in 0..200 {
        if let Some(description) = broker
            .list_connections()
            .iter()
            .find(|description| description.addr == addr)
        {
            return description.id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection {addr} never appeared");
}

async fn read_payload(stream: &mut TcpStream) -> Result<wire::Payload> {
    let (_, message) = timeout(
        WAIT,
        wire::read_message(stream, wire::DEFAULT_MAX_FRAME_BYTES),
    )
    .await??
    .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
    Ok(wire::decode_payload(&message)?)
}

#[tokio::test]
async fn spy_receives_request_and_reply_copies() -> Result<()> {
    let tb = TestBroker::start().await?;

    let server = Client::connect(tb.addr).await?;
    let math = Service::new("math", "").on("add", |req| {
        let operands: Vec<i64> = serde_json::from_slice(&req.data).map_err(|e| e.to_string())?;
        Ok(json!(operands.iter().sum::<i64>()))
    });
    server.register(math).await?;
    wait_for_service(&tb.broker, "math").await;

    let mut spy_conn = TcpStream::connect(tb.addr).await?;
    let spy_addr = spy_conn.local_addr()?.to_string();
    let spy_id = connection_id_for(&tb.broker, &spy_addr).await;
    tb.broker.install_spy(spy_id, "math", "")?;

    let caller = Client::connect(tb.addr).await?;
    let data = timeout(WAIT, caller.request("math", "", "add", Some(json!([1, 2])))).await??;
    assert_eq!(&data[..], b"3");

    // The spy saw the forwarded request, then the reply.
    match read_payload(&mut spy_conn).await? {
        wire::Payload::Request(request) => {
            assert_eq!(request.method, "add");
            assert_eq!(&request.data[..], b"[1,2]");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    match read_payload(&mut spy_conn).await? {
        wire::Payload::Reply(reply) => {
            assert_eq!(reply.data.as_deref(), Some(&b"3"[..]));
        }
        other => panic!("unexpected payload: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn spying_an_unknown_service_fails() -> Result<()> {
    let tb = TestBroker::start().await?;
    let _spy_conn = TcpStream::connect(tb.addr).await?;
    let err = tb
        .broker
        .install_spy(999, "ghost", "")
        .expect_err("unknown service");
    assert!(err.to_string().contains("no such service"));
    Ok(())
}

#[tokio::test]
async fn reregistration_closes_spies_of_displaced_service() -> Result<()> {
    let tb = TestBroker::start().await?;

    let mut first_owner = TcpStream::connect(tb.addr).await?;
    let register = wire::encode_register(&wire::Register {
        name: "math".into(),
        identification: String::new(),
    });
    wire::write_frame(&mut first_owner, &register).await?;
    wait_for_service(&tb.broker, "math").await;

    let mut spy_conn = TcpStream::connect(tb.addr).await?;
    let spy_addr = spy_conn.local_addr()?.to_string();
    let spy_id = connection_id_for(&tb.broker, &spy_addr).await;
    tb.broker.install_spy(spy_id, "math", "")?;

    // A new owner takes the key; the old service's spies are closed and must
    // re-attach to the new owner.
    let mut second_owner = TcpStream::connect(tb.addr).await?;
    wire::write_frame(&mut second_owner, &register).await?;

    let closed = timeout(
        WAIT,
        wire::read_message(&mut spy_conn, wire::DEFAULT_MAX_FRAME_BYTES),
    )
    .await??;
    assert!(closed.is_none(), "spy connection should be closed");
    Ok(())
}

#[tokio::test]
async fn losing_the_service_closes_its_spies() -> Result<()> {
    let tb = TestBroker::start().await?;

    let mut owner = TcpStream::connect(tb.addr).await?;
    let register = wire::encode_register(&wire::Register {
        name: "math".into(),
        identification: String::new(),
    });
    wire::write_frame(&mut owner, &register).await?;
    wait_for_service(&tb.broker, "math").await;

    let mut spy_conn = TcpStream::connect(tb.addr).await?;
    let spy_addr = spy_conn.local_addr()?.to_string();
    let spy_id = connection_id_for(&tb.broker, &spy_addr).await;
    tb.broker.install_spy(spy_id, "math", "")?;

    drop(owner);

    let closed = timeout(
        WAIT,
        wire::read_message(&mut spy_conn, wire::DEFAULT_MAX_FRAME_BYTES),
    )
    .await??;
    assert!(closed.is_none(), "spy connection should be closed");
    Ok(())
}
