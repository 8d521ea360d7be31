// The cellaserv meta-service: a normal client, registered under the
// well-known name, whose handlers call into the broker's introspection
// surface.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use cellaserv_broker::Broker;
use cellaserv_client::{Client, Service};
use serde::Deserialize;
use serde_json::json;

pub const META_SERVICE_NAME: &str = "cellaserv";

#[derive(Debug, Deserialize)]
struct NameClientRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SpyRequest {
    service: String,
    #[serde(default)]
    identification: String,
    client_id: u64,
}

#[derive(Debug, Deserialize)]
struct GetLogsRequest {
    pattern: String,
}

/// Connect a client to the broker and register the meta-service on it. The
/// returned client owns the connection; dropping or closing it unregisters
/// the service.
pub async fn register_meta_service(broker: Arc<Broker>, addr: SocketAddr) -> Result<Client> {
    let client = Client::connect(connect_addr(addr))
        .await
        .context("connect meta-service client")?;

    let service = Service::new(META_SERVICE_NAME, "")
        .on("version", |_req| {
            Ok(json!(cellaserv_broker::VERSION.to_string()))
        })
        .on("whoami", {
            let broker = Arc::clone(&broker);
            move |req| {
                let sender = broker
                    .request_sender(req.id)
                    .ok_or_else(|| "unknown request sender".to_string())?;
                serde_json::to_value(sender).map_err(|err| err.to_string())
            }
        })
        .on("name_client", {
            let broker = Arc::clone(&broker);
            move |req| {
                let data: NameClientRequest =
                    serde_json::from_slice(&req.data).map_err(|err| err.to_string())?;
                broker
                    .rename_request_sender(req.id, &data.name)
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::Value::Null)
            }
        })
        .on("list_clients", {
            let broker = Arc::clone(&broker);
            move |_req| serde_json::to_value(broker.list_connections()).map_err(|err| err.to_string())
        })
        .on("list_services", {
            let broker = Arc::clone(&broker);
            move |_req| serde_json::to_value(broker.list_services()).map_err(|err| err.to_string())
        })
        .on("list_events", {
            let broker = Arc::clone(&broker);
            move |_req| serde_json::to_value(broker.list_events()).map_err(|err| err.to_string())
        })
        .on("spy", {
            let broker = Arc::clone(&broker);
            move |req| {
                let data: SpyRequest =
                    serde_json::from_slice(&req.data).map_err(|err| err.to_string())?;
                broker
                    .install_spy(data.client_id, &data.service, &data.identification)
                    .map_err(|err| err.to_string())?;
                Ok(serde_json::Value::Null)
            }
        })
        .on("get_logs", {
            let broker = Arc::clone(&broker);
            move |req| {
                let data: GetLogsRequest =
                    serde_json::from_slice(&req.data).map_err(|err| err.to_string())?;
                let lines = broker
                    .logs_matching(&data.pattern)
                    .map_err(|err| err.to_string())?;
                Ok(json!(lines))
            }
        })
        .on("shutdown", {
            let broker = Arc::clone(&broker);
            move |_req| {
                broker.trigger_shutdown();
                Ok(serde_json::Value::Null)
            }
        });

    client
        .register(service)
        .await
        .context("register meta-service")?;
    Ok(client)
}

// The broker may listen on an unspecified address; connect via loopback.
fn connect_addr(addr: SocketAddr) -> SocketAddr {
    let mut addr = addr;
    if addr.ip().is_unspecified() {
        match addr.ip() {
            IpAddr::V4(_) => addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            IpAddr::V6(_) => addr.set_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        }
    }
    addr
}
