// TCP listener, per-connection dispatch loop and cascade teardown.
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cellaserv_wire as wire;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ServiceDescription, SubscriberDescription};
use crate::connection::{run_writer, ConnectionEntry, ConnectionHandle, ConnectionId};
use crate::services::{ServiceEntry, ServiceKey};
use crate::{events, lock, subscriptions, Broker, Result};

/// Bound TCP listener for the broker. Binding is separate from serving so
/// callers can learn the ephemeral port before any client connects.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

/// Accept loop: one dispatch task per connection, until shutdown.
pub async fn serve(listener: Listener, broker: Arc<Broker>) -> Result<()> {
    let shutdown = broker.shutdown_token();
    tracing::info!(addr = %listener.local_addr()?, "broker listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.inner.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let broker = Arc::clone(&broker);
                        tokio::spawn(handle_connection(broker, stream, peer_addr));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
    tracing::info!("accept loop stopped");
    Ok(())
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream, peer_addr: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (id, close) = broker.register_connection(writer, peer_addr);
    tracing::info!(conn = %id, addr = %peer_addr, "connection opened");

    run_dispatch(&broker, id, &mut reader, &close).await;

    broker.teardown(id);
}

/// Sequential receive loop for one connection. Content-level decode errors
/// skip the offending message; frame-level and I/O errors end the loop.
async fn run_dispatch(
    broker: &Arc<Broker>,
    id: ConnectionId,
    reader: &mut OwnedReadHalf,
    close: &CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = close.cancelled() => break,
            result = wire::read_message(reader, broker.options.max_frame_bytes) => result,
        };
        match result {
            Ok(Some((raw, message))) => {
                let routed = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    broker.route(id, raw, message);
                }));
                if routed.is_err() {
                    tracing::error!(conn = %id, "message handler panicked, closing connection");
                    break;
                }
            }
            Ok(None) => {
                tracing::info!(conn = %id, "connection closed");
                break;
            }
            Err(err @ (wire::Error::Decode(_) | wire::Error::UnknownMessageType(_))) => {
                tracing::error!(conn = %id, error = %err, "skipping undecodable message");
            }
            Err(err) => {
                tracing::error!(conn = %id, error = %err, "receive failed");
                break;
            }
        }
    }
}

impl Broker {
    /// Insert a connection into the registry and start its writer task.
    /// Returns the id and the token that closes the connection.
    pub(crate) fn register_connection(
        &self,
        writer: tokio::net::tcp::OwnedWriteHalf,
        peer_addr: SocketAddr,
    ) -> (ConnectionId, CancellationToken) {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let close = self.shutdown.child_token();
        let (outbound, outbound_rx) = mpsc::channel(self.options.outbound_queue);
        let handle = ConnectionHandle::new(id, outbound, close.clone());
        tokio::spawn(run_writer(
            writer,
            outbound_rx,
            close.clone(),
            self.options.write_timeout,
        ));

        let entry = ConnectionEntry::new(handle, peer_addr);
        let description = entry.description(id);
        lock(&self.connections).insert(id, entry);
        metrics::gauge!("cellaserv_connections_open").increment(1.0);
        self.publish_lifecycle(events::LOG_NEW_CONNECTION, &description);
        (id, close)
    }

    fn route(self: &Arc<Self>, conn: ConnectionId, raw: Bytes, message: wire::Message) {
        let payload = match wire::decode_payload(&message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(conn = %conn, error = %err, "could not decode message content");
                return;
            }
        };
        match payload {
            wire::Payload::Register(register) => self.handle_register(conn, register),
            wire::Payload::Request(request) => self.handle_request(conn, request),
            wire::Payload::Reply(reply) => self.handle_reply(conn, reply),
            wire::Payload::Subscribe(subscribe) => self.handle_subscribe(conn, subscribe),
            wire::Payload::Publish(publish) => self.handle_publish(conn, raw, publish),
        }
    }

    /// Register handler: the key is taken over unconditionally. A displaced
    /// service loses its spies; they must re-subscribe to the new owner. No
    /// acknowledgement is sent.
    fn handle_register(&self, conn: ConnectionId, register: wire::Register) {
        let key = ServiceKey::new(register.name, register.identification);
        let mut spies_to_close = Vec::new();
        let description = {
            let mut connections = lock(&self.connections);
            let mut services = lock(&self.services);
            let client = match connections.get(&conn) {
                Some(entry) => entry.describe(),
                None => return,
            };
            if let Some(previous) = services.insert(key.clone(), ServiceEntry::new(conn)) {
                tracing::info!(service = %key, "registration displaced previous owner");
                if let Some(owner) = connections.get_mut(&previous.owner) {
                    owner.services.remove(&key);
                }
                for spy_id in previous.spies {
                    if let Some(spy) = connections.get_mut(&spy_id) {
                        spy.spying.remove(&key);
                        spies_to_close.push(spy.handle.clone());
                    }
                }
            }
            if let Some(entry) = connections.get_mut(&conn) {
                entry.services.insert(key.clone());
            }
            ServiceDescription {
                name: key.name.clone(),
                identification: key.identification.clone(),
                client,
            }
        };
        for spy in spies_to_close {
            tracing::debug!(conn = %spy.id(), service = %key, "closing spy of displaced service");
            spy.close();
        }
        tracing::info!(conn = %conn, service = %key, "service registered");
        self.publish_lifecycle(events::LOG_NEW_SERVICE, &description);
    }

    fn handle_subscribe(&self, conn: ConnectionId, subscribe: wire::Subscribe) {
        let event = subscribe.event;
        {
            let mut subscribers = lock(&self.subscribers);
            if subscriptions::is_pattern(&event) {
                if let Err(err) = subscribers.add_pattern(&event, conn) {
                    tracing::warn!(conn = %conn, event = %event, error = %err, "invalid subscription pattern");
                    return;
                }
            } else {
                subscribers.add_exact(&event, conn);
            }
        }
        tracing::info!(conn = %conn, event = %event, "subscribed");
        let client = {
            let connections = lock(&self.connections);
            connections
                .get(&conn)
                .map(|entry| entry.describe())
                .unwrap_or_default()
        };
        self.publish_lifecycle(
            events::LOG_NEW_SUBSCRIBER,
            &SubscriberDescription {
                event,
                conn: client,
            },
        );
    }

    fn handle_publish(&self, conn: ConnectionId, raw: Bytes, publish: wire::Publish) {
        tracing::debug!(conn = %conn, event = %publish.event, "publish");
        // Forward the received envelope bytes verbatim.
        self.deliver_publish(&publish.event, &publish.data, wire::frame_raw(&raw));
    }

    /// Broker-originated publish (lifecycle events).
    pub(crate) fn publish_event(&self, event: &str, data: Bytes) {
        let publish = wire::Publish {
            event: event.to_string(),
            data,
        };
        let frame = wire::encode_publish(&publish);
        self.deliver_publish(&publish.event, &publish.data, frame);
    }

    /// Fan a publish frame out to every matching subscriber entry, duplicates
    /// included. Best effort: slow subscribers lose frames, never stall us.
    fn deliver_publish(&self, event: &str, data: &[u8], frame: Bytes) {
        lock(&self.logs).record(event, data);
        let targets = lock(&self.subscribers).matching(event);
        if targets.is_empty() {
            return;
        }
        let handles: Vec<ConnectionHandle> = {
            let connections = lock(&self.connections);
            targets
                .iter()
                .filter_map(|id| connections.get(id).map(|entry| entry.handle.clone()))
                .collect()
        };
        for handle in handles {
            handle.send_publish(frame.clone());
        }
    }

    /// Reply path for synthesized replies to a connection that has no tracker
    /// (unknown service).
    pub(crate) fn send_to_connection(&self, conn: ConnectionId, frame: Bytes) {
        let handle = {
            let connections = lock(&self.connections);
            connections.get(&conn).map(|entry| entry.handle.clone())
        };
        if let Some(handle) = handle {
            handle.send_forward(frame);
        }
    }

    /// Cascade cleanup once a connection's dispatch loop ends. From the
    /// perspective of every other connection the departed one is gone from
    /// all four tables at once.
    pub(crate) fn teardown(&self, id: ConnectionId) {
        let Some(entry) = lock(&self.connections).remove(&id) else {
            return;
        };
        entry.handle.close();
        let description = entry.description(id);
        let client = description.describe();

        // Services owned by this connection disappear and their spies are
        // closed; spies must notice and re-attach to a future owner.
        let mut lost = Vec::new();
        let mut spies_to_close = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let mut services = lock(&self.services);
            for key in &entry.services {
                let Some(service) = services.remove(key) else {
                    continue;
                };
                tracing::info!(service = %key, "service lost");
                for spy_id in service.spies {
                    if let Some(spy) = connections.get_mut(&spy_id) {
                        spy.spying.remove(key);
                        spies_to_close.push(spy.handle.clone());
                    }
                }
                lost.push(ServiceDescription {
                    name: key.name.clone(),
                    identification: key.identification.clone(),
                    client: client.clone(),
                });
            }
            // Detach from services this connection spied on.
            for key in &entry.spying {
                if let Some(service) = services.get_mut(key) {
                    service.spies.retain(|spy| *spy != id);
                }
            }
        }
        for spy in spies_to_close {
            tracing::debug!(conn = %spy.id(), "closing spy of lost service");
            spy.close();
        }
        for description in lost {
            self.publish_lifecycle(events::LOG_LOST_SERVICE, &description);
        }

        // Purge both subscriber tables.
        let removed = lock(&self.subscribers).remove_connection(id);
        for event in removed {
            self.publish_lifecycle(
                events::LOG_LOST_SUBSCRIBER,
                &SubscriberDescription {
                    event,
                    conn: client.clone(),
                },
            );
        }

        // Cancel trackers whose sender just left. The service may still reply
        // later; handle_reply finds no tracker and drops it silently.
        let cancelled: Vec<crate::requests::RequestTrack> = {
            let mut requests = lock(&self.requests);
            let ids: Vec<u64> = requests
                .iter()
                .filter(|(_, track)| track.sender == id)
                .map(|(request_id, _)| *request_id)
                .collect();
            ids.iter()
                .filter_map(|request_id| requests.remove(request_id))
                .collect()
        };
        for track in &cancelled {
            track.timer.abort();
        }

        metrics::gauge!("cellaserv_connections_open").decrement(1.0);
        self.publish_lifecycle(events::LOG_CLOSE_CONNECTION, &description);
        tracing::info!(conn = %id, client = %client, "connection torn down");
    }
}
