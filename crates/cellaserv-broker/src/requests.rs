// In-flight request tracking: broker-scoped ids, timeout timers, reply
// correlation and spy fan-out.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use cellaserv_wire as wire;
use cellaserv_wire::reply::ErrorType;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::services::ServiceKey;
use crate::{lock, Broker};

/// One record per forwarded request. The record exists from forward until a
/// matching reply, the timeout, teardown of the sender, or shutdown.
pub(crate) struct RequestTrack {
    pub sender: ConnectionId,
    pub sender_handle: ConnectionHandle,
    /// The id the client put on the wire; restored on the outgoing reply.
    pub client_id: u64,
    pub service: ServiceKey,
    /// Spies of the target service, snapshotted at forward time.
    pub spies: Vec<ConnectionHandle>,
    pub start: Instant,
    pub timer: JoinHandle<()>,
}

impl Broker {
    /// Route a request to its target service. The id on the wire is replaced
    /// by a broker-scoped one so client id spaces never collide; the original
    /// id is restored on the way back.
    pub(crate) fn handle_request(self: &Arc<Self>, conn: ConnectionId, request: wire::Request) {
        metrics::counter!("cellaserv_requests_total").increment(1);
        let key = ServiceKey::new(
            request.service_name.clone(),
            request.service_identification.clone(),
        );

        let target = {
            let services = lock(&self.services);
            services
                .get(&key)
                .map(|entry| (entry.owner, entry.spies.clone()))
        };
        let Some((owner, spy_ids)) = target else {
            tracing::warn!(conn = %conn, service = %key, "request for unknown service");
            let reply = wire::Reply::error(
                request.id,
                ErrorType::NoSuchService,
                format!("no such service: {key}"),
            );
            self.send_to_connection(conn, wire::encode_reply(&reply));
            return;
        };

        let (sender_handle, owner_handle, spy_handles) = {
            let connections = lock(&self.connections);
            let sender = connections.get(&conn).map(|entry| entry.handle.clone());
            let owner_handle = connections.get(&owner).map(|entry| entry.handle.clone());
            let spies: Vec<ConnectionHandle> = spy_ids
                .iter()
                .filter_map(|spy| connections.get(spy).map(|entry| entry.handle.clone()))
                .collect();
            (sender, owner_handle, spies)
        };
        // The sender disappearing between read and dispatch leaves nobody to
        // answer; drop the request.
        let Some(sender_handle) = sender_handle else {
            return;
        };

        let broker_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut forwarded = request;
        let client_id = forwarded.id;
        forwarded.id = broker_id;
        let frame = wire::encode_request(&forwarded);

        let timer = tokio::spawn({
            let broker = Arc::clone(self);
            async move {
                tokio::time::sleep(broker.options.request_timeout).await;
                broker.expire_request(broker_id);
            }
        });
        lock(&self.requests).insert(
            broker_id,
            RequestTrack {
                sender: conn,
                sender_handle,
                client_id,
                service: key.clone(),
                spies: spy_handles.clone(),
                start: Instant::now(),
                timer,
            },
        );

        tracing::debug!(
            id = broker_id,
            service = %key,
            method = %forwarded.method,
            "forwarding request"
        );
        if let Some(owner_handle) = owner_handle {
            owner_handle.send_forward(frame.clone());
        }
        // An absent owner connection means the service is mid-teardown; the
        // timer will surface a timeout to the sender.
        for spy in &spy_handles {
            spy.send_publish(frame.clone());
        }
    }

    /// Correlate a reply with its tracked request and forward it, with the
    /// client's original id restored, to the sender and every recorded spy.
    pub(crate) fn handle_reply(&self, conn: ConnectionId, reply: wire::Reply) {
        let Some(track) = lock(&self.requests).remove(&reply.id) else {
            // Timed out, sender closed, or never ours; drop it.
            tracing::warn!(conn = %conn, id = reply.id, "reply for unknown request id");
            return;
        };
        track.timer.abort();
        let latency = track.start.elapsed();
        metrics::histogram!("cellaserv_request_latency_seconds").record(latency.as_secs_f64());

        let mut restored = reply;
        restored.id = track.client_id;
        let frame = wire::encode_reply(&restored);
        for spy in &track.spies {
            spy.send_publish(frame.clone());
        }
        tracing::debug!(
            id = restored.id,
            service = %track.service,
            latency_ms = latency.as_millis() as u64,
            "forwarding reply"
        );
        track.sender_handle.send_forward(frame);
    }

    /// Timer callback: the service never answered within the configured
    /// window. Synthesize a timeout reply for the sender.
    pub(crate) fn expire_request(&self, broker_id: u64) {
        let Some(track) = lock(&self.requests).remove(&broker_id) else {
            return;
        };
        metrics::counter!("cellaserv_request_timeouts_total").increment(1);
        tracing::warn!(id = broker_id, service = %track.service, "request timed out");
        let reply = wire::Reply::error(
            track.client_id,
            ErrorType::Timeout,
            format!("request to {} timed out", track.service),
        );
        let frame = wire::encode_reply(&reply);
        for spy in &track.spies {
            spy.send_publish(frame.clone());
        }
        track.sender_handle.send_forward(frame);
    }

    /// Shutdown path: every pending sender gets an error reply before the
    /// connections go away.
    pub(crate) fn fail_pending_requests(&self) {
        let drained: Vec<RequestTrack> = lock(&self.requests).drain().map(|(_, t)| t).collect();
        for track in drained {
            track.timer.abort();
            let reply =
                wire::Reply::error(track.client_id, ErrorType::Custom, "broker shutting down");
            track.sender_handle.send_forward(wire::encode_reply(&reply));
        }
    }
}
