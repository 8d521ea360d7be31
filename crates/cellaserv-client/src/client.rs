// Broker connection: background read/write tasks plus request correlation.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use cellaserv_wire as wire;
use cellaserv_wire::reply::ErrorType;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::service::Service;
use crate::{Error, Result};

const OUTBOUND_QUEUE_DEPTH: usize = 64;

type SubscribeHandler = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

struct Subscriber {
    pattern: Regex,
    handler: SubscribeHandler,
}

struct ClientInner {
    outbound: mpsc::Sender<Bytes>,
    pending: Mutex<HashMap<u64, oneshot::Sender<wire::Reply>>>,
    services: Mutex<HashMap<(String, String), Arc<Service>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_request_id: AtomicU64,
    closed: CancellationToken,
}

/// A connection to the broker. Cloning is cheap; all clones share one TCP
/// session and one request id space.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to a broker. The request id counter starts at a random value
    /// so ids do not collide with a previous incarnation after a reconnect.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let inner = Arc::new(ClientInner {
            outbound,
            pending: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_request_id: AtomicU64::new(rand::random()),
            closed: CancellationToken::new(),
        });
        tokio::spawn(run_writer(writer, outbound_rx, inner.closed.clone()));
        tokio::spawn(run_reader(Arc::clone(&inner), reader));
        Ok(Self { inner })
    }

    /// Expose a service on this connection. Incoming requests for it are
    /// dispatched to the service's method handlers.
    pub async fn register(&self, service: Service) -> Result<()> {
        let register = wire::Register {
            name: service.name().to_string(),
            identification: service.identification().to_string(),
        };
        let key = (register.name.clone(), register.identification.clone());
        lock(&self.inner.services).insert(key, Arc::new(service));
        tracing::info!(service = %register.name, "registering service");
        self.send(wire::encode_register(&register)).await
    }

    /// Issue a request and block until the matching reply arrives. The broker
    /// guarantees an eventual reply (a timeout error at worst) as long as the
    /// connection stays up.
    pub async fn request(
        &self,
        service: &str,
        identification: &str,
        method: &str,
        data: Option<serde_json::Value>,
    ) -> Result<Bytes> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let data = match data {
            Some(value) => serde_json::to_vec(&value)?.into(),
            None => Bytes::new(),
        };
        let request = wire::Request {
            id,
            service_name: service.to_string(),
            service_identification: identification.to_string(),
            method: method.to_string(),
            data,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, reply_tx);
        if let Err(err) = self.send(wire::encode_request(&request)).await {
            lock(&self.inner.pending).remove(&id);
            return Err(err);
        }

        let reply = reply_rx.await.map_err(|_| Error::ConnectionClosed)?;
        if let Some(error) = reply.error {
            let kind = ErrorType::try_from(error.r#type).unwrap_or(ErrorType::Custom);
            return Err(Error::Remote {
                kind,
                what: error.what,
            });
        }
        Ok(reply.data.unwrap_or_default())
    }

    /// Subscribe to events matching `pattern` (a regex; a literal event name
    /// matches itself). The handler runs on the read task, so keep it short.
    pub async fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let regex = Regex::new(pattern)?;
        lock(&self.inner.subscribers).push(Subscriber {
            pattern: regex,
            handler: Box::new(handler),
        });
        self.send(wire::encode_subscribe(&wire::Subscribe {
            event: pattern.to_string(),
        }))
        .await
    }

    /// Fire-and-forget publish with a JSON payload.
    pub async fn publish(&self, event: &str, data: serde_json::Value) -> Result<()> {
        let data = serde_json::to_vec(&data)?;
        self.publish_raw(event, data.into()).await
    }

    pub async fn publish_raw(&self, event: &str, data: Bytes) -> Result<()> {
        self.send(wire::encode_publish(&wire::Publish {
            event: event.to_string(),
            data,
        }))
        .await
    }

    /// Close the connection. Pending requests fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Wait until the connection is closed, by either side.
    pub async fn wait_closed(&self) {
        self.inner.closed.cancelled().await;
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = wire::write_frame(&mut writer, &frame).await {
                    tracing::error!(error = %err, "write failed");
                    break;
                }
            }
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn run_reader(inner: Arc<ClientInner>, mut reader: OwnedReadHalf) {
    loop {
        let result = tokio::select! {
            _ = inner.closed.cancelled() => break,
            result = wire::read_message(&mut reader, wire::DEFAULT_MAX_FRAME_BYTES) => result,
        };
        match result {
            Ok(Some((_, message))) => inner.handle_message(message).await,
            Ok(None) => {
                tracing::info!("broker closed the connection");
                break;
            }
            Err(err @ (wire::Error::Decode(_) | wire::Error::UnknownMessageType(_))) => {
                tracing::error!(error = %err, "skipping undecodable message");
            }
            Err(err) => {
                tracing::error!(error = %err, "receive failed");
                break;
            }
        }
    }
    inner.closed.cancel();
    // Fail every in-flight request; dropping the sender wakes the waiter.
    lock(&inner.pending).clear();
}

impl ClientInner {
    async fn handle_message(self: &Arc<Self>, message: wire::Message) {
        let payload = match wire::decode_payload(&message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "could not decode message content");
                return;
            }
        };
        match payload {
            wire::Payload::Reply(reply) => {
                match lock(&self.pending).remove(&reply.id) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => tracing::warn!(id = reply.id, "reply for unknown request"),
                };
            }
            wire::Payload::Request(request) => {
                let service = {
                    let services = lock(&self.services);
                    services
                        .get(&(
                            request.service_name.clone(),
                            request.service_identification.clone(),
                        ))
                        .cloned()
                };
                let reply = match service {
                    Some(service) => service.handle(&request),
                    None => {
                        tracing::warn!(service = %request.service_name, "request for unregistered service");
                        wire::Reply::error(
                            request.id,
                            ErrorType::Custom,
                            format!("no such service: {}", request.service_name),
                        )
                    }
                };
                if self
                    .outbound
                    .send(wire::encode_reply(&reply))
                    .await
                    .is_err()
                {
                    tracing::error!("could not send reply, connection closed");
                }
            }
            wire::Payload::Publish(publish) => {
                let subscribers = lock(&self.subscribers);
                for subscriber in subscribers.iter() {
                    if subscriber.pattern.is_match(&publish.event) {
                        (subscriber.handler)(&publish.event, &publish.data);
                    }
                }
            }
            wire::Payload::Register(_) | wire::Payload::Subscribe(_) => {
                tracing::warn!("unsupported message type for a client");
            }
        }
    }
}

// Client state locks are short-lived and never cross an await.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
