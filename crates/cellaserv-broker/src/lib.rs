// cellaserv broker core: connection fabric, routing tables, request tracking.
// The broker carries no business logic; it routes frames between clients and
// exposes a small introspection surface for the meta-service.
mod connection;
mod dispatch;
mod events;
mod logs;
mod requests;
mod services;
mod subscriptions;

pub mod api;
pub mod test_support;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use connection::ConnectionEntry;
use logs::LogHistory;
use requests::RequestTrack;
use services::ServiceEntry;
use subscriptions::SubscriberTables;

pub use api::{
    ConnectionDescription, EventDescription, ServiceDescription, SubscriberDescription,
};
pub use connection::ConnectionId;
pub use dispatch::{serve, Listener};
pub use events::{
    LOG_CLOSE_CONNECTION, LOG_LOST_SERVICE, LOG_LOST_SUBSCRIBER, LOG_NEW_CONNECTION,
    LOG_NEW_SERVICE, LOG_NEW_SUBSCRIBER,
};
pub use services::ServiceKey;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("no such service: {0}")]
    NoSuchService(ServiceKey),
    #[error("no such client: {0}")]
    NoSuchClient(u64),
    #[error("no such request: {0}")]
    NoSuchRequest(u64),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Broker configuration. The listen address is the only option a deployment
/// must pick; everything else has serviceable defaults.
#[derive(Debug, Clone)]
pub struct Options {
    pub listen_address: String,
    /// How long a forwarded request may stay unanswered before the broker
    /// synthesizes a timeout reply.
    pub request_timeout: Duration,
    /// Bound on a single write to a connection; a peer that cannot drain a
    /// write within this window is deemed dead and closed.
    pub write_timeout: Duration,
    /// Outbound frame queue depth per connection.
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
    /// How many published events are kept for log introspection.
    pub log_history: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:4200".to_string(),
            request_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            outbound_queue: 256,
            max_frame_bytes: cellaserv_wire::DEFAULT_MAX_FRAME_BYTES,
            log_history: 4096,
        }
    }
}

/// The broker owns four tables: connections, services, subscribers and the
/// request tracker. Each sits behind its own mutex; when two are held at
/// once they are always acquired in that order, and no lock is ever held
/// across an await point.
pub struct Broker {
    options: Options,
    shutdown: CancellationToken,
    next_connection_id: AtomicU64,
    next_request_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    services: Mutex<HashMap<ServiceKey, ServiceEntry>>,
    subscribers: Mutex<SubscriberTables>,
    requests: Mutex<HashMap<u64, RequestTrack>>,
    logs: Mutex<LogHistory>,
}

impl Broker {
    pub fn new(options: Options) -> Self {
        let logs = LogHistory::new(options.log_history);
        Self {
            options,
            shutdown: CancellationToken::new(),
            next_connection_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            connections: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(SubscriberTables::new()),
            requests: Mutex::new(HashMap::new()),
            logs: Mutex::new(logs),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Token cancelled when the broker shuts down. Connection tasks hold
    /// child tokens of it, so cancelling tears every connection down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the broker: pending senders get a shutdown error reply, then the
    /// accept loop, dispatch loops and timers are cancelled.
    pub fn trigger_shutdown(&self) {
        tracing::info!("broker shutting down");
        self.fail_pending_requests();
        self.shutdown.cancel();
    }
}

// Table locks never cross an await point; a poisoned lock only means a
// handler panicked mid-update, so recover the guard instead of unwinding.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
