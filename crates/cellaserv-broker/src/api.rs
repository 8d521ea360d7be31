// Introspection surface consumed by the cellaserv meta-service: inspectable
// descriptions of the tables plus the few mutations the meta-service needs.
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::services::ServiceKey;
use crate::{lock, Broker, BrokerError, Result};

/// Inspectable view of a connection.
///
/// ```
/// use cellaserv_broker::ConnectionDescription;
///
/// let description = ConnectionDescription {
///     id: 3,
///     addr: "127.0.0.1:50132".to_string(),
///     name: Some("brain".to_string()),
/// };
/// assert_eq!(description.describe(), "brain");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescription {
    pub id: u64,
    pub addr: String,
    pub name: Option<String>,
}

impl ConnectionDescription {
    pub fn describe(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.addr.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub identification: String,
    /// Describe-string of the owning connection.
    pub client: String,
}

/// Payload of `log.new_subscriber` and `log.lost_subscriber`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberDescription {
    pub event: String,
    /// Describe-string of the subscribing connection.
    pub conn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDescription {
    pub event: String,
    pub subscribers: Vec<String>,
}

impl Broker {
    pub fn list_connections(&self) -> Vec<ConnectionDescription> {
        let connections = lock(&self.connections);
        let mut list: Vec<ConnectionDescription> = connections
            .iter()
            .map(|(id, entry)| entry.description(*id))
            .collect();
        list.sort_by_key(|description| description.id);
        list
    }

    pub fn list_services(&self) -> Vec<ServiceDescription> {
        let connections = lock(&self.connections);
        let services = lock(&self.services);
        let mut list: Vec<ServiceDescription> = services
            .iter()
            .map(|(key, entry)| ServiceDescription {
                name: key.name.clone(),
                identification: key.identification.clone(),
                client: connections
                    .get(&entry.owner)
                    .map(|owner| owner.describe())
                    .unwrap_or_default(),
            })
            .collect();
        list.sort_by(|a, b| (&a.name, &a.identification).cmp(&(&b.name, &b.identification)));
        list
    }

    pub fn list_events(&self) -> Vec<EventDescription> {
        let connections = lock(&self.connections);
        let subscribers = lock(&self.subscribers);
        let mut list: Vec<EventDescription> = subscribers
            .snapshot()
            .into_iter()
            .map(|(event, conns)| EventDescription {
                event,
                subscribers: conns
                    .iter()
                    .filter_map(|id| connections.get(id).map(|entry| entry.describe()))
                    .collect(),
            })
            .collect();
        list.sort_by(|a, b| a.event.cmp(&b.event));
        list
    }

    /// The connection that sent the in-flight request `broker_id`. Only valid
    /// while the request is tracked, which is exactly when a service is
    /// handling it.
    pub fn request_sender(&self, broker_id: u64) -> Option<ConnectionDescription> {
        let sender = {
            let requests = lock(&self.requests);
            requests.get(&broker_id).map(|track| track.sender)
        }?;
        let connections = lock(&self.connections);
        connections
            .get(&sender)
            .map(|entry| entry.description(sender))
    }

    /// Assign a name to the connection that sent request `broker_id`.
    pub fn rename_request_sender(&self, broker_id: u64, name: &str) -> Result<()> {
        let sender = {
            let requests = lock(&self.requests);
            requests.get(&broker_id).map(|track| track.sender)
        }
        .ok_or(BrokerError::NoSuchRequest(broker_id))?;
        let mut connections = lock(&self.connections);
        let entry = connections
            .get_mut(&sender)
            .ok_or(BrokerError::NoSuchClient(sender.0))?;
        entry.name = Some(name.to_string());
        tracing::info!(conn = %sender, name = %name, "client renamed");
        Ok(())
    }

    /// Add connection `client_id` to the spy list of a service: from now on
    /// it receives a copy of every request to, and reply from, the service.
    pub fn install_spy(&self, client_id: u64, name: &str, identification: &str) -> Result<()> {
        let key = ServiceKey::new(name, identification);
        let spy = ConnectionId(client_id);
        let mut connections = lock(&self.connections);
        let mut services = lock(&self.services);
        let service = services
            .get_mut(&key)
            .ok_or_else(|| BrokerError::NoSuchService(key.clone()))?;
        let entry = connections
            .get_mut(&spy)
            .ok_or(BrokerError::NoSuchClient(client_id))?;
        service.spies.push(spy);
        entry.spying.insert(key.clone());
        tracing::info!(conn = %spy, service = %key, "spy installed");
        Ok(())
    }

    /// Historical published events whose name matches `pattern`.
    pub fn logs_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let regex = regex::Regex::new(pattern)?;
        Ok(lock(&self.logs).matching(&regex))
    }
}
