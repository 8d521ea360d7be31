// Service table entries, keyed by (name, identification).
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;

/// Unique key of a service instance: at any instant at most one connection
/// owns a given key across the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: String,
    pub identification: String,
}

impl ServiceKey {
    pub fn new(name: impl Into<String>, identification: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identification: identification.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identification.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.identification)
        }
    }
}

pub(crate) struct ServiceEntry {
    pub owner: ConnectionId,
    /// Connections receiving passive copies of this service's traffic.
    pub spies: Vec<ConnectionId>,
}

impl ServiceEntry {
    pub fn new(owner: ConnectionId) -> Self {
        Self {
            owner,
            spies: Vec::new(),
        }
    }
}
