// Well-known lifecycle events the broker publishes about itself. They go
// through the regular publish path, so any matching subscriber receives them.
use serde::Serialize;

use crate::Broker;

pub const LOG_NEW_CONNECTION: &str = "log.new_connection";
pub const LOG_CLOSE_CONNECTION: &str = "log.close_connection";
pub const LOG_NEW_SERVICE: &str = "log.new_service";
pub const LOG_LOST_SERVICE: &str = "log.lost_service";
pub const LOG_NEW_SUBSCRIBER: &str = "log.new_subscriber";
pub const LOG_LOST_SUBSCRIBER: &str = "log.lost_subscriber";

impl Broker {
    /// Publish a lifecycle event with a JSON payload describing the affected
    /// entity.
    pub(crate) fn publish_lifecycle<T: Serialize>(&self, event: &str, payload: &T) {
        match serde_json::to_vec(payload) {
            Ok(data) => self.publish_event(event, data.into()),
            Err(err) => {
                tracing::error!(event = %event, error = %err, "could not encode lifecycle payload");
            }
        }
    }
}
