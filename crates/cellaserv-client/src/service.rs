// Service stub: a named endpoint with a method handler table.
use std::collections::HashMap;

use cellaserv_wire as wire;
use cellaserv_wire::reply::ErrorType;

/// Method handlers receive the forwarded request and return a JSON result or
/// an error string that becomes a `Custom` error reply.
pub type MethodHandler =
    Box<dyn Fn(&wire::Request) -> std::result::Result<serde_json::Value, String> + Send + Sync>;

/// A `(name, identification)` endpoint built with `on()` before registration.
///
/// ```
/// use cellaserv_client::Service;
/// use serde_json::json;
///
/// let service = Service::new("date", "").on("time", |_req| Ok(json!(1234)));
/// assert_eq!(service.name(), "date");
/// ```
pub struct Service {
    name: String,
    identification: String,
    handlers: HashMap<String, MethodHandler>,
}

impl Service {
    pub fn new(name: impl Into<String>, identification: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identification: identification.into(),
            handlers: HashMap::new(),
        }
    }

    /// Attach a handler for `method`.
    pub fn on<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(&wire::Request) -> std::result::Result<serde_json::Value, String>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identification(&self) -> &str {
        &self.identification
    }

    /// Run the matching handler and build the reply, echoing the request id
    /// the broker put on the wire.
    pub(crate) fn handle(&self, request: &wire::Request) -> wire::Reply {
        let Some(handler) = self.handlers.get(&request.method) else {
            return wire::Reply::error(
                request.id,
                ErrorType::Custom,
                format!("no such method: {}", request.method),
            );
        };
        match handler(request) {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(data) => wire::Reply::ok(request.id, data.into()),
                Err(err) => wire::Reply::error(request.id, ErrorType::Custom, err.to_string()),
            },
            Err(what) => wire::Reply::error(request.id, ErrorType::Custom, what),
        }
    }
}
