// Client helper for the cellaserv broker: connect, expose services, issue
// requests and subscribe to events.
mod client;
mod service;

pub use client::Client;
pub use service::Service;

pub use cellaserv_wire::reply::ErrorType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("service error ({kind:?}): {what}")]
    Remote { kind: ErrorType, what: String },
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("could not encode request data: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("wire error: {0}")]
    Wire(#[from] cellaserv_wire::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
