// Daemon library crate: the meta-service and process observability, exposed
// for the binary and the integration tests.
pub mod meta;
pub mod observability;
