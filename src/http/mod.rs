//! HTTP pub/sub tailing endpoint: parses the subscription query grammar,
//! drives a `SubscriberRuntime`, and writes a chunked response.
//!
//! The general-purpose HTTP server machinery (routing, arbitrary method
//! handling, URL parsing beyond the query grammar below) is treated as
//! an external collaborator; what lives here is a minimal single-purpose
//! listener just capable enough to drive this one endpoint end to end.

pub mod query;
pub mod server;

pub use query::SubscriptionQuery;
pub use server::{HttpEndpointConfig, PayloadSchema, PubSubHttpEndpoint};
