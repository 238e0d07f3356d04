//! Language-service side of the Panda editor integration.
//!
//! [`ServiceConnector`] keeps one TCP connection to the Panda language server
//! alive for the whole editor session, retrying at a fixed delay and restarting
//! after drops. [`relay`] bridges the editor's stdio LSP stream onto it.

mod connector;
pub mod relay;

pub use connector::{ServiceClient, ServiceConnector, ServiceLink};
pub use relay::Relay;
