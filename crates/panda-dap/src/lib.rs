//! Debug adapter for Panda scripts.
//!
//! The editor speaks DAP to this adapter over stdio; every real operation is
//! relayed to a Panda debug server embedded in the host application and reached
//! over TCP (see [`panda_wire`]).

pub mod error;
pub mod host;
pub mod server;
pub mod session;
pub mod types;

pub use error::{BridgeError, Result};
pub use host::{HostEvent, HostMessage, HostNotifier};
pub use session::{translate_event, BridgeSession, Reply};
