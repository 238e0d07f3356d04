//! Wire-level plumbing shared by the Panda debug bridge and the language-service
//! connector.
//!
//! Both remote endpoints speak `Content-Length` framed JSON over a plain TCP
//! stream. This crate provides:
//! - [`codec`]: incremental frame reassembly over arbitrarily chunked input.
//! - [`MessageRouter`]: request/response correlation with timeouts, plus event
//!   fan-out to registered handlers.
//! - [`ResilientChannel`]: one live duplex connection at a time, with a single
//!   "closed" notification per connection.
//! - [`ReconnectPolicy`]: the connect/backoff/stop state machine guarded by a
//!   generation token.

mod channel;
pub mod codec;
mod error;
pub mod message;
mod reconnect;
mod router;

pub use channel::{
    BoxedStream, ChannelConfig, ChannelEvent, ConnectionId, Connector, Endpoint,
    ResilientChannel, TcpConnector,
};
pub use codec::{FrameCodec, Frames};
pub use error::{Result, WireError};
pub use message::{EventMessage, Message, RequestMessage, ResponseMessage};
pub use reconnect::{ConnectionState, Generation, ReconnectPolicy, RetryMode};
pub use router::{MessageRouter, PendingReply, DEFAULT_REQUEST_TIMEOUT};

// The mock remote server is only needed for tests and downstream integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
