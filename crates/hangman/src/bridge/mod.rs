//! IPC bridge between secondary launches and the primary instance.
//!
//! # Architecture
//!
//! - **envelope**: Invocation wire format (args, working directory, environment)
//! - **codec**: Length-delimited text framing for AsyncRead/AsyncWrite
//! - **transport**: Unix socket channels (named + Linux abstract namespace)

pub mod codec;
pub mod envelope;
pub mod transport;

pub use envelope::{Envelope, EnvelopeError};
pub use transport::{
    ChannelAddress, ChannelError, ChannelListener, ClientChannel, Duplex, ServerChannel,
    TransportKind,
};
