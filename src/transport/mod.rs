pub mod codec;
#[cfg(test)]
pub mod memory;
pub mod tcp;

use std::fmt;
use std::io;
use std::time::Duration;

use crate::protocol::{InboundMessage, Multipart};

/// Router-style multi-frame transport: inbound messages are tagged with the
/// sender identity, outbound messages name their destination in frame zero.
pub trait RouterTransport {
    /// Waits up to `timeout` for the next inbound message.
    fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError>;

    /// Routes `frames[1..]` to the peer identified by `frames[0]`.
    /// Unknown identities are dropped without error.
    fn send(&mut self, frames: Multipart) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub enum TransportError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    Accept { source: io::Error },
    ConfigureAcceptedStream { source: io::Error },
    Encode(codec::CodecError),
    MissingDestination,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind router endpoint on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set router listener to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept peer connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::Encode(source) => write!(f, "failed to encode outbound message: {source}"),
            Self::MissingDestination => {
                write!(f, "outbound message has no destination identity frame")
            }
        }
    }
}

impl std::error::Error for TransportError {}

impl From<codec::CodecError> for TransportError {
    fn from(value: codec::CodecError) -> Self {
        Self::Encode(value)
    }
}
