//! Transport seam between the transceiver and the wire.
//!
//! The transceiver needs exactly two capabilities from a carrier: deliver
//! inbound messages to a sink, and emit outbound messages to the peer. Any
//! reliable, in-order, datagram-like carrier can implement this.

mod loopback;
mod unix_datagram;

use thiserror::Error;

use crate::message::TransactionMessage;

pub use loopback::LoopbackTransport;
pub use unix_datagram::EndpointRole;
pub use unix_datagram::UnixDatagramTransport;

/// Callback receiving every inbound message as it arrives off the wire.
pub type MessageSink = Box<dyn Fn(TransactionMessage) + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("message exceeds the {max_bytes} byte datagram limit")]
    SizeLimit { max_bytes: usize },

    #[error("transport is already subscribed")]
    AlreadySubscribed,
}

/// Carrier capability required by the transceiver.
///
/// `emit` must be safe to call from multiple threads; it is invoked from the
/// watchdog, the server loop, and user threads concurrently.
pub trait Transport: Send + Sync + 'static {
    /// Attach to the carrier and start delivering inbound messages to
    /// `sink`. Fails with [`TransportError::AlreadySubscribed`] on a second
    /// call.
    fn subscribe(&self, sink: MessageSink) -> Result<(), TransportError>;

    /// Transmit one message to the peer.
    fn emit(&self, message: &TransactionMessage) -> Result<(), TransportError>;

    /// Detach from the carrier. After this returns the sink is no longer
    /// invoked. Idempotent.
    fn unsubscribe(&self);
}
