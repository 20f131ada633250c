use std::sync::Mutex;

use crate::message::TransactionMessage;
use crate::sync::lock_or_recover;

use super::{MessageSink, Transport, TransportError};

type Emitter = Box<dyn Fn(TransactionMessage) + Send + Sync>;

/// In-process transport for tests and embedding.
///
/// Emitted messages are handed to a settable emitter function, so a test can
/// sniff them or bridge two endpoints back-to-back by feeding each side's
/// output into the other side's ingress.
#[derive(Default)]
pub struct LoopbackTransport {
    emitter: Mutex<Option<Emitter>>,
    sink: Mutex<Option<MessageSink>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the function that receives every emitted message.
    pub fn set_emitter(&self, emitter: impl Fn(TransactionMessage) + Send + Sync + 'static) {
        *lock_or_recover(&self.emitter) = Some(Box::new(emitter));
    }

    /// Inject one inbound message, as the carrier would.
    pub fn deliver(&self, message: TransactionMessage) {
        if let Some(sink) = lock_or_recover(&self.sink).as_ref() {
            sink(message);
        }
    }
}

impl Transport for LoopbackTransport {
    fn subscribe(&self, sink: MessageSink) -> Result<(), TransportError> {
        let mut slot = lock_or_recover(&self.sink);
        if slot.is_some() {
            return Err(TransportError::AlreadySubscribed);
        }
        *slot = Some(sink);
        Ok(())
    }

    fn emit(&self, message: &TransactionMessage) -> Result<(), TransportError> {
        if let Some(emitter) = lock_or_recover(&self.emitter).as_ref() {
            emitter(message.clone());
        }
        Ok(())
    }

    fn unsubscribe(&self) {
        lock_or_recover(&self.sink).take();
    }
}
