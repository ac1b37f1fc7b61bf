//! Delivery of unclaimed inbound messages to the UI layer.
//!
//! Responses nobody is waiting for and engine push events end up here,
//! once each and in arrival order. Scoping them to a view (by
//! [`Inbound::subject_path`]) is the consumer's job.

use tracing::debug;

use crate::models::Inbound;

/// Sink for inbound messages no pending call claimed.
pub trait ActionAdapter: Send + 'static {
    fn deliver(&mut self, message: Inbound);
}

impl ActionAdapter for tokio::sync::mpsc::UnboundedSender<Inbound> {
    fn deliver(&mut self, message: Inbound) {
        if self.send(message).is_err() {
            debug!("Adapter receiver dropped, discarding inbound message");
        }
    }
}

impl ActionAdapter for std::sync::mpsc::Sender<Inbound> {
    fn deliver(&mut self, message: Inbound) {
        if self.send(message).is_err() {
            debug!("Adapter receiver dropped, discarding inbound message");
        }
    }
}

/// Adapter for clients that only issue calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl ActionAdapter for Discard {
    fn deliver(&mut self, message: Inbound) {
        debug!("Discarding unclaimed {} message", message.header());
    }
}
