use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::protocol::{Frame, InboundMessage, Multipart};

use super::{RouterTransport, TransportError};

#[derive(Default)]
struct Queues {
    inbound: VecDeque<InboundMessage>,
    outbound: Vec<Multipart>,
}

/// In-process router used to drive the broker deterministically in tests.
/// Clones share the same queues, so a test keeps one handle after moving
/// the other into the broker.
#[derive(Clone, Default)]
pub struct MemoryRouter {
    queues: Rc<RefCell<Queues>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, sender: &[u8], frames: Multipart) {
        self.queues
            .borrow_mut()
            .inbound
            .push_back(InboundMessage::new(sender.to_vec(), frames));
    }

    /// Drains every message the broker sent so far.
    pub fn take_sent(&self) -> Vec<Multipart> {
        std::mem::take(&mut self.queues.borrow_mut().outbound)
    }

    /// Drains sent messages addressed to `identity`, without the identity frame.
    pub fn take_sent_to(&self, identity: &[u8]) -> Vec<Multipart> {
        let mut queues = self.queues.borrow_mut();
        let (matching, rest): (Vec<Multipart>, Vec<Multipart>) = queues
            .outbound
            .drain(..)
            .partition(|frames| frames.first().map(Frame::as_slice) == Some(identity));
        queues.outbound = rest;
        matching
            .into_iter()
            .map(|frames| frames.into_iter().skip(1).collect())
            .collect()
    }
}

impl RouterTransport for MemoryRouter {
    fn poll(&mut self, _timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        Ok(self.queues.borrow_mut().inbound.pop_front())
    }

    fn send(&mut self, frames: Multipart) -> Result<(), TransportError> {
        if frames.is_empty() {
            return Err(TransportError::MissingDestination);
        }
        self.queues.borrow_mut().outbound.push(frames);
        Ok(())
    }
}
