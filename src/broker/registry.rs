use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::protocol::{Frame, Multipart};

/// Registry key for a transport address.
pub fn identity_of(address: &[u8]) -> String {
    hex::encode(address)
}

#[derive(Clone, Debug)]
pub struct Worker {
    identity: String,
    address: Frame,
    service: Option<String>,
    expiry: DateTime<Utc>,
    busy: bool,
}

impl Worker {
    pub fn new(address: &[u8], expiry: DateTime<Utc>) -> Self {
        Self {
            identity: identity_of(address),
            address: address.to_vec(),
            service: None,
            expiry,
            busy: false,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn address(&self) -> &[u8] {
        &self.address
    }

    /// Name of the bound service; a lookup key into the service registry, never ownership.
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry
    }

    /// True between a REQUEST being dispatched to the worker and its REPLY.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub(super) fn assign(&mut self) {
        self.busy = true;
    }

    pub(super) fn release(&mut self) {
        self.busy = false;
    }

    pub(super) fn bind_service(&mut self, service: &str) {
        self.service = Some(service.to_owned());
    }

    pub(super) fn refresh(&mut self, expiry: DateTime<Utc>) {
        self.expiry = expiry;
    }
}

#[derive(Clone, Debug)]
pub struct Service {
    name: String,
    pub(super) requests: VecDeque<Multipart>,
    pub(super) waiting: VecDeque<String>,
}

impl Service {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            requests: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.waiting.len()
    }

    /// Pairs the oldest idle worker with the oldest pending request.
    pub(super) fn next_assignment(&mut self) -> Option<(String, Multipart)> {
        if self.waiting.is_empty() || self.requests.is_empty() {
            return None;
        }
        let worker = self.waiting.pop_front()?;
        let request = self.requests.pop_front()?;
        Some((worker, request))
    }
}
