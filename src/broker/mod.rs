pub mod clock;
pub mod registry;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::diagnostics::dump_message;
use crate::heartbeat::{HeartbeatError, HeartbeatPolicy};
use crate::hooks::{LifecycleEvent, LifecycleHooks};
use crate::logging::{LogLevel, Logger};
use crate::protocol::{
    client_frames, is_internal_service, worker_frames, Frame, Header, InboundMessage, Multipart,
    ProtocolError, WorkerCommand, MMI_FOUND, MMI_NOT_FOUND, MMI_NOT_IMPLEMENTED,
    MMI_SERVICE_LOOKUP,
};
use crate::shutdown::StopToken;
use crate::transport::{RouterTransport, TransportError};

use clock::{Clock, SystemClock};
use registry::{identity_of, Service, Worker};

const CLIENT_CONTEXT: &str = "broker::client";
const WORKER_CONTEXT: &str = "broker::worker";
const LIVENESS_CONTEXT: &str = "broker::liveness";
const DUMP_CONTEXT: &str = "broker::dump";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerSettings {
    pub heartbeat: HeartbeatPolicy,
    /// Dump every inbound and outbound message to the log.
    pub verbose: bool,
}

impl BrokerSettings {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, HeartbeatError> {
        Ok(Self {
            heartbeat: HeartbeatPolicy::try_from(config.heartbeat)?,
            verbose: config.broker.verbose > 0,
        })
    }
}

#[derive(Debug)]
pub enum BrokerError {
    Transport(TransportError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(source) => write!(f, "broker transport failure: {source}"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<TransportError> for BrokerError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

/// Routes client requests to idle workers of the addressed service and relays
/// replies back, tracking worker liveness with heartbeats.
///
/// All registries live here and are only touched from the loop that owns the
/// broker, so no locking is involved.
pub struct Broker<T: RouterTransport> {
    transport: T,
    settings: BrokerSettings,
    logger: Arc<Logger>,
    clock: Box<dyn Clock>,
    hooks: LifecycleHooks,
    stop: StopToken,
    services: HashMap<String, Service>,
    workers: HashMap<String, Worker>,
    waiting: VecDeque<String>,
    heartbeat_at: DateTime<Utc>,
}

impl<T: RouterTransport> Broker<T> {
    pub fn new(transport: T, settings: BrokerSettings, logger: Arc<Logger>) -> Self {
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let heartbeat_at = settings.heartbeat.next_due_from(clock.now());

        Self {
            transport,
            settings,
            logger,
            clock,
            hooks: LifecycleHooks::new(),
            stop: StopToken::new(),
            services: HashMap::new(),
            workers: HashMap::new(),
            waiting: VecDeque::new(),
            heartbeat_at,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.heartbeat_at = self.settings.heartbeat.next_due_from(clock.now());
        self.clock = Box::new(clock);
        self
    }

    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Runs until the stop token fires. The token is checked before every poll
    /// and again as soon as a poll returns, so shutdown happens between messages.
    pub fn run(&mut self) -> Result<(), BrokerError> {
        self.logger.log(
            LogLevel::Info,
            Some("broker"),
            "Broker loop started",
            Some(self.settings.heartbeat.metadata_payload()),
        );

        while !self.stop.is_triggered() {
            let inbound = self.transport.poll(self.settings.heartbeat.poll_timeout())?;
            if self.stop.is_triggered() {
                break;
            }
            self.step(inbound);
        }

        self.logger.info(Some("broker"), "Broker loop stopped");
        Ok(())
    }

    /// One loop iteration: handle the message (if any), reap expired workers,
    /// then heartbeat idle workers when due.
    pub fn step(&mut self, inbound: Option<InboundMessage>) {
        if let Some(message) = inbound {
            self.process_message(message);
        }
        self.purge_workers();
        self.send_heartbeats();
    }

    pub fn process_message(&mut self, message: InboundMessage) {
        if self.settings.verbose {
            self.dump("Received message", &message.to_multipart());
        }

        let result = match split_header(&message.frames) {
            Ok((Header::Client, rest)) => self
                .process_client(&message.sender, rest)
                .map_err(|error| (Header::Client, error)),
            Ok((Header::Worker, rest)) => self
                .process_worker(&message.sender, rest)
                .map_err(|error| (Header::Worker, error)),
            Err(error) => {
                self.report_invalid(None, &error, &message);
                return;
            }
        };

        let Err((header, error)) = result else {
            return;
        };
        self.report_invalid(Some(header), &error, &message);
        if header == Header::Worker {
            self.reject_peer(&message.sender, "malformed worker message");
        }
    }

    /// `frames` is everything after the client header: `[service][body...]`.
    pub fn process_client(&mut self, sender: &[u8], frames: &[Frame]) -> Result<(), ProtocolError> {
        let [service, body @ ..] = frames else {
            return Err(ProtocolError::MissingServiceName);
        };
        if body.is_empty() {
            return Err(ProtocolError::MissingBody);
        }
        let service =
            std::str::from_utf8(service).map_err(|_| ProtocolError::InvalidServiceName)?;

        let mut envelope: Multipart = Vec::with_capacity(body.len() + 2);
        envelope.push(sender.to_vec());
        envelope.push(Frame::new());
        envelope.extend(body.iter().cloned());

        if is_internal_service(service) {
            self.service_internal(service, envelope);
        } else {
            self.dispatch(service, Some(envelope));
        }
        Ok(())
    }

    /// `frames` is everything after the worker header: `[command][payload...]`.
    ///
    /// A READY from an already registered identity resets the registration:
    /// the stale entry is deleted without a DISCONNECT and a fresh one is
    /// created, so `on_disconnection` fires for the old service before
    /// `on_connection` fires for the new one. A REPLY is only accepted from a
    /// worker that currently holds a dispatched request.
    pub fn process_worker(&mut self, sender: &[u8], frames: &[Frame]) -> Result<(), ProtocolError> {
        let [command, payload @ ..] = frames else {
            return Err(ProtocolError::MissingCommand);
        };
        let command = WorkerCommand::from_frame(command)?;
        let identity = identity_of(sender);
        let worker_ready = self.workers.contains_key(&identity);

        match command {
            WorkerCommand::Ready => {
                let [service, ..] = payload else {
                    return Err(ProtocolError::MissingServiceName);
                };
                let service =
                    std::str::from_utf8(service).map_err(|_| ProtocolError::InvalidServiceName)?;

                if is_internal_service(service) {
                    self.reject_peer(sender, "READY for reserved service name");
                    return Ok(());
                }
                if worker_ready {
                    self.logger.warn(
                        Some(WORKER_CONTEXT),
                        &format!("worker {identity} sent READY twice; resetting its registration"),
                    );
                    self.delete_worker(&identity, false, "duplicate READY");
                }

                self.register_worker(sender, service);
            }
            WorkerCommand::Reply => {
                let state = self
                    .workers
                    .get(&identity)
                    .map(|worker| (worker.is_busy(), worker.service().map(str::to_owned)));
                let service = match state {
                    None | Some((_, None)) => {
                        self.reject_peer(sender, "REPLY from unregistered worker");
                        return Ok(());
                    }
                    Some((false, Some(_))) => {
                        self.reject_peer(sender, "REPLY without an outstanding request");
                        return Ok(());
                    }
                    Some((true, Some(service))) => service,
                };

                let [client, delimiter, body @ ..] = payload else {
                    return Err(ProtocolError::MissingReplyEnvelope);
                };
                if !delimiter.is_empty() {
                    return Err(ProtocolError::MissingReplyEnvelope);
                }

                self.send(client_frames(client, &service, body.to_vec()));
                if let Some(worker) = self.workers.get_mut(&identity) {
                    worker.release();
                }
                self.worker_waiting(&identity);
            }
            WorkerCommand::Heartbeat => {
                if !worker_ready {
                    self.reject_peer(sender, "HEARTBEAT from unregistered worker");
                    return Ok(());
                }
                let expiry = self.settings.heartbeat.expiry_from(self.clock.now());
                if let Some(worker) = self.workers.get_mut(&identity) {
                    worker.refresh(expiry);
                }
            }
            WorkerCommand::Disconnect => {
                self.delete_worker(&identity, false, "worker disconnected");
            }
            WorkerCommand::Request => {
                return Err(ProtocolError::UnexpectedCommand { command });
            }
        }

        Ok(())
    }

    /// Queues `message` (if any) on the service, then hands pending requests to
    /// idle workers in arrival order until either queue runs dry.
    pub fn dispatch(&mut self, service_name: &str, message: Option<Multipart>) {
        if let Some(message) = message {
            self.require_service(service_name).requests.push_back(message);
        }

        self.purge_workers();

        loop {
            let Some(service) = self.services.get_mut(service_name) else {
                return;
            };
            let Some((identity, request)) = service.next_assignment() else {
                return;
            };

            self.waiting.retain(|waiting| waiting != &identity);
            let Some(address) = self.workers.get_mut(&identity).map(|worker| {
                worker.assign();
                worker.address().to_vec()
            }) else {
                // Stale queue entry; keep the request for the next idle worker.
                if let Some(service) = self.services.get_mut(service_name) {
                    service.requests.push_front(request);
                }
                continue;
            };

            self.send_to_worker(&address, WorkerCommand::Request, request);
        }
    }

    /// Deletes idle workers whose expiry has passed. Busy workers are not in the
    /// waiting list and are therefore not checked here.
    pub fn purge_workers(&mut self) {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .waiting
            .iter()
            .filter(|identity| {
                self.workers
                    .get(identity.as_str())
                    .map_or(true, |worker| worker.is_expired(now))
            })
            .cloned()
            .collect();

        for identity in expired {
            self.logger.log(
                LogLevel::Info,
                Some(LIVENESS_CONTEXT),
                "Deleting expired worker",
                Some(json!({
                    "identity": identity,
                    "now": now.to_rfc3339_opts(SecondsFormat::Millis, true)
                })),
            );
            self.delete_worker(&identity, false, "heartbeat expired");
        }
    }

    pub fn send_heartbeats(&mut self) {
        let now = self.clock.now();
        if now < self.heartbeat_at {
            return;
        }

        let addresses: Vec<Frame> = self
            .waiting
            .iter()
            .filter_map(|identity| self.workers.get(identity))
            .map(|worker| worker.address().to_vec())
            .collect();
        for address in addresses {
            self.send_to_worker(&address, WorkerCommand::Heartbeat, Vec::new());
        }

        self.heartbeat_at = self.settings.heartbeat.next_due_from(now);
    }

    /// Removes the worker from every registry. No-op for unknown identities.
    pub fn delete_worker(&mut self, identity: &str, disconnect: bool, reason: &str) {
        self.waiting.retain(|waiting| waiting != identity);
        let Some(worker) = self.workers.remove(identity) else {
            return;
        };

        if disconnect {
            self.send_to_worker(worker.address(), WorkerCommand::Disconnect, Vec::new());
        }

        if let Some(service_name) = worker.service() {
            if let Some(service) = self.services.get_mut(service_name) {
                service.waiting.retain(|waiting| waiting != identity);
            }
            self.hooks
                .notify(LifecycleEvent::Disconnection, service_name, &self.logger);
        }

        self.logger.log(
            LogLevel::Info,
            Some(WORKER_CONTEXT),
            "Worker deleted",
            Some(json!({
                "identity": identity,
                "service": worker.service(),
                "reason": reason,
                "disconnect_sent": disconnect
            })),
        );
    }

    /// Returns the registry key for `address`, creating the worker entry on first sight.
    pub fn require_worker(&mut self, address: &[u8]) -> String {
        let identity = identity_of(address);
        if !self.workers.contains_key(&identity) {
            let expiry = self.settings.heartbeat.expiry_from(self.clock.now());
            self.workers
                .insert(identity.clone(), Worker::new(address, expiry));
            self.logger.debug(
                Some(WORKER_CONTEXT),
                &format!("registering new worker {identity}"),
            );
        }
        identity
    }

    pub fn require_service(&mut self, name: &str) -> &mut Service {
        if !self.services.contains_key(name) {
            self.logger
                .debug(Some(CLIENT_CONTEXT), &format!("registering new service '{name}'"));
        }
        self.services
            .entry(name.to_owned())
            .or_insert_with(|| Service::new(name))
    }

    /// Marks the worker idle, refreshes its expiry and offers it pending work.
    /// Busy workers and workers already queued as idle are left where they are.
    pub fn worker_waiting(&mut self, identity: &str) {
        let expiry = self.settings.heartbeat.expiry_from(self.clock.now());
        let already_waiting = self.is_waiting(identity);
        let Some(worker) = self.workers.get_mut(identity) else {
            return;
        };
        if worker.is_busy() {
            return;
        }
        let Some(service_name) = worker.service().map(str::to_owned) else {
            return;
        };
        worker.refresh(expiry);
        if already_waiting {
            return;
        }

        self.waiting.push_back(identity.to_owned());
        self.require_service(&service_name)
            .waiting
            .push_back(identity.to_owned());
        self.dispatch(&service_name, None);
    }

    pub fn send_to_worker(&mut self, address: &[u8], command: WorkerCommand, payload: Multipart) {
        self.send(worker_frames(address, command, payload));
    }

    /// Answers `mmi.*` requests directly. `envelope` is `[client][empty][body...]`.
    pub fn service_internal(&mut self, service: &str, mut envelope: Multipart) {
        let code = if service == MMI_SERVICE_LOOKUP {
            let target = envelope
                .last()
                .map(|frame| String::from_utf8_lossy(frame).into_owned())
                .unwrap_or_default();
            let available = self
                .workers
                .values()
                .any(|worker| worker.service() == Some(target.as_str()));
            if available {
                MMI_FOUND
            } else {
                MMI_NOT_FOUND
            }
        } else {
            MMI_NOT_IMPLEMENTED
        };

        if let Some(last) = envelope.last_mut() {
            *last = code.to_vec();
        }
        let client = envelope.remove(0);
        let body = envelope.split_off(1);
        self.send(client_frames(&client, service, body));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn has_worker(&self, identity: &str) -> bool {
        self.workers.contains_key(identity)
    }

    pub fn is_waiting(&self, identity: &str) -> bool {
        self.waiting.iter().any(|waiting| waiting == identity)
    }

    pub fn worker(&self, identity: &str) -> Option<&Worker> {
        self.workers.get(identity)
    }

    pub fn pending_requests(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map_or(0, Service::pending_requests)
    }

    pub fn idle_workers_for(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, Service::idle_workers)
    }

    pub fn registry_snapshot(&self) -> Value {
        let mut services: Vec<&Service> = self.services.values().collect();
        services.sort_by(|left, right| left.name().cmp(right.name()));

        json!({
            "workers": self.workers.len(),
            "waiting": self.waiting.len(),
            "services": services
                .into_iter()
                .map(|service| json!({
                    "name": service.name(),
                    "pending_requests": service.pending_requests(),
                    "idle_workers": service.idle_workers()
                }))
                .collect::<Vec<_>>()
        })
    }

    fn register_worker(&mut self, sender: &[u8], service: &str) {
        let identity = self.require_worker(sender);
        if let Some(worker) = self.workers.get_mut(&identity) {
            worker.bind_service(service);
        }
        self.require_service(service);

        self.logger.log(
            LogLevel::Info,
            Some(WORKER_CONTEXT),
            "Worker ready",
            Some(json!({ "identity": identity, "service": service })),
        );
        self.hooks
            .notify(LifecycleEvent::Connection, service, &self.logger);
        self.worker_waiting(&identity);
    }

    // Drops a misbehaving peer: deletes its entry (if any) and tells it to disconnect.
    fn reject_peer(&mut self, sender: &[u8], reason: &str) {
        let identity = identity_of(sender);
        self.logger.warn(
            Some(WORKER_CONTEXT),
            &format!("protocol violation from {identity}: {reason}; disconnecting"),
        );

        if self.workers.contains_key(&identity) {
            self.delete_worker(&identity, true, reason);
        } else {
            self.send_to_worker(sender, WorkerCommand::Disconnect, Vec::new());
        }
    }

    fn report_invalid(&self, header: Option<Header>, error: &ProtocolError, message: &InboundMessage) {
        let context = match header {
            Some(Header::Client) => CLIENT_CONTEXT,
            Some(Header::Worker) => WORKER_CONTEXT,
            None => "broker",
        };
        self.logger.error(Some(context), &format!("invalid message: {error}"));
        self.logger.block(
            LogLevel::Error,
            Some(DUMP_CONTEXT),
            &format!("from {}", identity_of(&message.sender)),
            &dump_message(&message.to_multipart()),
        );
    }

    fn send(&mut self, frames: Multipart) {
        if self.settings.verbose {
            self.dump("Sending message", &frames);
        }
        if let Err(error) = self.transport.send(frames) {
            self.logger
                .warn(Some("broker"), &format!("failed to send message: {error}"));
        }
    }

    fn dump(&self, title: &str, frames: &[Frame]) {
        self.logger
            .block(LogLevel::Info, Some(DUMP_CONTEXT), title, &dump_message(frames));
    }
}

// Splits `[empty][header][rest...]` into the decoded header and the rest.
fn split_header(frames: &[Frame]) -> Result<(Header, &[Frame]), ProtocolError> {
    let [delimiter, rest @ ..] = frames else {
        return Err(ProtocolError::MissingDelimiter);
    };
    if !delimiter.is_empty() {
        return Err(ProtocolError::MissingDelimiter);
    }
    let [header, rest @ ..] = rest else {
        return Err(ProtocolError::MissingHeader);
    };

    Ok((Header::from_frame(header)?, rest))
}
