use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::protocol::{Frame, InboundMessage, Multipart};

use super::codec::{FrameBuffer, MultipartCodec, DEFAULT_MAX_MESSAGE_SIZE_BYTES};
use super::{RouterTransport, TransportError};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_POLL_STEP_MS: u64 = 10;
const READ_CHUNK_BYTES: usize = 64 * 1024;
const LOG_CONTEXT: &str = "transport::tcp";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,
    pub max_message_size_bytes: usize,
    pub poll_step_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            poll_step_ms: DEFAULT_POLL_STEP_MS,
        }
    }
}

impl From<&AppConfig> for RouterConfig {
    fn from(value: &AppConfig) -> Self {
        Self {
            host: value.broker.host.clone(),
            port: value.broker.port,
            max_message_size_bytes: value.transport.max_message_size_bytes,
            poll_step_ms: value.transport.poll_step_ms.max(1),
        }
    }
}

impl RouterConfig {
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

struct PeerConnection {
    peer_addr: SocketAddr,
    stream: TcpStream,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
}

enum PeerState {
    Open,
    Closed(String),
}

impl PeerConnection {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;

        Ok(Self {
            peer_addr,
            stream,
            inbound: FrameBuffer::new(),
            outbound: Vec::new(),
        })
    }

    fn flush(&mut self) -> PeerState {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return PeerState::Closed("peer stopped accepting writes".to_owned()),
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return PeerState::Closed(format!("socket write error: {error}")),
            }
        }
        PeerState::Open
    }

    fn read_available(&mut self) -> PeerState {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return PeerState::Closed("peer closed the connection".to_owned()),
                Ok(size) => self.inbound.extend(&chunk[..size]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return PeerState::Open,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return PeerState::Closed(format!("socket read error: {error}")),
            }
        }
    }
}

/// Router endpoint over plain TCP. Every accepted connection gets a random
/// 16-byte identity that prefixes its inbound messages and addresses replies.
pub struct TcpRouter {
    listener: TcpListener,
    codec: MultipartCodec,
    poll_step: Duration,
    peers: HashMap<Frame, PeerConnection>,
    inbound: VecDeque<InboundMessage>,
    logger: Arc<Logger>,
}

impl TcpRouter {
    pub fn bind(config: &RouterConfig, logger: Arc<Logger>) -> Result<Self, TransportError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address)
            .map_err(|source| TransportError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            codec: MultipartCodec::new(config.max_message_size_bytes),
            poll_step: Duration::from_millis(config.poll_step_ms.max(1)),
            peers: HashMap::new(),
            inbound: VecDeque::new(),
            logger,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn shutdown_all_connections(&mut self) {
        for peer in self.peers.values() {
            let _ = peer.stream.shutdown(Shutdown::Both);
        }
        self.peers.clear();
        self.inbound.clear();
    }

    fn accept_pending(&mut self) -> Result<(), TransportError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let identity = Uuid::new_v4().as_bytes().to_vec();
                    let connection = PeerConnection::new(stream, peer_addr)?;
                    self.logger.log(
                        LogLevel::Debug,
                        Some(LOG_CONTEXT),
                        "Accepted peer connection",
                        Some(json!({
                            "identity": hex::encode(&identity),
                            "peer_addr": peer_addr.to_string()
                        })),
                    );
                    self.peers.insert(identity, connection);
                }
                Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(source) if source.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(TransportError::Accept { source }),
            }
        }
    }

    // Flushes pending writes, reads whatever arrived and queues complete messages.
    fn pump(&mut self) {
        let mut closed = Vec::new();

        for (identity, peer) in self.peers.iter_mut() {
            if let PeerState::Closed(reason) = peer.flush() {
                closed.push((identity.clone(), reason));
                continue;
            }
            if let PeerState::Closed(reason) = peer.read_available() {
                closed.push((identity.clone(), reason));
            }

            loop {
                match peer.inbound.next_message(&self.codec) {
                    Ok(Some(frames)) => self
                        .inbound
                        .push_back(InboundMessage::new(identity.clone(), frames)),
                    Ok(None) => break,
                    Err(error) => {
                        closed.push((identity.clone(), format!("undecodable stream: {error}")));
                        break;
                    }
                }
            }
        }

        for (identity, reason) in closed {
            self.drop_peer(&identity, &reason);
        }
    }

    fn drop_peer(&mut self, identity: &[u8], reason: &str) {
        let Some(peer) = self.peers.remove(identity) else {
            return;
        };
        let _ = peer.stream.shutdown(Shutdown::Both);
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Dropped peer connection",
            Some(json!({
                "identity": hex::encode(identity),
                "peer_addr": peer.peer_addr.to_string(),
                "reason": reason
            })),
        );
    }
}

impl RouterTransport for TcpRouter {
    fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.inbound.pop_front() {
                return Ok(Some(message));
            }

            self.accept_pending()?;
            self.pump();

            if let Some(message) = self.inbound.pop_front() {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_step.min(deadline - now));
        }
    }

    fn send(&mut self, frames: Multipart) -> Result<(), TransportError> {
        let mut frames = frames.into_iter();
        let identity = frames.next().ok_or(TransportError::MissingDestination)?;
        let body: Multipart = frames.collect();

        let Some(peer) = self.peers.get_mut(&identity) else {
            self.logger.debug(
                Some(LOG_CONTEXT),
                &format!(
                    "dropping outbound message for unknown peer {}",
                    hex::encode(&identity)
                ),
            );
            return Ok(());
        };

        let encoded = self.codec.encode(&body)?;
        peer.outbound.extend_from_slice(&encoded);
        if let PeerState::Closed(reason) = peer.flush() {
            self.drop_peer(&identity, &reason);
        }

        Ok(())
    }
}
