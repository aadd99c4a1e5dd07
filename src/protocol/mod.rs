use std::fmt;

/// First post-delimiter frame of every client message.
pub const CLIENT_HEADER: &[u8] = b"BCPC01";
/// First post-delimiter frame of every worker message.
pub const WORKER_HEADER: &[u8] = b"BCPW01";

/// Service names under this prefix are answered by the broker itself.
pub const INTERNAL_SERVICE_PREFIX: &str = "mmi.";
pub const MMI_SERVICE_LOOKUP: &str = "mmi.service";
pub const MMI_FOUND: &[u8] = b"200";
pub const MMI_NOT_FOUND: &[u8] = b"404";
pub const MMI_NOT_IMPLEMENTED: &[u8] = b"501";

pub type Frame = Vec<u8>;
pub type Multipart = Vec<Frame>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerCommand {
    Ready,
    Request,
    Reply,
    Heartbeat,
    Disconnect,
}

impl WorkerCommand {
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let [byte] = frame else {
            return Err(ProtocolError::InvalidCommandFrame { len: frame.len() });
        };

        match byte {
            0x01 => Ok(Self::Ready),
            0x02 => Ok(Self::Request),
            0x03 => Ok(Self::Reply),
            0x04 => Ok(Self::Heartbeat),
            0x05 => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnknownCommand { byte: *other }),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ready => 0x01,
            Self::Request => 0x02,
            Self::Reply => 0x03,
            Self::Heartbeat => 0x04,
            Self::Disconnect => 0x05,
        }
    }

    pub fn to_frame(self) -> Frame {
        vec![self.as_byte()]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Request => "REQUEST",
            Self::Reply => "REPLY",
            Self::Heartbeat => "HEARTBEAT",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Header {
    Client,
    Worker,
}

impl Header {
    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        if frame == CLIENT_HEADER {
            Ok(Self::Client)
        } else if frame == WORKER_HEADER {
            Ok(Self::Worker)
        } else {
            Err(ProtocolError::UnknownHeader {
                header: frame.to_vec(),
            })
        }
    }
}

/// A message received on the router endpoint with the sender identity split off.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: Frame,
    pub frames: Multipart,
}

impl InboundMessage {
    pub fn new(sender: impl Into<Frame>, frames: Multipart) -> Self {
        Self {
            sender: sender.into(),
            frames,
        }
    }

    /// Full wire view, identity first, as a router socket would present it.
    pub fn to_multipart(&self) -> Multipart {
        let mut frames = Vec::with_capacity(self.frames.len() + 1);
        frames.push(self.sender.clone());
        frames.extend(self.frames.iter().cloned());
        frames
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    MissingDelimiter,
    MissingHeader,
    UnknownHeader { header: Frame },
    MissingCommand,
    InvalidCommandFrame { len: usize },
    UnknownCommand { byte: u8 },
    UnexpectedCommand { command: WorkerCommand },
    MissingServiceName,
    InvalidServiceName,
    MissingBody,
    MissingReplyEnvelope,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDelimiter => write!(f, "expected empty delimiter frame after identity"),
            Self::MissingHeader => write!(f, "message has no protocol header frame"),
            Self::UnknownHeader { header } => {
                write!(f, "unknown protocol header {}", String::from_utf8_lossy(header))
            }
            Self::MissingCommand => write!(f, "worker message has no command frame"),
            Self::InvalidCommandFrame { len } => {
                write!(f, "worker command frame must be exactly 1 byte, got {len}")
            }
            Self::UnknownCommand { byte } => write!(f, "unknown worker command 0x{byte:02x}"),
            Self::UnexpectedCommand { command } => {
                write!(f, "workers may not send {command} to the broker")
            }
            Self::MissingServiceName => write!(f, "message is missing a service name frame"),
            Self::InvalidServiceName => write!(f, "service name must be valid UTF-8"),
            Self::MissingBody => write!(f, "client request carries no body frames"),
            Self::MissingReplyEnvelope => {
                write!(f, "worker REPLY is missing the client address and delimiter")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn is_internal_service(name: &str) -> bool {
    name.starts_with(INTERNAL_SERVICE_PREFIX)
}

/// `[address][empty][WORKER-HEADER][command][payload...]`
pub fn worker_frames(address: &[u8], command: WorkerCommand, payload: Multipart) -> Multipart {
    let mut frames = Vec::with_capacity(payload.len() + 4);
    frames.push(address.to_vec());
    frames.push(Vec::new());
    frames.push(WORKER_HEADER.to_vec());
    frames.push(command.to_frame());
    frames.extend(payload);
    frames
}

/// `[client-identity][empty][CLIENT-HEADER][service-name][body...]`
pub fn client_frames(client: &[u8], service: &str, body: Multipart) -> Multipart {
    let mut frames = Vec::with_capacity(body.len() + 4);
    frames.push(client.to_vec());
    frames.push(Vec::new());
    frames.push(CLIENT_HEADER.to_vec());
    frames.push(service.as_bytes().to_vec());
    frames.extend(body);
    frames
}

/// Frame sequences as peers put them on the wire (no identity frame; the router adds it).
#[cfg(test)]
pub mod peer {
    use super::{Frame, Multipart, WorkerCommand, CLIENT_HEADER, WORKER_HEADER};

    pub fn client_request(service: &str, body: &[&[u8]]) -> Multipart {
        let mut frames = vec![Vec::new(), CLIENT_HEADER.to_vec(), service.as_bytes().to_vec()];
        frames.extend(body.iter().map(|frame| frame.to_vec()));
        frames
    }

    pub fn worker(command: WorkerCommand, payload: Multipart) -> Multipart {
        let mut frames = vec![Vec::new(), WORKER_HEADER.to_vec(), command.to_frame()];
        frames.extend(payload);
        frames
    }

    pub fn ready(service: &str) -> Multipart {
        worker(WorkerCommand::Ready, vec![service.as_bytes().to_vec()])
    }

    pub fn reply(client: &[u8], body: &[&[u8]]) -> Multipart {
        let mut payload: Multipart = vec![client.to_vec(), Frame::new()];
        payload.extend(body.iter().map(|frame| frame.to_vec()));
        worker(WorkerCommand::Reply, payload)
    }

    pub fn heartbeat() -> Multipart {
        worker(WorkerCommand::Heartbeat, Vec::new())
    }

    pub fn disconnect() -> Multipart {
        worker(WorkerCommand::Disconnect, Vec::new())
    }
}
