use std::fmt;
use std::io::Cursor;

use rmpv::Value;

use crate::protocol::{Frame, Multipart};

pub const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

#[derive(Debug)]
pub enum CodecError {
    EmptyMessage,
    PayloadTooLarge { size: usize, limit: usize },
    ProtocolZeroLength,
    ProtocolLengthTooLarge { length: usize, limit: usize },
    MessagePackEncode(rmpv::encode::Error),
    MessagePackDecode(rmpv::decode::Error),
    TrailingDataInPayload,
    MessageMustBeArray,
    FrameMustBeBinary { index: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "multipart message must contain at least one frame"),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "payload size {size} exceeds limit {limit}")
            }
            Self::ProtocolZeroLength => {
                write!(f, "protocol error: message length cannot be zero")
            }
            Self::ProtocolLengthTooLarge { length, limit } => write!(
                f,
                "protocol error: message length {length} exceeds max {limit}"
            ),
            Self::MessagePackEncode(source) => write!(f, "messagepack encode error: {source}"),
            Self::MessagePackDecode(source) => write!(f, "messagepack decode error: {source}"),
            Self::TrailingDataInPayload => write!(f, "payload contains trailing MessagePack data"),
            Self::MessageMustBeArray => write!(f, "multipart message must be a MessagePack array"),
            Self::FrameMustBeBinary { index } => {
                write!(f, "frame #{index} must be a MessagePack binary value")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Stream framing for multipart messages: a 4-byte big-endian length
/// followed by a MessagePack array of binary frames.
#[derive(Clone, Copy, Debug)]
pub struct MultipartCodec {
    max_message_size_bytes: usize,
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE_BYTES)
    }
}

impl MultipartCodec {
    pub fn new(max_message_size_bytes: usize) -> Self {
        Self {
            max_message_size_bytes,
        }
    }

    pub fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_bytes
    }

    pub fn encode(&self, frames: &[Frame]) -> Result<Vec<u8>, CodecError> {
        if frames.is_empty() {
            return Err(CodecError::EmptyMessage);
        }

        let value = Value::Array(
            frames
                .iter()
                .map(|frame| Value::Binary(frame.clone()))
                .collect(),
        );
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &value).map_err(CodecError::MessagePackEncode)?;

        if payload.len() > self.max_message_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_message_size_bytes,
            });
        }

        let mut encoded = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + payload.len());
        encoded.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        encoded.extend_from_slice(&payload);
        Ok(encoded)
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<Multipart, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::ProtocolZeroLength);
        }
        if payload.len() > self.max_message_size_bytes {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_message_size_bytes,
            });
        }

        let mut cursor = Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor).map_err(CodecError::MessagePackDecode)?;
        if cursor.position() as usize != payload.len() {
            return Err(CodecError::TrailingDataInPayload);
        }

        let Value::Array(items) = value else {
            return Err(CodecError::MessageMustBeArray);
        };
        if items.is_empty() {
            return Err(CodecError::EmptyMessage);
        }

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Binary(bytes) => Ok(bytes),
                _ => Err(CodecError::FrameMustBeBinary { index }),
            })
            .collect()
    }

    /// Reads the length header at the start of `buffer`, if enough bytes arrived.
    fn declared_length(&self, buffer: &[u8]) -> Result<Option<usize>, CodecError> {
        let Some(header) = buffer.get(..FRAME_HEADER_SIZE_BYTES) else {
            return Ok(None);
        };

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(CodecError::ProtocolZeroLength);
        }
        if length > self.max_message_size_bytes {
            return Err(CodecError::ProtocolLengthTooLarge {
                length,
                limit: self.max_message_size_bytes,
            });
        }

        Ok(Some(length))
    }
}

/// Accumulates bytes read from a stream and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_message(&mut self, codec: &MultipartCodec) -> Result<Option<Multipart>, CodecError> {
        let Some(length) = codec.declared_length(&self.buffer)? else {
            return Ok(None);
        };

        let total = FRAME_HEADER_SIZE_BYTES + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let message = codec.decode_payload(&self.buffer[FRAME_HEADER_SIZE_BYTES..total]);
        self.buffer.drain(..total);
        message.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use rmpv::Value;

    use super::{CodecError, FrameBuffer, MultipartCodec, FRAME_HEADER_SIZE_BYTES};

    fn sample() -> Vec<Vec<u8>> {
        vec![Vec::new(), b"BCPC01".to_vec(), b"svc-a".to_vec(), vec![0xde, 0xad]]
    }

    fn raw_frame(value: &Value) -> Vec<u8> {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, value).expect("test payload should encode");
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn preserves_empty_delimiter_frames() {
        let codec = MultipartCodec::default();
        let encoded = codec.encode(&sample()).expect("message should encode");

        let mut buffer = FrameBuffer::new();
        buffer.extend(&encoded);
        let decoded = buffer
            .next_message(&codec)
            .expect("decode should succeed")
            .expect("message should be complete");

        assert_eq!(decoded, sample());
        assert!(decoded[0].is_empty());
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn waits_for_partial_messages() {
        let codec = MultipartCodec::default();
        let encoded = codec.encode(&sample()).expect("message should encode");
        let (head, tail) = encoded.split_at(FRAME_HEADER_SIZE_BYTES + 2);

        let mut buffer = FrameBuffer::new();
        buffer.extend(&head[..2]);
        assert!(buffer.next_message(&codec).expect("short header is fine").is_none());
        buffer.extend(&head[2..]);
        assert!(buffer.next_message(&codec).expect("partial body is fine").is_none());
        buffer.extend(tail);
        assert!(buffer.next_message(&codec).expect("complete").is_some());
    }

    #[test]
    fn yields_back_to_back_messages_in_order() {
        let codec = MultipartCodec::default();
        let mut stream = codec.encode(&[b"first".to_vec()]).expect("encode");
        stream.extend(codec.encode(&[b"second".to_vec()]).expect("encode"));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&stream);

        let first = buffer.next_message(&codec).expect("decode").expect("first");
        let second = buffer.next_message(&codec).expect("decode").expect("second");
        assert_eq!(first, vec![b"first".to_vec()]);
        assert_eq!(second, vec![b"second".to_vec()]);
        assert!(buffer.next_message(&codec).expect("decode").is_none());
    }

    #[test]
    fn rejects_zero_length_header() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&[0, 0, 0, 0]);
        let err = buffer
            .next_message(&MultipartCodec::default())
            .expect_err("zero length should fail");
        assert!(matches!(err, CodecError::ProtocolZeroLength));
    }

    #[test]
    fn rejects_declared_length_above_limit() {
        let codec = MultipartCodec::new(16);
        let mut buffer = FrameBuffer::new();
        buffer.extend(&17_u32.to_be_bytes());
        let err = buffer.next_message(&codec).expect_err("oversized should fail");
        assert!(matches!(err, CodecError::ProtocolLengthTooLarge { length: 17, limit: 16 }));
    }

    #[test]
    fn rejects_oversized_message_on_encode() {
        let codec = MultipartCodec::new(8);
        let err = codec
            .encode(&[vec![0x41; 32]])
            .expect_err("oversized payload should fail");
        assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn rejects_empty_message() {
        let codec = MultipartCodec::default();
        assert!(matches!(codec.encode(&[]), Err(CodecError::EmptyMessage)));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&raw_frame(&Value::Array(Vec::new())));
        assert!(matches!(
            buffer.next_message(&codec),
            Err(CodecError::EmptyMessage)
        ));
    }

    #[test]
    fn rejects_non_binary_frames() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&raw_frame(&Value::Array(vec![
            Value::Binary(b"ok".to_vec()),
            Value::String("text".into()),
        ])));

        let err = buffer
            .next_message(&MultipartCodec::default())
            .expect_err("string frame should fail");
        assert!(matches!(err, CodecError::FrameMustBeBinary { index: 1 }));
    }

    #[test]
    fn rejects_non_array_payload() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&raw_frame(&Value::Map(Vec::new())));
        let err = buffer
            .next_message(&MultipartCodec::default())
            .expect_err("map should fail");
        assert!(matches!(err, CodecError::MessageMustBeArray));
    }

    #[test]
    fn rejects_trailing_data_in_payload() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &Value::Array(vec![Value::Binary(vec![1])]))
            .expect("first object should encode");
        rmpv::encode::write_value(&mut payload, &Value::Nil).expect("second object should encode");

        let err = MultipartCodec::default()
            .decode_payload(&payload)
            .expect_err("trailing data should fail");
        assert!(matches!(err, CodecError::TrailingDataInPayload));
    }
}
