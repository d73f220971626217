/// MongoDB wire protocol framing
///
/// Splits byte streams into whole wire-protocol messages and exposes just
/// enough of the header to route them: total length, opcode, request id and
/// the request id a response answers. Payloads are never interpreted beyond
/// the leading words that routing legitimately needs (query flags, OP_MSG
/// flag bits, the opcode wrapped by OP_COMPRESSED); message bytes are
/// forwarded verbatim.
pub mod hello;

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the standard message header (messageLength, requestID,
/// responseTo, opCode; all little-endian int32).
pub const HEADER_LEN: usize = 16;

/// Default ceiling on a single message, matching the server's
/// maxMessageSizeBytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// slaveOk bit in OP_QUERY flags
const QUERY_SLAVE_OK: i32 = 1 << 2;

/// moreToCome bit in OP_MSG flagBits
const MSG_MORE_TO_COME: i32 = 1 << 1;

/// Framing errors; all of them are fatal for the connection they occur on
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended mid-message")]
    Truncated,

    #[error("implausible message length {0}")]
    BadLength(i32),

    #[error("unknown opcode {0}")]
    UnknownOpcode(i32),

    #[error("malformed reply document")]
    BadDocument,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Known wire-protocol opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Compressed,
    Msg,
}

impl OpCode {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            2012 => Some(OpCode::Compressed),
            2013 => Some(OpCode::Msg),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
            OpCode::Compressed => 2012,
            OpCode::Msg => 2013,
        }
    }
}

/// Parsed standard message header
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

/// How a client message must be routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Mutating operation; must go to the primary
    Write,
    /// Read that may be served by any readable member
    Read,
    /// Read that must observe the primary
    PrimaryRead,
    /// Cursor continuation; must follow the connection that opened the cursor
    Affinity,
}

impl MessageClass {
    /// Whether the operation must target the primary when no pin exists
    pub fn needs_primary(&self) -> bool {
        !matches!(self, MessageClass::Read)
    }

    /// Whether the operation binds to (and keeps) the session's pinned
    /// backend connection
    pub fn sticky(&self) -> bool {
        !matches!(self, MessageClass::Read)
    }
}

/// One whole wire message, owned, with its raw bytes kept for verbatim
/// forwarding
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub header: MsgHeader,
    bytes: Bytes,
}

impl WireMessage {
    /// Parse a message from a complete in-memory buffer
    pub fn from_bytes(bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let header = parse_header(&bytes[..HEADER_LEN])?;
        if header.message_length as usize != bytes.len() {
            return Err(FrameError::BadLength(header.message_length));
        }
        Ok(Self { header, bytes })
    }

    /// The raw message bytes, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Little-endian int32 at the given word offset into the payload
    fn payload_word(&self, word: usize) -> Option<i32> {
        let start = HEADER_LEN + word * 4;
        let slice = self.bytes.get(start..start + 4)?;
        Some(i32::from_le_bytes(slice.try_into().unwrap()))
    }

    /// The opcode that decides routing; for OP_COMPRESSED that is the
    /// wrapped opcode carried in the first payload word
    fn effective_opcode(&self) -> OpCode {
        if self.header.op_code == OpCode::Compressed {
            if let Some(inner) = self.payload_word(0).and_then(OpCode::from_i32) {
                return inner;
            }
        }
        self.header.op_code
    }

    /// Classify the message for routing purposes
    pub fn classify(&self) -> MessageClass {
        match self.effective_opcode() {
            OpCode::Insert | OpCode::Update | OpCode::Delete | OpCode::Msg => MessageClass::Write,
            OpCode::Query => {
                // The slaveOk bit lives in the leading flags word; a
                // compressed query hides it, so route conservatively.
                let slave_ok = self.header.op_code == OpCode::Query
                    && self
                        .payload_word(0)
                        .map(|flags| flags & QUERY_SLAVE_OK != 0)
                        .unwrap_or(false);
                if slave_ok {
                    MessageClass::Read
                } else {
                    MessageClass::PrimaryRead
                }
            }
            OpCode::GetMore | OpCode::KillCursors => MessageClass::Affinity,
            OpCode::Reply | OpCode::Compressed => MessageClass::Write,
        }
    }

    /// Whether the backend will send a response that must be relayed back
    pub fn expects_reply(&self) -> bool {
        match self.effective_opcode() {
            OpCode::Query | OpCode::GetMore => true,
            OpCode::Msg => {
                if self.header.op_code == OpCode::Compressed {
                    // flagBits are inside the compressed body
                    return true;
                }
                self.payload_word(0)
                    .map(|flags| flags & MSG_MORE_TO_COME == 0)
                    .unwrap_or(true)
            }
            OpCode::Compressed => true,
            OpCode::Insert
            | OpCode::Update
            | OpCode::Delete
            | OpCode::KillCursors
            | OpCode::Reply => false,
        }
    }
}

fn parse_header(bytes: &[u8]) -> Result<MsgHeader, FrameError> {
    let word = |i: usize| i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    let message_length = word(0);
    let opcode_raw = word(3);
    let op_code = OpCode::from_i32(opcode_raw).ok_or(FrameError::UnknownOpcode(opcode_raw))?;
    Ok(MsgHeader {
        message_length,
        request_id: word(1),
        response_to: word(2),
        op_code,
    })
}

/// Read one whole message from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a message boundary.
/// Never buffers more than the single message being assembled; a declared
/// length below the header size or above `max_message_size` is rejected
/// before any body byte is read.
pub async fn read_message<R>(
    reader: &mut R,
    max_message_size: usize,
) -> Result<Option<WireMessage>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated);
        }
        filled += n;
    }

    let declared = i32::from_le_bytes(header[0..4].try_into().unwrap());
    if declared < HEADER_LEN as i32 || declared as usize > max_message_size {
        return Err(FrameError::BadLength(declared));
    }
    let parsed = parse_header(&header)?;

    let total = declared as usize;
    let mut buf = BytesMut::with_capacity(total);
    buf.extend_from_slice(&header);
    buf.resize(total, 0);
    if total > HEADER_LEN {
        match reader.read_exact(&mut buf[HEADER_LEN..]).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Truncated)
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Some(WireMessage {
        header: parsed,
        bytes: buf.freeze(),
    }))
}

/// Assemble a raw message from header fields and payload (test and probe
/// plumbing; the proxy itself never synthesizes client traffic)
pub fn build_message(request_id: i32, response_to: i32, op_code: OpCode, payload: &[u8]) -> Bytes {
    let total = HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.extend_from_slice(&(total as i32).to_le_bytes());
    buf.extend_from_slice(&request_id.to_le_bytes());
    buf.extend_from_slice(&response_to.to_le_bytes());
    buf.extend_from_slice(&op_code.as_i32().to_le_bytes());
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn query_payload(flags: i32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&flags.to_le_bytes());
        payload.extend_from_slice(b"test.coll\0");
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&(-1i32).to_le_bytes());
        // minimal empty document
        payload.extend_from_slice(&5i32.to_le_bytes());
        payload.push(0);
        payload
    }

    #[tokio::test]
    async fn test_read_message_roundtrip() {
        let raw = build_message(42, 0, OpCode::Query, &query_payload(0));
        let mut cursor = Cursor::new(raw.to_vec());

        let msg = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.header.request_id, 42);
        assert_eq!(msg.header.response_to, 0);
        assert_eq!(msg.header.op_code, OpCode::Query);
        assert_eq!(msg.as_bytes(), &raw[..]);

        // clean EOF after the message
        let next = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_read_message_mid_header_eof() {
        let raw = build_message(1, 0, OpCode::Query, &query_payload(0));
        let mut cursor = Cursor::new(raw[..7].to_vec());

        let err = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn test_read_message_mid_body_eof() {
        let raw = build_message(1, 0, OpCode::Query, &query_payload(0));
        let mut cursor = Cursor::new(raw[..raw.len() - 3].to_vec());

        let err = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn test_read_message_negative_length() {
        let mut raw = build_message(1, 0, OpCode::Query, &query_payload(0)).to_vec();
        raw[0..4].copy_from_slice(&(-5i32).to_le_bytes());
        let mut cursor = Cursor::new(raw);

        let err = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::BadLength(-5)));
    }

    #[tokio::test]
    async fn test_read_message_oversized_length() {
        let raw = build_message(1, 0, OpCode::Query, &query_payload(0));
        let mut cursor = Cursor::new(raw.to_vec());

        let err = read_message(&mut cursor, 8).await.unwrap_err();
        assert!(matches!(err, FrameError::BadLength(_)));
    }

    #[tokio::test]
    async fn test_read_message_unknown_opcode() {
        let mut raw = build_message(1, 0, OpCode::Query, &query_payload(0)).to_vec();
        raw[12..16].copy_from_slice(&9999i32.to_le_bytes());
        let mut cursor = Cursor::new(raw);

        let err = read_message(&mut cursor, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpcode(9999)));
    }

    #[test]
    fn test_classify_legacy_writes() {
        for op in [OpCode::Insert, OpCode::Update, OpCode::Delete] {
            let msg = WireMessage::from_bytes(build_message(1, 0, op, &[0u8; 8])).unwrap();
            assert_eq!(msg.classify(), MessageClass::Write);
            assert!(!msg.expects_reply());
            assert!(msg.classify().sticky());
        }
    }

    #[test]
    fn test_classify_query_slave_ok() {
        let msg =
            WireMessage::from_bytes(build_message(1, 0, OpCode::Query, &query_payload(1 << 2)))
                .unwrap();
        assert_eq!(msg.classify(), MessageClass::Read);
        assert!(msg.expects_reply());
        assert!(!msg.classify().needs_primary());
        assert!(!msg.classify().sticky());
    }

    #[test]
    fn test_classify_query_primary() {
        let msg = WireMessage::from_bytes(build_message(1, 0, OpCode::Query, &query_payload(0)))
            .unwrap();
        assert_eq!(msg.classify(), MessageClass::PrimaryRead);
        assert!(msg.expects_reply());
        assert!(msg.classify().needs_primary());
    }

    #[test]
    fn test_classify_cursor_ops() {
        for op in [OpCode::GetMore, OpCode::KillCursors] {
            let msg = WireMessage::from_bytes(build_message(1, 0, op, &[0u8; 16])).unwrap();
            assert_eq!(msg.classify(), MessageClass::Affinity);
        }
        let get_more =
            WireMessage::from_bytes(build_message(1, 0, OpCode::GetMore, &[0u8; 16])).unwrap();
        assert!(get_more.expects_reply());
        let kill =
            WireMessage::from_bytes(build_message(1, 0, OpCode::KillCursors, &[0u8; 16])).unwrap();
        assert!(!kill.expects_reply());
    }

    #[test]
    fn test_classify_op_msg() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i32.to_le_bytes());
        let msg = WireMessage::from_bytes(build_message(1, 0, OpCode::Msg, &payload)).unwrap();
        assert_eq!(msg.classify(), MessageClass::Write);
        assert!(msg.expects_reply());

        // moreToCome set: fire-and-forget
        let mut payload = Vec::new();
        payload.extend_from_slice(&(1i32 << 1).to_le_bytes());
        let msg = WireMessage::from_bytes(build_message(1, 0, OpCode::Msg, &payload)).unwrap();
        assert!(!msg.expects_reply());
    }

    #[test]
    fn test_classify_compressed_inner_opcode() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&OpCode::GetMore.as_i32().to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.push(0);
        let msg =
            WireMessage::from_bytes(build_message(1, 0, OpCode::Compressed, &payload)).unwrap();
        assert_eq!(msg.classify(), MessageClass::Affinity);
        assert!(msg.expects_reply());
    }

    #[test]
    fn test_from_bytes_length_mismatch() {
        let mut raw = build_message(1, 0, OpCode::Query, &query_payload(0)).to_vec();
        let new_len = (raw.len() as i32) + 10;
        raw[0..4].copy_from_slice(&new_len.to_le_bytes());
        let err = WireMessage::from_bytes(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, FrameError::BadLength(_)));
    }
}
