/// The cluster-native "describe membership" exchange
///
/// A member is asked for its self-reported role and member list with the
/// classic isMaster command over OP_QUERY against `admin.$cmd`, and the
/// handful of reply fields the topology tracker needs are scanned out of
/// the reply document. Nothing else in the document is interpreted.
use bytes::{Bytes, BytesMut};

use super::{build_message, FrameError, OpCode, WireMessage};

const BSON_DOUBLE: u8 = 0x01;
const BSON_STRING: u8 = 0x02;
const BSON_DOCUMENT: u8 = 0x03;
const BSON_ARRAY: u8 = 0x04;
const BSON_BINARY: u8 = 0x05;
const BSON_OBJECT_ID: u8 = 0x07;
const BSON_BOOL: u8 = 0x08;
const BSON_DATETIME: u8 = 0x09;
const BSON_NULL: u8 = 0x0A;
const BSON_INT32: u8 = 0x10;
const BSON_TIMESTAMP: u8 = 0x11;
const BSON_INT64: u8 = 0x12;
const BSON_DECIMAL128: u8 = 0x13;

/// Role and membership fields scanned from an isMaster reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelloReply {
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub hosts: Vec<String>,
    pub primary: Option<String>,
    pub set_name: Option<String>,
}

/// Build the isMaster request message
pub fn hello_request(request_id: i32) -> Bytes {
    let mut doc = BytesMut::new();
    doc.extend_from_slice(&0i32.to_le_bytes());
    doc.extend_from_slice(&[BSON_INT32]);
    doc.extend_from_slice(b"ismaster\0");
    doc.extend_from_slice(&1i32.to_le_bytes());
    doc.extend_from_slice(&[0]);
    let doc_len = doc.len() as i32;
    doc[0..4].copy_from_slice(&doc_len.to_le_bytes());

    let mut payload = BytesMut::new();
    payload.extend_from_slice(&0i32.to_le_bytes()); // flags
    payload.extend_from_slice(b"admin.$cmd\0");
    payload.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    payload.extend_from_slice(&(-1i32).to_le_bytes()); // numberToReturn
    payload.extend_from_slice(&doc);

    build_message(request_id, 0, OpCode::Query, &payload)
}

/// Scan the first document of an OP_REPLY for the isMaster fields
pub fn parse_hello_reply(msg: &WireMessage) -> Result<HelloReply, FrameError> {
    if msg.header.op_code != OpCode::Reply {
        return Err(FrameError::BadDocument);
    }
    let payload = &msg.as_bytes()[super::HEADER_LEN..];
    // responseFlags(4) + cursorID(8) + startingFrom(4) + numberReturned(4)
    if payload.len() < 20 {
        return Err(FrameError::BadDocument);
    }
    let number_returned = i32::from_le_bytes(payload[16..20].try_into().unwrap());
    if number_returned < 1 {
        return Err(FrameError::BadDocument);
    }
    scan_document(&payload[20..])
}

fn read_i32(doc: &[u8], pos: usize) -> Result<i32, FrameError> {
    doc.get(pos..pos + 4)
        .map(|s| i32::from_le_bytes(s.try_into().unwrap()))
        .ok_or(FrameError::BadDocument)
}

fn read_cstring(doc: &[u8], pos: usize) -> Result<(&str, usize), FrameError> {
    let rest = doc.get(pos..).ok_or(FrameError::BadDocument)?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(FrameError::BadDocument)?;
    let s = std::str::from_utf8(&rest[..nul]).map_err(|_| FrameError::BadDocument)?;
    Ok((s, pos + nul + 1))
}

fn read_string(doc: &[u8], pos: usize) -> Result<(&str, usize), FrameError> {
    let len = read_i32(doc, pos)?;
    if len < 1 {
        return Err(FrameError::BadDocument);
    }
    let start = pos + 4;
    let end = start + len as usize;
    let bytes = doc.get(start..end - 1).ok_or(FrameError::BadDocument)?;
    if doc.get(end - 1) != Some(&0) {
        return Err(FrameError::BadDocument);
    }
    let s = std::str::from_utf8(bytes).map_err(|_| FrameError::BadDocument)?;
    Ok((s, end))
}

/// Byte length of a value of the given element type starting at `pos`
fn value_len(doc: &[u8], typ: u8, pos: usize) -> Result<usize, FrameError> {
    match typ {
        BSON_DOUBLE | BSON_DATETIME | BSON_TIMESTAMP | BSON_INT64 => Ok(8),
        BSON_STRING => Ok(4 + read_i32(doc, pos)?.max(0) as usize),
        BSON_DOCUMENT | BSON_ARRAY => Ok(read_i32(doc, pos)?.max(0) as usize),
        BSON_BINARY => Ok(5 + read_i32(doc, pos)?.max(0) as usize),
        BSON_OBJECT_ID => Ok(12),
        BSON_BOOL => Ok(1),
        BSON_NULL => Ok(0),
        BSON_INT32 => Ok(4),
        BSON_DECIMAL128 => Ok(16),
        _ => Err(FrameError::BadDocument),
    }
}

fn scan_document(doc: &[u8]) -> Result<HelloReply, FrameError> {
    let total = read_i32(doc, 0)? as usize;
    if total < 5 || total > doc.len() {
        return Err(FrameError::BadDocument);
    }
    let mut reply = HelloReply::default();
    let mut pos = 4;
    while pos < total - 1 {
        let typ = *doc.get(pos).ok_or(FrameError::BadDocument)?;
        let (name, value_pos) = read_cstring(doc, pos + 1)?;
        match (typ, name) {
            (BSON_BOOL, "ismaster") | (BSON_BOOL, "isWritablePrimary") => {
                reply.is_writable_primary =
                    *doc.get(value_pos).ok_or(FrameError::BadDocument)? != 0;
            }
            (BSON_BOOL, "secondary") => {
                reply.secondary = *doc.get(value_pos).ok_or(FrameError::BadDocument)? != 0;
            }
            (BSON_STRING, "primary") => {
                let (value, _) = read_string(doc, value_pos)?;
                reply.primary = Some(value.to_string());
            }
            (BSON_STRING, "setName") => {
                let (value, _) = read_string(doc, value_pos)?;
                reply.set_name = Some(value.to_string());
            }
            (BSON_ARRAY, "hosts") => {
                let len = read_i32(doc, value_pos)?.max(0) as usize;
                let sub = doc
                    .get(value_pos..value_pos + len)
                    .ok_or(FrameError::BadDocument)?;
                reply.hosts = scan_string_array(sub)?;
            }
            _ => {}
        }
        pos = value_pos + value_len(doc, typ, value_pos)?;
        if pos > total {
            return Err(FrameError::BadDocument);
        }
    }
    if doc.get(total - 1) != Some(&0) {
        return Err(FrameError::BadDocument);
    }
    Ok(reply)
}

fn scan_string_array(doc: &[u8]) -> Result<Vec<String>, FrameError> {
    let total = read_i32(doc, 0)? as usize;
    if total < 5 || total > doc.len() {
        return Err(FrameError::BadDocument);
    }
    let mut values = Vec::new();
    let mut pos = 4;
    while pos < total - 1 {
        let typ = *doc.get(pos).ok_or(FrameError::BadDocument)?;
        let (_, value_pos) = read_cstring(doc, pos + 1)?;
        if typ == BSON_STRING {
            let (value, _) = read_string(doc, value_pos)?;
            values.push(value.to_string());
        }
        pos = value_pos + value_len(doc, typ, value_pos)?;
        if pos > total {
            return Err(FrameError::BadDocument);
        }
    }
    Ok(values)
}
