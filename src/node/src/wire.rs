//! Wire messages for the fixed RPC method table: Insert, Merge, Estimate
//! and the gossip digest exchange.
//!
//! One tag byte selects the message, followed by its fields. Strings and
//! byte blobs are varint-length-prefixed; the digest and estimate are fixed
//! width big-endian. Decoding is strict: unknown tags, truncation and
//! trailing bytes are protocol errors, answered or dropped but never
//! panicked on.

use bytes::{Buf, BufMut};

use countmesh_sketch::varint::VarInt;

use crate::error::NodeError;

const REQ_INSERT: u8 = 0x01;
const REQ_MERGE: u8 = 0x02;
const REQ_ESTIMATE: u8 = 0x03;
const REQ_DIGEST_EXCHANGE: u8 = 0x04;

const RESP_ACK: u8 = 0x81;
const RESP_ESTIMATE: u8 = 0x82;
const RESP_DIGEST_MATCH: u8 = 0x83;
const RESP_DIGEST_DIFFER: u8 = 0x84;
const RESP_ERROR: u8 = 0xff;

/// Longest sketch id or element accepted on the wire.
const MAX_FIELD_LEN: u64 = 1 << 16;
/// Longest serialized sketch accepted on the wire: dense p=18 plus header
/// slack.
pub const MAX_SKETCH_LEN: u64 = (1 << 18) + 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Insert {
        sketch_id: String,
        element: Vec<u8>,
    },
    Merge {
        sketch_id: String,
        sketch: Vec<u8>,
    },
    Estimate {
        sketch_id: String,
    },
    /// The gossip probe: sender offers its digest; the responder answers
    /// with a match or its own serialized sketch.
    DigestExchange {
        sketch_id: String,
        sender: String,
        digest: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ack,
    Estimate(f64),
    DigestMatch,
    DigestDiffer { sketch: Vec<u8> },
    Error(ErrorCode),
}

/// ErrorCode is the cross-node projection of NodeError: just enough for
/// the caller to decide whether the failure is its fault, routine, or the
/// responder's local problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PrecisionMismatch,
    MalformedPayload,
    UnknownSketch,
    ReadOnly,
    Overloaded,
    Internal,
}

impl ErrorCode {
    fn to_u8(self) -> u8 {
        match self {
            ErrorCode::PrecisionMismatch => 1,
            ErrorCode::MalformedPayload => 2,
            ErrorCode::UnknownSketch => 3,
            ErrorCode::ReadOnly => 4,
            ErrorCode::Overloaded => 5,
            ErrorCode::Internal => 6,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::PrecisionMismatch),
            2 => Some(ErrorCode::MalformedPayload),
            3 => Some(ErrorCode::UnknownSketch),
            4 => Some(ErrorCode::ReadOnly),
            5 => Some(ErrorCode::Overloaded),
            6 => Some(ErrorCode::Internal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PrecisionMismatch => "precision mismatch",
            ErrorCode::MalformedPayload => "malformed payload",
            ErrorCode::UnknownSketch => "unknown sketch",
            ErrorCode::ReadOnly => "node is read-only",
            ErrorCode::Overloaded => "node is overloaded",
            ErrorCode::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn put_blob(buf: &mut Vec<u8>, blob: &[u8]) {
    (blob.len() as u64).encode_var(buf);
    buf.extend_from_slice(blob);
}

fn get_blob(cursor: &mut &[u8], max: u64, what: &str) -> Result<Vec<u8>, NodeError> {
    let (len, n) = u64::decode_var(*cursor)
        .ok_or_else(|| NodeError::Protocol(format!("bad {} length", what)))?;
    cursor.advance(n);
    if len > max {
        return Err(NodeError::Protocol(format!(
            "{} is {} bytes, exp <= {}",
            what, len, max
        )));
    }
    let len = len as usize;
    if cursor.remaining() < len {
        return Err(NodeError::Protocol(format!("truncated {}", what)));
    }
    let blob = cursor[..len].to_vec();
    cursor.advance(len);
    Ok(blob)
}

fn get_string(cursor: &mut &[u8], what: &str) -> Result<String, NodeError> {
    let blob = get_blob(cursor, MAX_FIELD_LEN, what)?;
    String::from_utf8(blob).map_err(|_| NodeError::Protocol(format!("{} is not utf-8", what)))
}

fn check_drained(cursor: &[u8]) -> Result<(), NodeError> {
    if cursor.has_remaining() {
        return Err(NodeError::Protocol(format!(
            "{} trailing bytes",
            cursor.remaining()
        )));
    }
    Ok(())
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Insert { sketch_id, element } => {
                buf.put_u8(REQ_INSERT);
                put_blob(&mut buf, sketch_id.as_bytes());
                put_blob(&mut buf, element);
            }
            Request::Merge { sketch_id, sketch } => {
                buf.put_u8(REQ_MERGE);
                put_blob(&mut buf, sketch_id.as_bytes());
                put_blob(&mut buf, sketch);
            }
            Request::Estimate { sketch_id } => {
                buf.put_u8(REQ_ESTIMATE);
                put_blob(&mut buf, sketch_id.as_bytes());
            }
            Request::DigestExchange {
                sketch_id,
                sender,
                digest,
            } => {
                buf.put_u8(REQ_DIGEST_EXCHANGE);
                put_blob(&mut buf, sketch_id.as_bytes());
                put_blob(&mut buf, sender.as_bytes());
                buf.put_u64(*digest);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, NodeError> {
        let mut cursor = data;
        if !cursor.has_remaining() {
            return Err(NodeError::Protocol("empty request".to_string()));
        }
        let tag = cursor.get_u8();
        let req = match tag {
            REQ_INSERT => {
                let sketch_id = get_string(&mut cursor, "sketch id")?;
                let element = get_blob(&mut cursor, MAX_FIELD_LEN, "element")?;
                Request::Insert { sketch_id, element }
            }
            REQ_MERGE => {
                let sketch_id = get_string(&mut cursor, "sketch id")?;
                let sketch = get_blob(&mut cursor, MAX_SKETCH_LEN, "sketch payload")?;
                Request::Merge { sketch_id, sketch }
            }
            REQ_ESTIMATE => {
                let sketch_id = get_string(&mut cursor, "sketch id")?;
                Request::Estimate { sketch_id }
            }
            REQ_DIGEST_EXCHANGE => {
                let sketch_id = get_string(&mut cursor, "sketch id")?;
                let sender = get_string(&mut cursor, "sender id")?;
                if cursor.remaining() < 8 {
                    return Err(NodeError::Protocol("truncated digest".to_string()));
                }
                let digest = cursor.get_u64();
                Request::DigestExchange {
                    sketch_id,
                    sender,
                    digest,
                }
            }
            other => {
                return Err(NodeError::Protocol(format!(
                    "unknown request tag {:#04x}",
                    other
                )));
            }
        };
        check_drained(cursor)?;
        Ok(req)
    }

    pub fn sketch_id(&self) -> &str {
        match self {
            Request::Insert { sketch_id, .. }
            | Request::Merge { sketch_id, .. }
            | Request::Estimate { sketch_id }
            | Request::DigestExchange { sketch_id, .. } => sketch_id,
        }
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Ack => buf.put_u8(RESP_ACK),
            Response::Estimate(e) => {
                buf.put_u8(RESP_ESTIMATE);
                buf.put_f64(*e);
            }
            Response::DigestMatch => buf.put_u8(RESP_DIGEST_MATCH),
            Response::DigestDiffer { sketch } => {
                buf.put_u8(RESP_DIGEST_DIFFER);
                put_blob(&mut buf, sketch);
            }
            Response::Error(code) => {
                buf.put_u8(RESP_ERROR);
                buf.put_u8(code.to_u8());
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, NodeError> {
        let mut cursor = data;
        if !cursor.has_remaining() {
            return Err(NodeError::Protocol("empty response".to_string()));
        }
        let tag = cursor.get_u8();
        let resp = match tag {
            RESP_ACK => Response::Ack,
            RESP_ESTIMATE => {
                if cursor.remaining() < 8 {
                    return Err(NodeError::Protocol("truncated estimate".to_string()));
                }
                Response::Estimate(cursor.get_f64())
            }
            RESP_DIGEST_MATCH => Response::DigestMatch,
            RESP_DIGEST_DIFFER => {
                let sketch = get_blob(&mut cursor, MAX_SKETCH_LEN, "sketch payload")?;
                Response::DigestDiffer { sketch }
            }
            RESP_ERROR => {
                if !cursor.has_remaining() {
                    return Err(NodeError::Protocol("truncated error code".to_string()));
                }
                let code = cursor.get_u8();
                let code = ErrorCode::from_u8(code).ok_or_else(|| {
                    NodeError::Protocol(format!("unknown error code {}", code))
                })?;
                Response::Error(code)
            }
            other => {
                return Err(NodeError::Protocol(format!(
                    "unknown response tag {:#04x}",
                    other
                )));
            }
        };
        check_drained(cursor)?;
        Ok(resp)
    }
}
