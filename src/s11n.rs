//! s11n == serialization. The byte-level shapes that make up FastCGI
//! messages: the fixed record header, the begin/end-request bodies, and the
//! length-prefixed name-value pair encoding used by `Params` and
//! `GetValues` content.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const FASTCGI_VERSION: u8 = 1;

/// Every record starts with this many bytes.
pub const HEADER_LEN: usize = 8;

/// Record content is limited to what a 16-bit length field can carry.
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

// Variable names for GetValues / GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    /// Any type byte outside 1..=11. The original code is preserved so the
    /// dispatcher can echo it back in an `UnknownType` reply.
    Other(u8),
}

impl RecordType {
    pub fn from_u8(code: u8) -> RecordType {
        match code {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(code) => code,
        }
    }

    /// Management records address the connection itself (request id 0).
    pub fn is_management(self) -> bool {
        matches!(
            self,
            RecordType::GetValues | RecordType::GetValuesResult | RecordType::UnknownType
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    pub fn from_u16(code: u16) -> Option<Role> {
        match code {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMultiplexConnections,
    Overloaded,
    UnknownRole,
}

impl ProtocolStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolStatus::RequestComplete => 0,
            ProtocolStatus::CantMultiplexConnections => 1,
            ProtocolStatus::Overloaded => 2,
            ProtocolStatus::UnknownRole => 3,
        }
    }
}

/// The fixed 8-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    /// Packs a header the responder emits: version 1, zero padding, zero
    /// reserved byte.
    pub fn encode(record_type: RecordType, request_id: u16, content_length: u16) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = FASTCGI_VERSION;
        buf[1] = record_type.to_u8();
        NetworkEndian::write_u16(&mut buf[2..4], request_id);
        NetworkEndian::write_u16(&mut buf[4..6], content_length);
        // buf[6] = padding, buf[7] = reserved, both zero.
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<RecordHeader> {
        if buf[0] != FASTCGI_VERSION {
            return Err(Error::UnknownVersion(buf[0]));
        }
        Ok(RecordHeader {
            record_type: RecordType::from_u8(buf[1]),
            request_id: NetworkEndian::read_u16(&buf[2..4]),
            content_length: NetworkEndian::read_u16(&buf[4..6]),
            padding_length: buf[6],
        })
    }
}

/// Decoded `BeginRequest` content.
#[derive(Debug, Clone, Copy)]
pub struct BeginRequestBody {
    pub role: Option<Role>,
    pub raw_role: u16,
    pub keep_connection: bool,
}

impl BeginRequestBody {
    /// The body is 8 bytes: role (u16), flags (u8), 5 reserved. Shorter
    /// content yields `None` and the dispatcher drops the record as a
    /// protocol violation. Unknown role codes decode with `role == None`
    /// so the dispatcher can answer `EndRequest(UnknownRole)`.
    pub fn decode(content: &[u8]) -> Option<BeginRequestBody> {
        if content.len() < 3 {
            return None;
        }
        let raw_role = NetworkEndian::read_u16(&content[0..2]);
        Some(BeginRequestBody {
            role: Role::from_u16(raw_role),
            raw_role,
            keep_connection: (content[2] & 1) == 1,
        })
    }
}

/// `EndRequest` content the responder emits.
#[derive(Debug, Clone, Copy)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequestBody {
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        NetworkEndian::write_u32(&mut buf[0..4], self.app_status);
        buf[4] = self.protocol_status.to_u8();
        buf
    }
}

fn read_len(buf: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *buf.get(*pos)?;
    if first < 0x80 {
        *pos += 1;
        Some(first as usize)
    } else {
        let bytes = buf.get(*pos..*pos + 4)?;
        *pos += 4;
        Some((NetworkEndian::read_u32(bytes) & 0x7FFF_FFFF) as usize)
    }
}

/// Decodes as many well-formed name-value pairs as the buffer yields.
///
/// A truncated trailing entry is silently dropped: upstream servers split
/// `Params` content at arbitrary record boundaries, and the real terminator
/// is the zero-length `Params` record, so the caller concatenates record
/// payloads before decoding.
pub fn decode_nv_pairs(buf: &[u8]) -> Vec<(Bytes, Bytes)> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let start = pos;
        let (name_len, value_len) = match (read_len(buf, &mut pos), read_len(buf, &mut pos)) {
            (Some(n), Some(v)) => (n, v),
            _ => {
                debug!("dropping truncated name-value entry at offset {}", start);
                break;
            }
        };
        if pos + name_len + value_len > buf.len() {
            debug!("dropping truncated name-value entry at offset {}", start);
            break;
        }
        let name = Bytes::copy_from_slice(&buf[pos..pos + name_len]);
        pos += name_len;
        let value = Bytes::copy_from_slice(&buf[pos..pos + value_len]);
        pos += value_len;
        pairs.push((name, value));
    }
    pairs
}

fn put_len(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Encodes pairs symmetrically with [`decode_nv_pairs`]: the 1-byte length
/// form for lengths below 128, the 4-byte form with the top bit set
/// otherwise.
pub fn encode_nv_pairs<'a, I>(pairs: I) -> Bytes
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        put_len(&mut buf, name.len());
        put_len(&mut buf, value.len());
        buf.put_slice(name);
        buf.put_slice(value);
    }
    buf.freeze()
}
