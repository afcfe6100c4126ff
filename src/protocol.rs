// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// DDS-XRCE wire format codec.
//
// All decoding is safe: malformed or truncated input returns Err, never
// panics. Integers are little-endian. Every submessage header sits on a
// 4-byte boundary relative to the message start, and every payload is
// padded to 4 at its end.

use std::fmt;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Not enough bytes to decode a header / payload.
    BufferTooShort,
    /// Unknown submessage id.
    UnknownSubmessageId(u8),
    /// Unknown object kind byte.
    UnknownObjectKind(u8),
    /// Unknown status code byte.
    UnknownStatusCode(u8),
    /// Payload does not match the expected shape.
    PayloadMalformed,
    /// The endianness flag requests the big-endian dialect, which the
    /// agent does not speak.
    UnsupportedEndianness,
    /// WRITE_DATA carried a data format other than plain DATA.
    UnsupportedFormat(u8),
    /// Encoding would exceed the fixed message capacity.
    MessageTooLarge { size: usize, max: usize },
    /// Header of a keyed session class is missing its client key.
    MissingClientKey,
    /// A transport-level I/O error (message only, not the original error).
    Io(String),
    /// Configuration validation error.
    Config(String),
    /// Error forwarded from the DDS facade.
    Dds(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooShort => write!(f, "buffer too short"),
            Self::UnknownSubmessageId(id) => write!(f, "unknown submessage id: 0x{:02x}", id),
            Self::UnknownObjectKind(k) => write!(f, "unknown object kind: 0x{:02x}", k),
            Self::UnknownStatusCode(c) => write!(f, "unknown status code: 0x{:02x}", c),
            Self::PayloadMalformed => write!(f, "malformed payload"),
            Self::UnsupportedEndianness => write!(f, "big-endian dialect not supported"),
            Self::UnsupportedFormat(v) => write!(f, "unsupported data format: 0x{:02x}", v),
            Self::MessageTooLarge { size, max } => {
                write!(f, "message of {} bytes exceeds capacity {}", size, max)
            }
            Self::MissingClientKey => write!(f, "keyed header without client key"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Config(msg) => write!(f, "config error: {}", msg),
            Self::Dds(msg) => write!(f, "dds error: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Message header size without the optional client key.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Client key size appended to none-class headers.
pub const CLIENT_KEY_SIZE: usize = 4;

/// Submessage header size.
pub const SUBMESSAGE_HEADER_SIZE: usize = 4;

// Session id classes.
pub const SESSIONID_NONE_WITHOUT_KEY: u8 = 0x00;
pub const SESSIONID_NONE_WITH_KEY: u8 = 0x01;

// Submessage ids.
pub const SUBMSG_CREATE_CLIENT: u8 = 0x00;
pub const SUBMSG_CREATE: u8 = 0x01;
pub const SUBMSG_DELETE: u8 = 0x02;
pub const SUBMSG_GET_INFO: u8 = 0x04;
pub const SUBMSG_STATUS: u8 = 0x05;
pub const SUBMSG_WRITE_DATA: u8 = 0x07;
pub const SUBMSG_READ_DATA: u8 = 0x08;
pub const SUBMSG_DATA: u8 = 0x09;
pub const SUBMSG_HEARTBEAT: u8 = 0x0D;
pub const SUBMSG_ACKNACK: u8 = 0x0E;

// Submessage flags.
pub const FLAG_BIG_ENDIAN: u8 = 0x01;
pub const FLAG_REUSE: u8 = 0x02;
pub const FLAG_REPLACE: u8 = 0x04;
/// WRITE_DATA format lives in flag bits 1..3.
pub const FORMAT_MASK: u8 = 0x0E;
pub const FORMAT_DATA: u8 = 0x00;

/// Protocol magic carried by every CREATE_CLIENT ("XRCE").
pub const XRCE_COOKIE: [u8; 4] = [0x58, 0x52, 0x43, 0x45];

/// Protocol version the agent accepts (major must match).
pub const XRCE_VERSION_MAJOR: u8 = 0x01;
pub const XRCE_VERSION_MINOR: u8 = 0x00;

/// Object id standing for the client itself (DELETE of a whole session).
pub const OBJECTID_CLIENT: u16 = 0xFFFE;

// ---------------------------------------------------------------------------
// Object kind
// ---------------------------------------------------------------------------

/// Kind of a proxied DDS entity. The value doubles as the low nibble of
/// the entity's object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Participant = 0x01,
    Topic = 0x02,
    Publisher = 0x03,
    Subscriber = 0x04,
    DataWriter = 0x05,
    DataReader = 0x06,
}

impl ObjectKind {
    pub fn from_u8(v: u8) -> Result<Self, AgentError> {
        match v {
            0x01 => Ok(Self::Participant),
            0x02 => Ok(Self::Topic),
            0x03 => Ok(Self::Publisher),
            0x04 => Ok(Self::Subscriber),
            0x05 => Ok(Self::DataWriter),
            0x06 => Ok(Self::DataReader),
            other => Err(AgentError::UnknownObjectKind(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Extract the kind nibble of an object id.
pub fn kind_of(object_id: u16) -> Result<ObjectKind, AgentError> {
    ObjectKind::from_u8((object_id & 0x000F) as u8)
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Result codes carried by STATUS submessages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0x00,
    OkMatched = 0x01,
    ErrDdsError = 0x80,
    ErrMismatch = 0x81,
    ErrAlreadyExists = 0x82,
    ErrDenied = 0x83,
    ErrUnknownReference = 0x84,
    ErrInvalidData = 0x85,
    ErrIncompatible = 0x86,
    ErrResources = 0x87,
}

impl StatusCode {
    pub fn from_u8(v: u8) -> Result<Self, AgentError> {
        match v {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::OkMatched),
            0x80 => Ok(Self::ErrDdsError),
            0x81 => Ok(Self::ErrMismatch),
            0x82 => Ok(Self::ErrAlreadyExists),
            0x83 => Ok(Self::ErrDenied),
            0x84 => Ok(Self::ErrUnknownReference),
            0x85 => Ok(Self::ErrInvalidData),
            0x86 => Ok(Self::ErrIncompatible),
            0x87 => Ok(Self::ErrResources),
            other => Err(AgentError::UnknownStatusCode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for OK and OK_MATCHED.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkMatched)
    }
}

// ---------------------------------------------------------------------------
// Message header
// ---------------------------------------------------------------------------

/// Top-level XRCE message header. The client key rides on the wire only
/// for the two none-class session ids used during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub session_id: u8,
    pub stream_id: u8,
    pub sequence_nr: u16,
    pub client_key: Option<[u8; 4]>,
}

/// True when the session id is one of the two handshake (none) classes.
pub fn is_none_session(session_id: u8) -> bool {
    session_id == SESSIONID_NONE_WITHOUT_KEY || session_id == SESSIONID_NONE_WITH_KEY
}

impl MessageHeader {
    /// Decode a header, returning it together with the offset of the
    /// first submessage.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), AgentError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(AgentError::BufferTooShort);
        }
        let session_id = buf[0];
        let stream_id = buf[1];
        let sequence_nr = u16::from_le_bytes([buf[2], buf[3]]);
        let (client_key, consumed) = if is_none_session(session_id) {
            if buf.len() < MESSAGE_HEADER_SIZE + CLIENT_KEY_SIZE {
                return Err(AgentError::BufferTooShort);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[4..8]);
            (Some(key), MESSAGE_HEADER_SIZE + CLIENT_KEY_SIZE)
        } else {
            (None, MESSAGE_HEADER_SIZE)
        };
        Ok((
            Self {
                session_id,
                stream_id,
                sequence_nr,
                client_key,
            },
            consumed,
        ))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), AgentError> {
        buf.push(self.session_id);
        buf.push(self.stream_id);
        buf.extend_from_slice(&self.sequence_nr.to_le_bytes());
        if is_none_session(self.session_id) {
            let key = self.client_key.ok_or(AgentError::MissingClientKey)?;
            buf.extend_from_slice(&key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Submessage header
// ---------------------------------------------------------------------------

/// Submessage header: id, flags, payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmessageHeader {
    pub submessage_id: u8,
    pub flags: u8,
    pub length: u16,
}

impl SubmessageHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, AgentError> {
        if buf.len() < SUBMESSAGE_HEADER_SIZE {
            return Err(AgentError::BufferTooShort);
        }
        Ok(Self {
            submessage_id: buf[0],
            flags: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.submessage_id);
        buf.push(self.flags);
        buf.extend_from_slice(&self.length.to_le_bytes());
    }
}

/// Round an offset up to the next 4-byte boundary.
pub fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// CREATE_CLIENT: handshake from a new (or reconnecting) client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateClientPayload {
    pub request_id: u16,
    pub object_id: u16,
    pub cookie: [u8; 4],
    pub version: [u8; 2],
    pub vendor_id: [u8; 2],
    pub client_key: [u8; 4],
    pub session_id: u8,
}

/// Per-kind creation spec for a proxy object. Parents are referenced by
/// object id, never by pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectSpec {
    Participant { domain_id: u16 },
    Topic { participant_id: u16, name: String, type_name: String },
    Publisher { participant_id: u16 },
    Subscriber { participant_id: u16 },
    DataWriter { publisher_id: u16, topic_id: u16 },
    DataReader { subscriber_id: u16, topic_id: u16 },
}

impl ObjectSpec {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Participant { .. } => ObjectKind::Participant,
            Self::Topic { .. } => ObjectKind::Topic,
            Self::Publisher { .. } => ObjectKind::Publisher,
            Self::Subscriber { .. } => ObjectKind::Subscriber,
            Self::DataWriter { .. } => ObjectKind::DataWriter,
            Self::DataReader { .. } => ObjectKind::DataReader,
        }
    }
}

/// CREATE: instantiate a proxy object on the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePayload {
    pub request_id: u16,
    pub object_id: u16,
    pub spec: ObjectSpec,
}

/// Reuse/replace behaviour of CREATE, carried in the submessage flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreationMode {
    pub reuse: bool,
    pub replace: bool,
}

impl CreationMode {
    pub fn from_flags(flags: u8) -> Self {
        Self {
            reuse: flags & FLAG_REUSE != 0,
            replace: flags & FLAG_REPLACE != 0,
        }
    }

    pub fn to_flags(self) -> u8 {
        (if self.reuse { FLAG_REUSE } else { 0 }) | (if self.replace { FLAG_REPLACE } else { 0 })
    }
}

/// GET_INFO: introspection request (accepted, not served).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetInfoPayload {
    pub request_id: u16,
    pub object_id: u16,
}

/// DELETE: destroy one object, or the whole session via OBJECTID_CLIENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletePayload {
    pub request_id: u16,
    pub object_id: u16,
}

/// STATUS: result of a request, echoing its request/object pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub request_id: u16,
    pub object_id: u16,
    pub status: StatusCode,
}

/// WRITE_DATA (format DATA): publish one serialized sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteDataPayload {
    pub request_id: u16,
    pub object_id: u16,
    pub data: Vec<u8>,
}

/// READ_DATA: arm a DataReader to deliver samples on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDataPayload {
    pub request_id: u16,
    pub object_id: u16,
    pub max_samples: u16,
}

/// DATA: one sample travelling agent -> client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub request_id: u16,
    pub object_id: u16,
    pub data: Vec<u8>,
}

/// HEARTBEAT: advertises the sender's unacknowledged output range. The
/// referenced stream id rides in the message header's sequence_nr field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub first_unacked_seq: u16,
    pub last_unacked_seq: u16,
}

/// ACKNACK: cumulative ack plus a 16-entry NACK window. Bit i of
/// `bitmap[1]` flags seq `first_unacked + i` missing; bit i of `bitmap[0]`
/// flags `first_unacked + 8 + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknackPayload {
    pub first_unacked_seq: u16,
    pub nack_bitmap: u16,
}

impl AcknackPayload {
    /// Pack the bitmap into its two wire bytes.
    pub fn bitmap_bytes(&self) -> [u8; 2] {
        [(self.nack_bitmap >> 8) as u8, self.nack_bitmap as u8]
    }

    /// Rebuild the bitmap from its two wire bytes.
    pub fn bitmap_from_bytes(bytes: [u8; 2]) -> u16 {
        (u16::from(bytes[0]) << 8) | u16::from(bytes[1])
    }
}

// ---------------------------------------------------------------------------
// Unified submessage enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    CreateClient(CreateClientPayload),
    Create(CreationMode, CreatePayload),
    GetInfo(GetInfoPayload),
    Delete(DeletePayload),
    Status(StatusPayload),
    WriteData(WriteDataPayload),
    ReadData(ReadDataPayload),
    Data(DataPayload),
    Heartbeat(HeartbeatPayload),
    Acknack(AcknackPayload),
}

// ---------------------------------------------------------------------------
// Little-endian cursor helpers
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, AgentError> {
        let b = *self.buf.get(self.pos).ok_or(AgentError::BufferTooShort)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, AgentError> {
        if self.pos + 2 > self.buf.len() {
            return Err(AgentError::BufferTooShort);
        }
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, AgentError> {
        if self.pos + 4 > self.buf.len() {
            return Err(AgentError::BufferTooShort);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(raw))
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], AgentError> {
        if self.pos + N > self.buf.len() {
            return Err(AgentError::BufferTooShort);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Sequence of octets: 32-bit count followed by the elements.
    fn octets(&mut self) -> Result<Vec<u8>, AgentError> {
        let n = self.u32()? as usize;
        if self.pos + n > self.buf.len() {
            return Err(AgentError::BufferTooShort);
        }
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// String: 32-bit count covering the bytes and their NUL terminator.
    fn string(&mut self) -> Result<String, AgentError> {
        let raw = self.octets()?;
        match raw.split_last() {
            Some((0, body)) => {
                String::from_utf8(body.to_vec()).map_err(|_| AgentError::PayloadMalformed)
            }
            _ => Err(AgentError::PayloadMalformed),
        }
    }
}

fn put_octets(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&((s.len() + 1) as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

impl Submessage {
    /// Decode one submessage payload according to its header.
    pub fn decode(header: &SubmessageHeader, payload: &[u8]) -> Result<Self, AgentError> {
        if header.flags & FLAG_BIG_ENDIAN != 0 {
            return Err(AgentError::UnsupportedEndianness);
        }
        let mut c = Cursor::new(payload);
        match header.submessage_id {
            SUBMSG_CREATE_CLIENT => Ok(Self::CreateClient(CreateClientPayload {
                request_id: c.u16()?,
                object_id: c.u16()?,
                cookie: c.bytes()?,
                version: c.bytes()?,
                vendor_id: c.bytes()?,
                client_key: c.bytes()?,
                session_id: c.u8()?,
            })),
            SUBMSG_CREATE => {
                let request_id = c.u16()?;
                let object_id = c.u16()?;
                let kind = ObjectKind::from_u8(c.u8()?)?;
                let spec = match kind {
                    ObjectKind::Participant => ObjectSpec::Participant { domain_id: c.u16()? },
                    ObjectKind::Topic => ObjectSpec::Topic {
                        participant_id: c.u16()?,
                        name: c.string()?,
                        type_name: c.string()?,
                    },
                    ObjectKind::Publisher => ObjectSpec::Publisher { participant_id: c.u16()? },
                    ObjectKind::Subscriber => ObjectSpec::Subscriber { participant_id: c.u16()? },
                    ObjectKind::DataWriter => ObjectSpec::DataWriter {
                        publisher_id: c.u16()?,
                        topic_id: c.u16()?,
                    },
                    ObjectKind::DataReader => ObjectSpec::DataReader {
                        subscriber_id: c.u16()?,
                        topic_id: c.u16()?,
                    },
                };
                Ok(Self::Create(
                    CreationMode::from_flags(header.flags),
                    CreatePayload { request_id, object_id, spec },
                ))
            }
            SUBMSG_GET_INFO => Ok(Self::GetInfo(GetInfoPayload {
                request_id: c.u16()?,
                object_id: c.u16()?,
            })),
            SUBMSG_DELETE => Ok(Self::Delete(DeletePayload {
                request_id: c.u16()?,
                object_id: c.u16()?,
            })),
            SUBMSG_STATUS => Ok(Self::Status(StatusPayload {
                request_id: c.u16()?,
                object_id: c.u16()?,
                status: StatusCode::from_u8(c.u8()?)?,
            })),
            SUBMSG_WRITE_DATA => {
                let format = header.flags & FORMAT_MASK;
                if format != FORMAT_DATA {
                    return Err(AgentError::UnsupportedFormat(format));
                }
                Ok(Self::WriteData(WriteDataPayload {
                    request_id: c.u16()?,
                    object_id: c.u16()?,
                    data: c.octets()?,
                }))
            }
            SUBMSG_READ_DATA => Ok(Self::ReadData(ReadDataPayload {
                request_id: c.u16()?,
                object_id: c.u16()?,
                max_samples: c.u16()?,
            })),
            SUBMSG_DATA => Ok(Self::Data(DataPayload {
                request_id: c.u16()?,
                object_id: c.u16()?,
                data: c.octets()?,
            })),
            SUBMSG_HEARTBEAT => Ok(Self::Heartbeat(HeartbeatPayload {
                first_unacked_seq: c.u16()?,
                last_unacked_seq: c.u16()?,
            })),
            SUBMSG_ACKNACK => {
                let first_unacked_seq = c.u16()?;
                let bitmap = c.bytes::<2>()?;
                Ok(Self::Acknack(AcknackPayload {
                    first_unacked_seq,
                    nack_bitmap: AcknackPayload::bitmap_from_bytes(bitmap),
                }))
            }
            other => Err(AgentError::UnknownSubmessageId(other)),
        }
    }

    /// Serialize this submessage into (id, flags, payload bytes).
    fn encode_parts(&self) -> (u8, u8, Vec<u8>) {
        let mut pl = Vec::new();
        match self {
            Self::CreateClient(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                pl.extend_from_slice(&p.cookie);
                pl.extend_from_slice(&p.version);
                pl.extend_from_slice(&p.vendor_id);
                pl.extend_from_slice(&p.client_key);
                pl.push(p.session_id);
                (SUBMSG_CREATE_CLIENT, 0, pl)
            }
            Self::Create(mode, p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                pl.push(p.spec.kind().as_u8());
                match &p.spec {
                    ObjectSpec::Participant { domain_id } => {
                        pl.extend_from_slice(&domain_id.to_le_bytes());
                    }
                    ObjectSpec::Topic { participant_id, name, type_name } => {
                        pl.extend_from_slice(&participant_id.to_le_bytes());
                        put_string(&mut pl, name);
                        put_string(&mut pl, type_name);
                    }
                    ObjectSpec::Publisher { participant_id }
                    | ObjectSpec::Subscriber { participant_id } => {
                        pl.extend_from_slice(&participant_id.to_le_bytes());
                    }
                    ObjectSpec::DataWriter { publisher_id, topic_id } => {
                        pl.extend_from_slice(&publisher_id.to_le_bytes());
                        pl.extend_from_slice(&topic_id.to_le_bytes());
                    }
                    ObjectSpec::DataReader { subscriber_id, topic_id } => {
                        pl.extend_from_slice(&subscriber_id.to_le_bytes());
                        pl.extend_from_slice(&topic_id.to_le_bytes());
                    }
                }
                (SUBMSG_CREATE, mode.to_flags(), pl)
            }
            Self::GetInfo(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                (SUBMSG_GET_INFO, 0, pl)
            }
            Self::Delete(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                (SUBMSG_DELETE, 0, pl)
            }
            Self::Status(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                pl.push(p.status.as_u8());
                (SUBMSG_STATUS, 0, pl)
            }
            Self::WriteData(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                put_octets(&mut pl, &p.data);
                (SUBMSG_WRITE_DATA, FORMAT_DATA, pl)
            }
            Self::ReadData(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                pl.extend_from_slice(&p.max_samples.to_le_bytes());
                (SUBMSG_READ_DATA, 0, pl)
            }
            Self::Data(p) => {
                pl.extend_from_slice(&p.request_id.to_le_bytes());
                pl.extend_from_slice(&p.object_id.to_le_bytes());
                put_octets(&mut pl, &p.data);
                (SUBMSG_DATA, 0, pl)
            }
            Self::Heartbeat(p) => {
                pl.extend_from_slice(&p.first_unacked_seq.to_le_bytes());
                pl.extend_from_slice(&p.last_unacked_seq.to_le_bytes());
                (SUBMSG_HEARTBEAT, 0, pl)
            }
            Self::Acknack(p) => {
                pl.extend_from_slice(&p.first_unacked_seq.to_le_bytes());
                pl.extend_from_slice(&p.bitmap_bytes());
                (SUBMSG_ACKNACK, 0, pl)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Submessage region iteration
// ---------------------------------------------------------------------------

/// Walks the submessage region of a message (everything after the message
/// header), yielding raw (header, payload) frames. The region start is
/// 4-aligned relative to the message start, so alignment arithmetic is
/// relative to the region.
pub struct SubmessageReader<'a> {
    region: &'a [u8],
    offset: usize,
}

impl<'a> SubmessageReader<'a> {
    pub fn new(region: &'a [u8]) -> Self {
        Self { region, offset: 0 }
    }

    /// Next raw frame, or None at the end of the region. A truncated
    /// frame yields Err and ends iteration.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(SubmessageHeader, &'a [u8]), AgentError>> {
        let start = align4(self.offset);
        if start + SUBMESSAGE_HEADER_SIZE > self.region.len() {
            return None;
        }
        let header = match SubmessageHeader::decode(&self.region[start..]) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        let payload_start = start + SUBMESSAGE_HEADER_SIZE;
        let payload_end = payload_start + header.length as usize;
        if payload_end > self.region.len() {
            self.offset = self.region.len();
            return Some(Err(AgentError::BufferTooShort));
        }
        self.offset = payload_end;
        Some(Ok((header, &self.region[payload_start..payload_end])))
    }
}

// ---------------------------------------------------------------------------
// Full message encode / decode
// ---------------------------------------------------------------------------

/// A complete XRCE message: one header plus one or more submessages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrceMessage {
    pub header: MessageHeader,
    pub submessages: Vec<Submessage>,
}

/// Encode a full message into a fresh buffer, failing cleanly when the
/// result would exceed `max_size`.
pub fn encode_message(msg: &XrceMessage, max_size: usize) -> Result<Vec<u8>, AgentError> {
    let mut buf = Vec::with_capacity(64);
    msg.header.encode(&mut buf)?;
    for sub in &msg.submessages {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        let (id, flags, payload) = sub.encode_parts();
        let header = SubmessageHeader {
            submessage_id: id,
            flags,
            length: payload.len() as u16,
        };
        header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }
    if buf.len() > max_size {
        return Err(AgentError::MessageTooLarge { size: buf.len(), max: max_size });
    }
    Ok(buf)
}

/// Decode a full message. Strict: the first malformed submessage fails
/// the whole decode. The dispatcher uses [`SubmessageReader`] instead to
/// skip unknown ids.
pub fn decode_message(buf: &[u8]) -> Result<XrceMessage, AgentError> {
    let (header, body) = MessageHeader::decode(buf)?;
    let mut reader = SubmessageReader::new(&buf[body..]);
    let mut submessages = Vec::new();
    while let Some(frame) = reader.next() {
        let (sub_header, payload) = frame?;
        submessages.push(Submessage::decode(&sub_header, payload)?);
    }
    if submessages.is_empty() {
        return Err(AgentError::BufferTooShort);
    }
    Ok(XrceMessage { header, submessages })
}
