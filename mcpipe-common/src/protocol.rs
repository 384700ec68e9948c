//! # Binary Protocol Layout
//!
//! Purpose: Define the memcached binary protocol header, opcodes, and status
//! codes shared by the request writer and the response parser.
//!
//! ## Design Principles
//!
//! 1. **Fixed Header**: Every frame starts with the same 24-byte header, so the
//!    parser can size the body before touching it.
//! 2. **Big-Endian Everywhere**: Multi-byte fields are unsigned big-endian with
//!    no alignment padding.
//! 3. **Quiet Variants Are Explicit**: The quiet opcode is looked up, not
//!    derived by masking, because the protocol does not use a single bit.
//!
//! ## Usage Notes
//!
//! - Requests use `REQUEST_MAGIC`, responses `RESPONSE_MAGIC`.
//! - The reserved field of a request is the status field of a response.
//! - `total_body` = extra + key + value lengths.
//!
//! ## Memory Layout Example
//!
//! ```text
//! Header (24 bytes total):
//! +--------+--------+-----------+-----------+-----------+-----------------+
//! | magic  | opcode | key len   | extra len | data type | reserved/status |
//! +--------+--------+-----------+-----------+-----------+-----------------+
//! | 1B     | 1B     | 2B        | 1B        | 1B        | 2B              |
//! +--------+--------+-----------+-----------+-----------+-----------------+
//! | total body length:4B | opaque:4B | cas:8B                             |
//! +----------------------+-----------+------------------------------------+
//!
//! Store extras (8 bytes):
//! +---------+----------+
//! | flags:4B| expiry:4B|
//! +---------+----------+
//!
//! Mutate extras (20 bytes):
//! +---------+-----------+----------+
//! | delta:8B| initial:8B| expiry:4B|
//! +---------+-----------+----------+
//!
//! Touch / GetAndTouch / Flush extras (4 bytes):
//! +----------+
//! | expiry:4B|
//! +----------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut};

/// Magic byte of every request frame.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte of every response frame.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Fixed header length in bytes.
pub const HEADER_LENGTH: usize = 24;

/// Longest key the server accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// CAS value meaning "no compare-and-swap check".
pub const NO_CAS: u64 = 0;

/// Raw data type; the only one defined by the protocol.
pub const DATA_TYPE_RAW: u8 = 0;

pub const HEADER_INDEX_MAGIC: usize = 0;
pub const HEADER_INDEX_OPCODE: usize = 1;
pub const HEADER_INDEX_KEY: usize = 2;
pub const HEADER_INDEX_EXTRA: usize = 4;
pub const HEADER_INDEX_DATA_TYPE: usize = 5;
pub const HEADER_INDEX_STATUS: usize = 6;
pub const HEADER_INDEX_BODY: usize = 8;
pub const HEADER_INDEX_OPAQUE: usize = 12;
pub const HEADER_INDEX_CAS: usize = 16;

/// Extra length of store requests (flags + expiry).
pub const STORE_EXTRA_LENGTH: u8 = 8;

/// Extra length of mutate requests (delta + initial + expiry).
pub const MUTATE_EXTRA_LENGTH: u8 = 20;

/// Extra length of requests carrying only an expiry.
pub const EXPIRY_EXTRA_LENGTH: u8 = 4;

/// Extra length of get responses (flags).
pub const GET_RESPONSE_EXTRA_LENGTH: usize = 4;

/// Binary protocol command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    NoOp = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    GetAndTouchQ = 0x1e,
}

impl OpCode {
    /// Returns the wire value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        let op = match value {
            0x00 => OpCode::Get,
            0x01 => OpCode::Set,
            0x02 => OpCode::Add,
            0x03 => OpCode::Replace,
            0x04 => OpCode::Delete,
            0x05 => OpCode::Increment,
            0x06 => OpCode::Decrement,
            0x07 => OpCode::Quit,
            0x08 => OpCode::Flush,
            0x09 => OpCode::GetQ,
            0x0a => OpCode::NoOp,
            0x0b => OpCode::Version,
            0x0c => OpCode::GetK,
            0x0d => OpCode::GetKQ,
            0x0e => OpCode::Append,
            0x0f => OpCode::Prepend,
            0x10 => OpCode::Stat,
            0x11 => OpCode::SetQ,
            0x12 => OpCode::AddQ,
            0x13 => OpCode::ReplaceQ,
            0x14 => OpCode::DeleteQ,
            0x15 => OpCode::IncrementQ,
            0x16 => OpCode::DecrementQ,
            0x17 => OpCode::QuitQ,
            0x18 => OpCode::FlushQ,
            0x19 => OpCode::AppendQ,
            0x1a => OpCode::PrependQ,
            0x1c => OpCode::Touch,
            0x1d => OpCode::GetAndTouch,
            0x1e => OpCode::GetAndTouchQ,
            _ => return None,
        };
        Some(op)
    }

    /// Returns the quiet variant, if the command has one.
    pub const fn quiet(self) -> Option<Self> {
        let op = match self {
            OpCode::Get => OpCode::GetQ,
            OpCode::GetK => OpCode::GetKQ,
            OpCode::Set => OpCode::SetQ,
            OpCode::Add => OpCode::AddQ,
            OpCode::Replace => OpCode::ReplaceQ,
            OpCode::Delete => OpCode::DeleteQ,
            OpCode::Increment => OpCode::IncrementQ,
            OpCode::Decrement => OpCode::DecrementQ,
            OpCode::Quit => OpCode::QuitQ,
            OpCode::Flush => OpCode::FlushQ,
            OpCode::Append => OpCode::AppendQ,
            OpCode::Prepend => OpCode::PrependQ,
            OpCode::GetAndTouch => OpCode::GetAndTouchQ,
            _ => return None,
        };
        Some(op)
    }

    /// Returns true when the server stays silent on success.
    pub const fn is_quiet(self) -> bool {
        matches!(
            self,
            OpCode::GetQ
                | OpCode::GetKQ
                | OpCode::SetQ
                | OpCode::AddQ
                | OpCode::ReplaceQ
                | OpCode::DeleteQ
                | OpCode::IncrementQ
                | OpCode::DecrementQ
                | OpCode::QuitQ
                | OpCode::FlushQ
                | OpCode::AppendQ
                | OpCode::PrependQ
                | OpCode::GetAndTouchQ
        )
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    IncrDecrNonNumericValue,
    NotMyVBucket,
    AuthenticationError,
    AuthenticationContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    /// A code this client does not know.
    Other(u16),
}

impl Status {
    /// Parses a wire status code.
    pub const fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::IncrDecrNonNumericValue,
            0x0007 => Status::NotMyVBucket,
            0x0008 => Status::AuthenticationError,
            0x0009 => Status::AuthenticationContinue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            other => Status::Other(other),
        }
    }

    /// Returns the wire status code.
    pub const fn as_u16(self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::IncrDecrNonNumericValue => 0x0006,
            Status::NotMyVBucket => 0x0007,
            Status::AuthenticationError => 0x0008,
            Status::AuthenticationContinue => 0x0009,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::Other(code) => code,
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::NoError)
    }

    /// Human-readable description, used when the server sends no message body.
    pub const fn message(self) -> &'static str {
        match self {
            Status::NoError => "no error",
            Status::KeyNotFound => "key not found",
            Status::KeyExists => "key exists",
            Status::ValueTooLarge => "value too large",
            Status::InvalidArguments => "invalid arguments",
            Status::ItemNotStored => "item not stored",
            Status::IncrDecrNonNumericValue => "incr/decr on non-numeric value",
            Status::NotMyVBucket => "vbucket belongs to another server",
            Status::AuthenticationError => "authentication error",
            Status::AuthenticationContinue => "authentication continue",
            Status::UnknownCommand => "unknown command",
            Status::OutOfMemory => "out of memory",
            Status::NotSupported => "not supported",
            Status::InternalError => "internal error",
            Status::Busy => "busy",
            Status::TemporaryFailure => "temporary failure",
            Status::Other(_) => "unknown status",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.message(), self.as_u16())
    }
}

/// Request header fields, encoded once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extra_length: u8,
    pub total_body: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Writes the header into the first `HEADER_LENGTH` bytes of `out`.
    ///
    /// The CAS field is left untouched when zero; callers hand in a zeroed
    /// scratch buffer.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_LENGTH);
        let mut cursor = &mut out[..HEADER_INDEX_CAS];
        cursor.put_u8(REQUEST_MAGIC);
        cursor.put_u8(self.opcode);
        cursor.put_u16(self.key_length);
        cursor.put_u8(self.extra_length);
        cursor.put_u8(DATA_TYPE_RAW);
        cursor.put_u16(0);
        cursor.put_u32(self.total_body);
        cursor.put_u32(self.opaque);

        if self.cas != NO_CAS {
            (&mut out[HEADER_INDEX_CAS..HEADER_LENGTH]).put_u64(self.cas);
        }
    }
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub key_length: u16,
    pub extra_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub total_body: u32,
    pub opaque: u32,
    pub cas: u64,
}

/// The header did not start with `RESPONSE_MAGIC` or its lengths disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHeader {
    pub magic: u8,
}

impl fmt::Display for InvalidHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid response header (magic 0x{:02x})", self.magic)
    }
}

impl std::error::Error for InvalidHeader {}

impl ResponseHeader {
    /// Decodes a full 24-byte header.
    pub fn decode(raw: &[u8; HEADER_LENGTH]) -> Result<Self, InvalidHeader> {
        let mut cursor = &raw[..];
        let magic = cursor.get_u8();
        if magic != RESPONSE_MAGIC {
            return Err(InvalidHeader { magic });
        }

        let header = ResponseHeader {
            opcode: cursor.get_u8(),
            key_length: cursor.get_u16(),
            extra_length: cursor.get_u8(),
            data_type: cursor.get_u8(),
            status: cursor.get_u16(),
            total_body: cursor.get_u32(),
            opaque: cursor.get_u32(),
            cas: cursor.get_u64(),
        };

        let fixed = header.key_length as u64 + header.extra_length as u64;
        if fixed > header.total_body as u64 {
            return Err(InvalidHeader { magic });
        }
        Ok(header)
    }
}
