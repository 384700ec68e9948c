//! # Binary Request Writer
//!
//! Purpose: Serialize one operation into the shared `WriteBuffer`, resuming
//! wherever the previous pass stopped when the buffer filled up.
//!
//! ## Design Principles
//! 1. **Resumable State Machine**: `Init → Header → Key → Body → Done`; each
//!    `write_to` call advances as far as the buffer allows.
//! 2. **Lazy Header**: Header and extras are encoded on first entry into one
//!    pooled scratch buffer, which goes back to the allocator once written.
//! 3. **Zero-Copy Payloads**: Key and value are `Bytes` and are copied only
//!    into the write buffer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes};
use mcpipe_common::{ClientError, ClientResult, Key, OpCode, RequestHeader, HEADER_LENGTH, MAX_KEY_LENGTH, NO_CAS};

use crate::allocator::BufferAllocator;
use crate::buffer::WriteBuffer;

static NEXT_CORRELATION_ID: AtomicU32 = AtomicU32::new(1);

/// Returns a process-wide, monotonically increasing correlation id.
pub fn next_correlation_id() -> u32 {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Extra segment layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Extras {
    #[default]
    None,
    /// Set / Add / Replace: flags, expiry.
    Store { flags: u32, expiry: u32 },
    /// Increment / Decrement: delta, initial value, expiry.
    Mutate { delta: u64, initial: u64, expiry: u32 },
    /// Touch / GetAndTouch / Flush: expiry (or flush delay).
    Expiry(u32),
}

impl Extras {
    pub fn len(&self) -> usize {
        match self {
            Extras::None => 0,
            Extras::Store { .. } => mcpipe_common::STORE_EXTRA_LENGTH as usize,
            Extras::Mutate { .. } => mcpipe_common::MUTATE_EXTRA_LENGTH as usize,
            Extras::Expiry(_) => mcpipe_common::EXPIRY_EXTRA_LENGTH as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn encode(&self, mut out: &mut [u8]) {
        match *self {
            Extras::None => {}
            Extras::Store { flags, expiry } => {
                out.put_u32(flags);
                out.put_u32(expiry);
            }
            Extras::Mutate { delta, initial, expiry } => {
                out.put_u64(delta);
                out.put_u64(initial);
                out.put_u32(expiry);
            }
            Extras::Expiry(expiry) => out.put_u32(expiry),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Init,
    Header,
    Key,
    Body,
    Done,
}

/// One serialized request.
pub struct BinaryRequest {
    opcode: OpCode,
    key: Option<Bytes>,
    extras: Extras,
    value: Bytes,
    cas: u64,
    opaque: u32,
    state: WriteState,
    offset: usize,
    header: Option<Vec<u8>>,
    allocator: Arc<dyn BufferAllocator>,
}

impl BinaryRequest {
    /// Starts a request; the correlation id is assigned here.
    pub fn new(opcode: OpCode, allocator: Arc<dyn BufferAllocator>) -> Self {
        BinaryRequest {
            opcode,
            key: None,
            extras: Extras::None,
            value: Bytes::new(),
            cas: NO_CAS,
            opaque: next_correlation_id(),
            state: WriteState::Init,
            offset: 0,
            header: None,
            allocator,
        }
    }

    pub fn with_key(mut self, key: &Key) -> Self {
        self.key = Some(key.to_bytes());
        self
    }

    /// Raw key bytes, for commands whose key is not a cache key (stats groups).
    pub fn with_raw_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_extras(mut self, extras: Extras) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = value;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline]
    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == WriteState::Done
    }

    /// Total number of bytes this request puts on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LENGTH + self.extras.len() + self.key_bytes().len() + self.value.len()
    }

    /// Writes as much of the request as fits into `buffer`.
    ///
    /// Returns `Ok(true)` when bytes remain (flush the buffer and call again)
    /// and `Ok(false)` once the request is fully written.
    ///
    /// # Errors
    /// Returns `ClientError::KeyTooLong` on the first call if the key exceeds
    /// the protocol maximum; nothing is written in that case.
    pub fn write_to(&mut self, buffer: &mut WriteBuffer) -> ClientResult<bool> {
        loop {
            match self.state {
                WriteState::Init => {
                    self.prepare_header()?;
                    self.state = WriteState::Header;
                    self.offset = 0;
                }
                WriteState::Header => {
                    let header = self.header.as_deref().unwrap_or_default();
                    if !write_segment(header, &mut self.offset, buffer) {
                        return Ok(true);
                    }
                    self.release_header();
                    self.state = WriteState::Key;
                }
                WriteState::Key => {
                    let key = self.key.as_deref().unwrap_or_default();
                    if !write_segment(key, &mut self.offset, buffer) {
                        return Ok(true);
                    }
                    self.state = WriteState::Body;
                }
                WriteState::Body => {
                    if !write_segment(&self.value, &mut self.offset, buffer) {
                        return Ok(true);
                    }
                    self.state = WriteState::Done;
                }
                WriteState::Done => return Ok(false),
            }
        }
    }

    fn key_bytes(&self) -> &[u8] {
        self.key.as_deref().unwrap_or_default()
    }

    fn prepare_header(&mut self) -> ClientResult<()> {
        let key_length = self.key_bytes().len();
        if key_length > MAX_KEY_LENGTH {
            self.state = WriteState::Done;
            return Err(ClientError::KeyTooLong { len: key_length });
        }

        let extra_length = self.extras.len();
        let total_body = extra_length + key_length + self.value.len();
        let total_body = u32::try_from(total_body).map_err(|_| {
            ClientError::Protocol(format!("request body of {total_body} bytes is too large"))
        })?;

        let mut header = self.allocator.take(HEADER_LENGTH + extra_length);
        RequestHeader {
            opcode: self.opcode.as_u8(),
            key_length: key_length as u16,
            extra_length: extra_length as u8,
            total_body,
            opaque: self.opaque,
            cas: self.cas,
        }
        .encode(&mut header);
        self.extras.encode(&mut header[HEADER_LENGTH..]);

        self.header = Some(header);
        Ok(())
    }

    fn release_header(&mut self) {
        if let Some(header) = self.header.take() {
            self.allocator.give_back(header);
        }
    }
}

/// Copies the rest of `source` starting at `offset`. Returns true once the
/// whole segment is written, resetting `offset` for the next one.
fn write_segment(source: &[u8], offset: &mut usize, buffer: &mut WriteBuffer) -> bool {
    *offset += buffer.append(&source[*offset..]);
    if *offset < source.len() {
        return false;
    }
    *offset = 0;
    true
}

impl Drop for BinaryRequest {
    fn drop(&mut self) {
        self.release_header();
    }
}

impl std::fmt::Debug for BinaryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryRequest")
            .field("opcode", &self.opcode)
            .field("opaque", &self.opaque)
            .field("state", &self.state)
            .field("offset", &self.offset)
            .finish()
    }
}
