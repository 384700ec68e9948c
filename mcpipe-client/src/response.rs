//! # Binary Response Parser
//!
//! Purpose: Rebuild one response frame from whatever the receive buffer holds,
//! suspending when it runs dry and resuming after the next fill.
//!
//! ## Design Principles
//! 1. **Resumable State Machine**: `Header → Body → Done`; the header is
//!    collected into a fixed array, the body grows with each chunk that
//!    arrives, never past what the peer has actually sent.
//! 2. **Zero-Copy Views**: Extra, key and value are `Bytes` slices of the body.
//! 3. **Fail Loudly On Garbage**: Bad magic or inconsistent lengths surface as
//!    `InvalidData`, which the node handles like any socket failure.

use std::io;

use bytes::{Bytes, BytesMut};
use mcpipe_common::{OpCode, ResponseHeader, Status, GET_RESPONSE_EXTRA_LENGTH, HEADER_LENGTH};

use crate::buffer::ReceiveBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Body,
    Done,
}

/// One parsed (or partially parsed) response frame.
#[derive(Debug)]
pub struct BinaryResponse {
    state: ReadState,
    raw_header: [u8; HEADER_LENGTH],
    header_read: usize,
    header: Option<ResponseHeader>,
    body: BytesMut,
    body_length: usize,
    extra: Bytes,
    key: Bytes,
    value: Bytes,
}

impl Default for BinaryResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryResponse {
    pub fn new() -> Self {
        BinaryResponse {
            state: ReadState::Header,
            raw_header: [0; HEADER_LENGTH],
            header_read: 0,
            header: None,
            body: BytesMut::new(),
            body_length: 0,
            extra: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Consumes bytes from `buffer`.
    ///
    /// Returns `Ok(true)` when the frame is incomplete and the buffer is
    /// exhausted, `Ok(false)` once the frame is complete.
    pub fn read(&mut self, buffer: &mut ReceiveBuffer) -> io::Result<bool> {
        loop {
            match self.state {
                ReadState::Header => {
                    self.header_read += buffer.read_into(&mut self.raw_header[self.header_read..]);
                    if self.header_read < HEADER_LENGTH {
                        return Ok(true);
                    }

                    let header = ResponseHeader::decode(&self.raw_header)
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                    self.body_length = header.total_body as usize;
                    // The length is untrusted until the bytes show up.
                    self.body = BytesMut::with_capacity(self.body_length.min(buffer.capacity()));
                    self.header = Some(header);
                    self.state = ReadState::Body;
                }
                ReadState::Body => {
                    while self.body.len() < self.body_length {
                        if buffer.is_eof() {
                            return Ok(true);
                        }
                        let chunk = buffer.take(self.body_length - self.body.len());
                        self.body.extend_from_slice(chunk);
                    }
                    self.split_body();
                    self.state = ReadState::Done;
                }
                ReadState::Done => return Ok(false),
            }
        }
    }

    fn split_body(&mut self) {
        let (extra_length, key_length) = match &self.header {
            Some(header) => (header.extra_length as usize, header.key_length as usize),
            None => (0, 0),
        };

        let mut body = std::mem::take(&mut self.body).freeze();
        self.extra = body.split_to(extra_length);
        self.key = body.split_to(key_length);
        self.value = body;
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state == ReadState::Done
    }

    /// Raw opcode byte echoed by the server.
    pub fn opcode(&self) -> u8 {
        self.header.map_or(0, |h| h.opcode)
    }

    pub fn op_code(&self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode())
    }

    pub fn status(&self) -> Status {
        Status::from_u16(self.header.map_or(0, |h| h.status))
    }

    pub fn opaque(&self) -> u32 {
        self.header.map_or(0, |h| h.opaque)
    }

    pub fn cas(&self) -> u64 {
        self.header.map_or(0, |h| h.cas)
    }

    pub fn data_type(&self) -> u8 {
        self.header.map_or(0, |h| h.data_type)
    }

    pub fn extra(&self) -> &Bytes {
        &self.extra
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Item flags carried in the extra segment of get responses.
    pub fn flags(&self) -> u32 {
        match self.extra.get(..GET_RESPONSE_EXTRA_LENGTH) {
            Some(raw) => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            None => 0,
        }
    }

    /// Error text some servers put in the value of a failed response.
    pub fn message(&self) -> Option<String> {
        if self.status().is_success() || self.value.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.value).into_owned())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::frames::Frame;
    use super::*;
    use crate::allocator::HeapAllocator;
    use crate::buffer::WriteBuffer;
    use crate::request::{BinaryRequest, Extras};
    use crate::signal::WakeSignal;
    use crate::socket::memory::MemorySocket;
    use crate::socket::Socket;
    use mcpipe_common::{Key, RESPONSE_MAGIC};

    /// Parses `wire` delivered `chunk` bytes per fill.
    fn parse_chunked(wire: &[u8], chunk: usize, capacity: usize) -> Vec<BinaryResponse> {
        let socket = MemorySocket::new();
        socket.set_chunk(chunk);
        socket.push_inbound(wire);
        let mut handle: Box<dyn Socket> = Box::new(socket.clone());
        let wake = Arc::new(WakeSignal::new());
        let mut buffer = ReceiveBuffer::new(capacity);

        let mut parsed = Vec::new();
        let mut current = BinaryResponse::new();
        let mut consumed = 0;
        while consumed < wire.len() || !buffer.is_eof() {
            if buffer.is_eof() {
                buffer.fill_async(handle.as_mut(), &wake);
                buffer.complete_fill().unwrap().unwrap();
                consumed += buffer.unread().len();
            }
            if !current.read(&mut buffer).unwrap() {
                parsed.push(std::mem::take(&mut current));
            }
        }
        parsed
    }

    #[test]
    fn parses_get_hit() {
        let wire = Frame {
            opcode: OpCode::Get.as_u8(),
            opaque: 9,
            cas: 77,
            extra: &[0, 0, 0, 5],
            value: b"hello",
            ..Frame::default()
        }
        .encode();

        let parsed = parse_chunked(&wire, 1024, 1024);
        assert_eq!(parsed.len(), 1);
        let response = &parsed[0];
        assert!(response.is_complete());
        assert_eq!(response.op_code(), Some(OpCode::Get));
        assert_eq!(response.status(), Status::NoError);
        assert_eq!(response.opaque(), 9);
        assert_eq!(response.cas(), 77);
        assert_eq!(response.flags(), 5);
        assert_eq!(response.value().as_ref(), b"hello");
        assert!(response.key().is_empty());
        assert_eq!(response.message(), None);
    }

    #[test]
    fn parses_error_message() {
        let wire = Frame {
            opcode: OpCode::Get.as_u8(),
            status: Status::KeyNotFound.as_u16(),
            value: b"Not found",
            ..Frame::default()
        }
        .encode();
        let parsed = parse_chunked(&wire, 3, 16);
        assert_eq!(parsed[0].status(), Status::KeyNotFound);
        assert_eq!(parsed[0].message().as_deref(), Some("Not found"));
    }

    #[test]
    fn value_larger_than_buffer() {
        let value: Vec<u8> = (0..98_308u32).map(|i| (i % 251) as u8).collect();
        let wire = Frame {
            opcode: OpCode::Get.as_u8(),
            extra: &[0, 0, 0, 0],
            value: &value,
            ..Frame::default()
        }
        .encode();

        let parsed = parse_chunked(&wire, usize::MAX, 32_768);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].value().as_ref(), &value[..]);
    }

    #[test]
    fn back_to_back_frames_in_one_fill() {
        let mut wire = Frame { opcode: 0, opaque: 1, value: b"A", ..Frame::default() }.encode();
        wire.extend(Frame { opcode: 0, opaque: 2, value: b"B", ..Frame::default() }.encode());

        let parsed = parse_chunked(&wire, 4096, 4096);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].value().as_ref(), b"A");
        assert_eq!(parsed[1].value().as_ref(), b"B");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut wire = Frame::default().encode();
        wire[0] = 0x42;

        let socket = MemorySocket::new();
        socket.push_inbound(&wire);
        let mut handle: Box<dyn Socket> = Box::new(socket.clone());
        let mut buffer = ReceiveBuffer::new(64);
        buffer.fill(handle.as_mut()).unwrap();

        let err = BinaryResponse::new().read(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_ne!(wire[0], RESPONSE_MAGIC);
    }

    #[test]
    fn oversized_length_does_not_reserve_up_front() {
        let mut wire = Frame { opcode: OpCode::Get.as_u8(), value: b"abc", ..Frame::default() }.encode();
        wire[8..12].copy_from_slice(&u32::MAX.to_be_bytes());

        let socket = MemorySocket::new();
        socket.push_inbound(&wire);
        let mut handle: Box<dyn Socket> = Box::new(socket);
        let mut buffer = ReceiveBuffer::new(64);
        buffer.fill(handle.as_mut()).unwrap();

        let mut response = BinaryResponse::new();
        assert!(response.read(&mut buffer).unwrap());
        assert_eq!(response.body_length, u32::MAX as usize);
        assert_eq!(response.body.len(), 3);
        assert!(response.body.capacity() <= 64);
    }

    /// Turns an encoded request into the response frame a server would echo.
    fn echo(request_wire: &[u8]) -> Vec<u8> {
        let mut wire = request_wire.to_vec();
        wire[0] = RESPONSE_MAGIC;
        wire
    }

    proptest! {
        #[test]
        fn request_round_trips_through_parser(
            opcode in prop_oneof![Just(OpCode::Set), Just(OpCode::Add), Just(OpCode::Get), Just(OpCode::Increment), Just(OpCode::Touch)],
            key in proptest::collection::vec(any::<u8>(), 0..=250),
            value in proptest::collection::vec(any::<u8>(), 0..600),
            flags in any::<u32>(),
            expiry in any::<u32>(),
            cas in any::<u64>(),
            write_chunk in 1usize..64,
            read_chunk in 1usize..64,
        ) {
            let extras = match opcode {
                OpCode::Set | OpCode::Add => Extras::Store { flags, expiry },
                OpCode::Increment => Extras::Mutate { delta: flags as u64, initial: cas, expiry },
                OpCode::Touch => Extras::Expiry(expiry),
                _ => Extras::None,
            };
            let key = Key::new(key).unwrap();
            let mut request = BinaryRequest::new(opcode, Arc::new(HeapAllocator))
                .with_key(&key)
                .with_extras(extras)
                .with_value(Bytes::from(value.clone()))
                .with_cas(cas);

            let mut buffer = WriteBuffer::new(write_chunk);
            let mut wire = Vec::new();
            loop {
                let more = request.write_to(&mut buffer).unwrap();
                wire.extend_from_slice(buffer.as_slice());
                buffer.reset();
                if !more {
                    break;
                }
            }

            let parsed = parse_chunked(&echo(&wire), read_chunk, 64);
            prop_assert_eq!(parsed.len(), 1);
            let response = &parsed[0];
            prop_assert_eq!(response.op_code(), Some(opcode));
            prop_assert_eq!(response.opaque(), request.opaque());
            prop_assert_eq!(response.cas(), cas);
            prop_assert_eq!(response.extra().len(), extras.len());
            prop_assert_eq!(response.key().as_ref(), key.as_bytes());
            prop_assert_eq!(response.value().as_ref(), &value[..]);
        }
    }
}
