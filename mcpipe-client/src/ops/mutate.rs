use std::sync::Arc;

use mcpipe_common::{ClientResult, Expiration, Key, OpCode, NO_CAS};

use super::{quiet_handles, select_opcode};
use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult, Payload, RequestTag};
use crate::request::{BinaryRequest, Extras};
use crate::response::BinaryResponse;

const COUNTER_LENGTH: usize = 8;

/// Direction of a counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateMode {
    Increment,
    Decrement,
}

impl MutateMode {
    fn opcode(self) -> OpCode {
        match self {
            MutateMode::Increment => OpCode::Increment,
            MutateMode::Decrement => OpCode::Decrement,
        }
    }
}

/// Increment or decrement of a 64-bit counter.
///
/// A missing counter is created with `initial`. The new value comes back as
/// `Payload::Counter`.
#[derive(Debug)]
pub struct MutateOperation {
    mode: MutateMode,
    key: Key,
    delta: u64,
    initial: u64,
    expiration: Expiration,
    cas: u64,
    quiet: bool,
    tag: Option<RequestTag>,
    result: OperationResult,
}

impl MutateOperation {
    pub fn new(mode: MutateMode, key: Key, delta: u64) -> Self {
        MutateOperation {
            mode,
            key,
            delta,
            initial: 0,
            expiration: Expiration::Never,
            cas: NO_CAS,
            quiet: false,
            tag: None,
            result: OperationResult::default(),
        }
    }

    pub fn initial(mut self, initial: u64) -> Self {
        self.initial = initial;
        self
    }

    pub fn expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

impl Operation for MutateOperation {
    fn key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let request = BinaryRequest::new(select_opcode(self.mode.opcode(), self.quiet), allocator.clone())
            .with_key(&self.key)
            .with_extras(Extras::Mutate {
                delta: self.delta,
                initial: self.initial,
                expiry: self.expiration.to_wire(),
            })
            .with_cas(self.cas);

        self.tag = Some(RequestTag::of(&request));
        Ok(request)
    }

    fn handles(&self, response: &BinaryResponse) -> bool {
        quiet_handles(self.quiet, self.tag, response)
    }

    fn process_response(&mut self, response: Option<&BinaryResponse>) -> bool {
        let Some(response) = response else {
            self.result = OperationResult::success();
            return false;
        };

        self.result = OperationResult::from_response(response);
        if self.result.is_success() {
            if let Ok(raw) = <[u8; COUNTER_LENGTH]>::try_from(response.value().as_ref()) {
                self.result.payload = Payload::Counter(u64::from_be_bytes(raw));
            }
        }
        false
    }

    fn take_result(&mut self) -> OperationResult {
        std::mem::take(&mut self.result)
    }
}

#[cfg(test)]
mod tests {
    use mcpipe_common::Status;

    use super::*;
    use crate::ops::testing::encode;
    use crate::response::frames::{parse, Frame};

    #[test]
    fn increment_extras_layout() {
        let mut op = MutateOperation::new(MutateMode::Increment, Key::new("hits").unwrap(), 5).initial(100);
        let wire = encode(&mut op);

        assert_eq!(wire.header.opcode, OpCode::Increment.as_u8());
        assert_eq!(wire.extra.len(), 20);
        assert_eq!(&wire.extra[..8], &5u64.to_be_bytes());
        assert_eq!(&wire.extra[8..16], &100u64.to_be_bytes());
        assert_eq!(&wire.extra[16..], &0u32.to_be_bytes());
        assert!(wire.value.is_empty());
    }

    #[test]
    fn counter_value_is_decoded() {
        let mut op = MutateOperation::new(MutateMode::Decrement, Key::new("n").unwrap(), 1);
        let wire = encode(&mut op);
        assert_eq!(wire.header.opcode, OpCode::Decrement.as_u8());

        let response = parse(
            &Frame {
                opcode: OpCode::Decrement.as_u8(),
                cas: 8,
                value: &41u64.to_be_bytes(),
                ..Frame::default()
            }
            .encode(),
        );
        op.process_response(Some(&response));
        let result = op.take_result();
        assert_eq!(result.payload, Payload::Counter(41));
        assert_eq!(result.cas, 8);
    }

    #[test]
    fn non_numeric_value_is_reported() {
        let mut op = MutateOperation::new(MutateMode::Increment, Key::new("s").unwrap(), 1);
        encode(&mut op);
        let response = parse(
            &Frame {
                opcode: OpCode::Increment.as_u8(),
                status: Status::IncrDecrNonNumericValue.as_u16(),
                value: b"Non-numeric server-side value for incr or decr",
                ..Frame::default()
            }
            .encode(),
        );
        op.process_response(Some(&response));
        let result = op.take_result();
        assert_eq!(result.status, Status::IncrDecrNonNumericValue);
        assert_eq!(result.payload, Payload::None);
    }

    #[test]
    fn quiet_increment_opcode() {
        let mut op = MutateOperation::new(MutateMode::Increment, Key::new("q").unwrap(), 1).quiet();
        assert_eq!(encode(&mut op).header.opcode, OpCode::IncrementQ.as_u8());
    }
}
