use std::sync::Arc;

use mcpipe_common::{ClientResult, Key, OpCode, NO_CAS};

use super::{quiet_handles, select_opcode};
use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult, RequestTag};
use crate::request::BinaryRequest;
use crate::response::BinaryResponse;

/// Removes an item, optionally only if its CAS still matches.
#[derive(Debug)]
pub struct DeleteOperation {
    key: Key,
    cas: u64,
    quiet: bool,
    tag: Option<RequestTag>,
    result: OperationResult,
}

impl DeleteOperation {
    pub fn new(key: Key) -> Self {
        DeleteOperation {
            key,
            cas: NO_CAS,
            quiet: false,
            tag: None,
            result: OperationResult::default(),
        }
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

impl Operation for DeleteOperation {
    fn key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let request = BinaryRequest::new(select_opcode(OpCode::Delete, self.quiet), allocator.clone())
            .with_key(&self.key)
            .with_cas(self.cas);
        self.tag = Some(RequestTag::of(&request));
        Ok(request)
    }

    fn handles(&self, response: &BinaryResponse) -> bool {
        quiet_handles(self.quiet, self.tag, response)
    }

    fn process_response(&mut self, response: Option<&BinaryResponse>) -> bool {
        self.result = match response {
            Some(response) => OperationResult::from_response(response),
            None => OperationResult::success(),
        };
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
    fn delete_request_has_key_only() {
        let mut op = DeleteOperation::new(Key::new("gone").unwrap()).cas(9);
        let wire = encode(&mut op);
        assert_eq!(wire.header.opcode, OpCode::Delete.as_u8());
        assert_eq!(wire.header.cas, 9);
        assert!(wire.extra.is_empty());
        assert_eq!(wire.key, b"gone");
        assert!(wire.value.is_empty());
    }

    #[test]
    fn delete_missing_key() {
        let mut op = DeleteOperation::new(Key::new("gone").unwrap());
        encode(&mut op);
        let response = parse(
            &Frame {
                opcode: OpCode::Delete.as_u8(),
                status: Status::KeyNotFound.as_u16(),
                ..Frame::default()
            }
            .encode(),
        );
        op.process_response(Some(&response));
        assert_eq!(op.take_result().status, Status::KeyNotFound);
    }

    #[test]
    fn quiet_delete() {
        let mut op = DeleteOperation::new(Key::new("gone").unwrap()).quiet();
        assert_eq!(encode(&mut op).header.opcode, OpCode::DeleteQ.as_u8());
        op.process_response(None);
        assert!(op.take_result().is_success());
    }
}
