use std::sync::Arc;

use mcpipe_common::{ClientResult, Expiration, Key, OpCode};

use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult};
use crate::request::{BinaryRequest, Extras};
use crate::response::BinaryResponse;

/// Resets an item's expiration without fetching it.
#[derive(Debug)]
pub struct TouchOperation {
    key: Key,
    expiration: Expiration,
    result: OperationResult,
}

impl TouchOperation {
    pub fn new(key: Key, expiration: Expiration) -> Self {
        TouchOperation {
            key,
            expiration,
            result: OperationResult::default(),
        }
    }
}

impl Operation for TouchOperation {
    fn key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        Ok(BinaryRequest::new(OpCode::Touch, allocator.clone())
            .with_key(&self.key)
            .with_extras(Extras::Expiry(self.expiration.to_wire())))
    }

    fn process_response(&mut self, response: Option<&BinaryResponse>) -> bool {
        if let Some(response) = response {
            self.result = OperationResult::from_response(response);
        }
        false
    }

    fn take_result(&mut self) -> OperationResult {
        std::mem::take(&mut self.result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mcpipe_common::Status;

    use super::*;
    use crate::ops::testing::encode;
    use crate::response::frames::{parse, Frame};

    #[test]
    fn touch_request_layout() {
        let mut op = TouchOperation::new(Key::new("t").unwrap(), Expiration::After(Duration::from_secs(10)));
        let wire = encode(&mut op);
        assert_eq!(wire.header.opcode, OpCode::Touch.as_u8());
        assert_eq!(wire.extra, 10u32.to_be_bytes());
        assert_eq!(wire.key, b"t");
        assert!(!op.is_quiet());
    }

    #[test]
    fn touch_missing_key() {
        let mut op = TouchOperation::new(Key::new("t").unwrap(), Expiration::Never);
        encode(&mut op);
        let response = parse(
            &Frame {
                opcode: OpCode::Touch.as_u8(),
                status: Status::KeyNotFound.as_u16(),
                ..Frame::default()
            }
            .encode(),
        );
        assert!(op.handles(&response));
        op.process_response(Some(&response));
        assert_eq!(op.take_result().status, Status::KeyNotFound);
    }
}
