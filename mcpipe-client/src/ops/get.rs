use std::sync::Arc;

use mcpipe_common::{ClientResult, Expiration, Key, OpCode, Status};

use super::{quiet_handles, select_opcode};
use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult, Payload, RequestTag};
use crate::request::{BinaryRequest, Extras};
use crate::response::BinaryResponse;

/// Get or get-and-touch of a single item.
///
/// A hit resolves to `Payload::Item`; a miss to `Status::KeyNotFound`. In
/// quiet mode the server stays silent on a miss, which resolves the same way.
#[derive(Debug)]
pub struct GetOperation {
    key: Key,
    touch: Option<Expiration>,
    quiet: bool,
    tag: Option<RequestTag>,
    result: OperationResult,
}

impl GetOperation {
    pub fn new(key: Key) -> Self {
        GetOperation {
            key,
            touch: None,
            quiet: false,
            tag: None,
            result: OperationResult::default(),
        }
    }

    /// Fetches the item and resets its expiration in one round trip.
    pub fn get_and_touch(key: Key, expiration: Expiration) -> Self {
        GetOperation {
            touch: Some(expiration),
            ..Self::new(key)
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

impl Operation for GetOperation {
    fn key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let opcode = match self.touch {
            Some(_) => OpCode::GetAndTouch,
            None => OpCode::Get,
        };
        let mut request =
            BinaryRequest::new(select_opcode(opcode, self.quiet), allocator.clone()).with_key(&self.key);
        if let Some(expiration) = self.touch {
            request = request.with_extras(Extras::Expiry(expiration.to_wire()));
        }

        self.tag = Some(RequestTag::of(&request));
        Ok(request)
    }

    fn handles(&self, response: &BinaryResponse) -> bool {
        quiet_handles(self.quiet, self.tag, response)
    }

    fn process_response(&mut self, response: Option<&BinaryResponse>) -> bool {
        let Some(response) = response else {
            self.result = OperationResult::new(Status::KeyNotFound);
            return false;
        };

        self.result = OperationResult::from_response(response);
        if self.result.is_success() {
            self.result.payload = Payload::Item {
                flags: response.flags(),
                value: response.value().clone(),
            };
        }
        false
    }

    fn take_result(&mut self) -> OperationResult {
        std::mem::take(&mut self.result)
    }
}
