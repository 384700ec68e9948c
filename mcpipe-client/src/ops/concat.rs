use std::sync::Arc;

use bytes::Bytes;
use mcpipe_common::{ClientResult, Key, OpCode, NO_CAS};

use super::{quiet_handles, select_opcode};
use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult, RequestTag};
use crate::request::BinaryRequest;
use crate::response::BinaryResponse;

/// Which end of the stored value to extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatMode {
    Append,
    Prepend,
}

impl ConcatMode {
    fn opcode(self) -> OpCode {
        match self {
            ConcatMode::Append => OpCode::Append,
            ConcatMode::Prepend => OpCode::Prepend,
        }
    }
}

/// Append or prepend bytes to an existing item. Fails with
/// `Status::ItemNotStored` when the item does not exist.
#[derive(Debug)]
pub struct ConcatOperation {
    mode: ConcatMode,
    key: Key,
    data: Bytes,
    cas: u64,
    quiet: bool,
    tag: Option<RequestTag>,
    result: OperationResult,
}

impl ConcatOperation {
    pub fn new(mode: ConcatMode, key: Key, data: impl Into<Bytes>) -> Self {
        ConcatOperation {
            mode,
            key,
            data: data.into(),
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

impl Operation for ConcatOperation {
    fn key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let request = BinaryRequest::new(select_opcode(self.mode.opcode(), self.quiet), allocator.clone())
            .with_key(&self.key)
            .with_value(self.data.clone())
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
