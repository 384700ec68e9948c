use std::sync::Arc;

use bytes::Bytes;
use mcpipe_common::{ClientResult, Expiration, Key, OpCode, NO_CAS};

use super::{quiet_handles, select_opcode};
use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult, RequestTag};
use crate::request::{BinaryRequest, Extras};
use crate::response::BinaryResponse;

/// Which store command to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
}

impl StoreMode {
    fn opcode(self) -> OpCode {
        match self {
            StoreMode::Set => OpCode::Set,
            StoreMode::Add => OpCode::Add,
            StoreMode::Replace => OpCode::Replace,
        }
    }
}

/// Set / Add / Replace with flags, expiration and an optional CAS check.
#[derive(Debug)]
pub struct StoreOperation {
    mode: StoreMode,
    key: Key,
    value: Bytes,
    flags: u32,
    expiration: Expiration,
    cas: u64,
    quiet: bool,
    tag: Option<RequestTag>,
    result: OperationResult,
}

impl StoreOperation {
    pub fn new(mode: StoreMode, key: Key, value: impl Into<Bytes>) -> Self {
        StoreOperation {
            mode,
            key,
            value: value.into(),
            flags: 0,
            expiration: Expiration::Never,
            cas: NO_CAS,
            quiet: false,
            tag: None,
            result: OperationResult::default(),
        }
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Only store if the item's CAS still equals `cas`.
    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

impl Operation for StoreOperation {
    fn key(&self) -> Option<&Key> {
        Some(&self.key)
    }

    fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let request = BinaryRequest::new(select_opcode(self.mode.opcode(), self.quiet), allocator.clone())
            .with_key(&self.key)
            .with_extras(Extras::Store {
                flags: self.flags,
                expiry: self.expiration.to_wire(),
            })
            .with_value(self.value.clone())
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
