use std::sync::Arc;

use bytes::Bytes;
use mcpipe_common::{ClientResult, Expiration, OpCode};

use crate::allocator::BufferAllocator;
use crate::operation::{Operation, OperationResult, Payload};
use crate::request::{BinaryRequest, Extras};
use crate::response::BinaryResponse;

/// Server statistics. The server answers with one frame per statistic and
/// ends the stream with a frame whose key is empty.
#[derive(Debug, Default)]
pub struct StatsOperation {
    group: Option<String>,
    stats: Vec<(String, String)>,
    result: OperationResult,
}

impl StatsOperation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a named statistics group (for example `"items"`).
    pub fn with_group(group: impl Into<String>) -> Self {
        StatsOperation {
            group: Some(group.into()),
            ..Self::default()
        }
    }
}

impl Operation for StatsOperation {
    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let mut request = BinaryRequest::new(OpCode::Stat, allocator.clone());
        if let Some(group) = &self.group {
            request = request.with_raw_key(Bytes::copy_from_slice(group.as_bytes()));
        }
        Ok(request)
    }

    fn process_response(&mut self, response: Option<&BinaryResponse>) -> bool {
        let Some(response) = response else {
            return false;
        };

        if !response.status().is_success() {
            self.result = OperationResult::from_response(response);
            return false;
        }
        if response.key().is_empty() {
            return false;
        }

        self.stats.push((
            String::from_utf8_lossy(response.key()).into_owned(),
            String::from_utf8_lossy(response.value()).into_owned(),
        ));
        true
    }

    fn take_result(&mut self) -> OperationResult {
        let mut result = std::mem::take(&mut self.result);
        if result.is_success() {
            result.payload = Payload::Stats(std::mem::take(&mut self.stats));
        }
        result
    }
}

/// Invalidates every item on a server, optionally after a delay.
#[derive(Debug, Default)]
pub struct FlushOperation {
    delay: Option<Expiration>,
    result: OperationResult,
}

impl FlushOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Expiration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Operation for FlushOperation {
    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        let request = BinaryRequest::new(OpCode::Flush, allocator.clone());
        Ok(match self.delay {
            Some(delay) => request.with_extras(Extras::Expiry(delay.to_wire())),
            None => request,
        })
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

/// No-op. Terminates a batch of quiet operations: its response proves every
/// quiet request before it was processed.
#[derive(Debug, Default)]
pub struct NoOpOperation {
    result: OperationResult,
}

impl NoOpOperation {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operation for NoOpOperation {
    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest> {
        Ok(BinaryRequest::new(OpCode::NoOp, allocator.clone()))
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
