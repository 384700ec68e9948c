//! # Operations and Futures
//!
//! Purpose: The unit of work a node pipelines. An operation builds exactly one
//! request, consumes zero or more responses, and resolves its future once.
//!
//! ## Design Principles
//! 1. **FIFO Matching**: Responses are offered to the head of the in-flight
//!    queue. Non-quiet operations accept whatever arrives next.
//! 2. **Quiet Means Silence Is Success**: A quiet operation only claims frames
//!    echoing its own opcode and opaque; when another frame arrives it is
//!    completed without one.
//! 3. **Exactly-Once Completion**: `PendingOp::complete` and `PendingOp::fail`
//!    consume the entry, so a future cannot be resolved twice.
//! 4. **Status Is Data**: A non-success status is part of `OperationResult`,
//!    never a failed future.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use mcpipe_common::{ClientError, ClientResult, Key, OpCode, Status, NO_CAS};
use tokio::sync::oneshot;

use crate::allocator::BufferAllocator;
use crate::request::BinaryRequest;
use crate::response::BinaryResponse;

/// What a completed operation produced besides its status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    None,
    /// A stored item (get family).
    Item { flags: u32, value: Bytes },
    /// New counter value (increment / decrement).
    Counter(u64),
    /// Statistics name/value pairs.
    Stats(Vec<(String, String)>),
}

/// Outcome of an operation the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub status: Status,
    pub cas: u64,
    pub payload: Payload,
}

impl OperationResult {
    pub fn new(status: Status) -> Self {
        OperationResult {
            status,
            cas: NO_CAS,
            payload: Payload::None,
        }
    }

    /// Success with no payload; what a silent quiet operation resolves to.
    pub fn success() -> Self {
        Self::new(Status::NoError)
    }

    /// Status and CAS of `response`, no payload.
    pub fn from_response(response: &BinaryResponse) -> Self {
        OperationResult {
            status: response.status(),
            cas: response.cas(),
            payload: Payload::None,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Collapses a non-success status into `ClientError::Status`.
    pub fn into_success(self) -> ClientResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::Status(self.status))
        }
    }
}

impl Default for OperationResult {
    fn default() -> Self {
        Self::success()
    }
}

/// Remembers which request an operation sent, for quiet-frame matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTag {
    pub opcode: OpCode,
    pub opaque: u32,
}

impl RequestTag {
    pub fn of(request: &BinaryRequest) -> Self {
        RequestTag {
            opcode: request.opcode(),
            opaque: request.opaque(),
        }
    }

    /// True when `response` is this request's own frame.
    pub fn matches(&self, response: &BinaryResponse) -> bool {
        response.opcode() == self.opcode.as_u8() && response.opaque() == self.opaque
    }
}

/// A unit of pipelined work.
pub trait Operation: Send + fmt::Debug {
    /// Routing key; `None` for commands sent to every node.
    fn key(&self) -> Option<&Key> {
        None
    }

    /// True for quiet requests that get no frame on success.
    fn is_quiet(&self) -> bool {
        false
    }

    /// Builds the request. Called once, on the driver thread.
    fn create_request(&mut self, allocator: &Arc<dyn BufferAllocator>) -> ClientResult<BinaryRequest>;

    /// Whether `response` belongs to this operation.
    fn handles(&self, _response: &BinaryResponse) -> bool {
        true
    }

    /// Feeds a matched response, or `None` when a quiet operation was passed
    /// over. Returns true if the operation expects another response.
    fn process_response(&mut self, response: Option<&BinaryResponse>) -> bool;

    /// Moves the result out. Called once, after the last response.
    fn take_result(&mut self) -> OperationResult;
}

type Reply = oneshot::Sender<ClientResult<OperationResult>>;

/// An operation travelling through a node, paired with its caller's future.
pub(crate) struct PendingOp {
    pub(crate) op: Box<dyn Operation>,
    reply: Reply,
}

impl PendingOp {
    pub(crate) fn new(op: Box<dyn Operation>) -> (PendingOp, OperationFuture) {
        let (reply, receiver) = oneshot::channel();
        (PendingOp { op, reply }, OperationFuture { receiver })
    }

    /// Resolves the future with the operation's result.
    pub(crate) fn complete(mut self) {
        let result = self.op.take_result();
        let _ = self.reply.send(Ok(result));
    }

    /// Resolves the future with `error`.
    pub(crate) fn fail(self, error: ClientError) {
        let _ = self.reply.send(Err(error));
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PendingOp").field(&self.op).finish()
    }
}

/// Resolves once the node completes or fails the operation.
///
/// Await it from async code, or call [`OperationFuture::wait`] from a plain
/// thread. A future whose operation was dropped (cluster shutdown) resolves
/// to `ClientError::Abandoned`.
#[derive(Debug)]
pub struct OperationFuture {
    receiver: oneshot::Receiver<ClientResult<OperationResult>>,
}

impl OperationFuture {
    /// A future that is already failed.
    pub fn failed(error: ClientError) -> Self {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(Err(error));
        OperationFuture { receiver }
    }

    /// Blocks the current thread until the operation resolves.
    ///
    /// # Panics
    /// Panics when called from within an async runtime; `.await` there instead.
    pub fn wait(self) -> ClientResult<OperationResult> {
        self.receiver.blocking_recv().unwrap_or(Err(ClientError::Abandoned))
    }

    /// Returns the outcome if the operation already resolved.
    pub fn try_result(&mut self) -> Option<ClientResult<OperationResult>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ClientError::Abandoned)),
        }
    }
}

impl Future for OperationFuture {
    type Output = ClientResult<OperationResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ClientError::Abandoned)))
    }
}
