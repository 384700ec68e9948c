//! # Node
//!
//! Purpose: Own one server connection and pipeline operations over it. Callers
//! enqueue from any thread; the cluster driver alone calls `send` and
//! `receive`.
//!
//! ## Design Principles
//! 1. **Single Writer**: All socket, buffer and codec state lives in
//!    `NodeEngine`, touched by the driver (and by reconnects while the node is
//!    out of the working set). The mutex around it is uncontended.
//! 2. **Staged Queues**: pending (channel) → written (in the write buffer) →
//!    in flight (flushed to the socket). An operation enters `in_flight` only
//!    after its last byte has been handed to the socket.
//! 3. **Strict FIFO Matching**: Responses are matched against the head of
//!    `in_flight`; quiet operations are passed over when another frame arrives.
//! 4. **Fail Everything Once**: A fatal error fails every queued and in-flight
//!    operation with the same shared error and marks the node dead.
//!
//! ## Usage Notes
//!
//! - `send`/`receive` return `Ok(true)` when they did I/O and another pass may
//!   make progress. An `Err` means the node has already failed itself; the
//!   cluster only needs to take it out of rotation.
//! - A node starts alive but unconnected; the first pass connects it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mcpipe_common::{ClientError, ClientResult};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::allocator::BufferAllocator;
use crate::buffer::{ReceiveBuffer, WriteBuffer};
use crate::deque::GrowableDeque;
use crate::operation::{Operation, OperationFuture, PendingOp};
use crate::policy::FailurePolicy;
use crate::request::BinaryRequest;
use crate::response::BinaryResponse;
use crate::signal::{ShutdownToken, WakeSignal};
use crate::socket::{Socket, SocketFactory};

/// Everything a node needs besides its endpoint.
pub struct NodeOptions {
    /// Capacity of both the write and the receive buffer.
    pub buffer_size: usize,
    pub socket_factory: Arc<dyn SocketFactory>,
    pub failure_policy: Box<dyn FailurePolicy>,
    pub allocator: Arc<dyn BufferAllocator>,
    /// Set whenever the node has new work or a fill completed.
    pub wake: Arc<WakeSignal>,
}

/// One server connection.
pub struct Node {
    endpoint: SocketAddr,
    alive: AtomicBool,
    pending_tx: Sender<PendingOp>,
    pending_rx: Receiver<PendingOp>,
    wake: Arc<WakeSignal>,
    engine: Mutex<NodeEngine>,
}

struct NodeEngine {
    endpoint: SocketAddr,
    socket: Box<dyn Socket>,
    socket_factory: Arc<dyn SocketFactory>,
    write_buffer: WriteBuffer,
    receive_buffer: ReceiveBuffer,
    current: Option<(PendingOp, BinaryRequest)>,
    written: GrowableDeque<PendingOp>,
    in_flight: GrowableDeque<PendingOp>,
    response: Option<BinaryResponse>,
    must_reconnect: bool,
    failure_policy: Box<dyn FailurePolicy>,
    allocator: Arc<dyn BufferAllocator>,
}

impl Node {
    pub fn new(endpoint: SocketAddr, options: NodeOptions) -> Self {
        let (pending_tx, pending_rx) = unbounded();
        let socket = options.socket_factory.create();

        Node {
            endpoint,
            alive: AtomicBool::new(true),
            pending_tx,
            pending_rx,
            wake: options.wake,
            engine: Mutex::new(NodeEngine {
                endpoint,
                socket,
                socket_factory: options.socket_factory,
                write_buffer: WriteBuffer::new(options.buffer_size),
                receive_buffer: ReceiveBuffer::new(options.buffer_size),
                current: None,
                written: GrowableDeque::new(),
                in_flight: GrowableDeque::new(),
                response: None,
                must_reconnect: true,
                failure_policy: options.failure_policy,
                allocator: options.allocator,
            }),
        }
    }

    #[inline]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Operations waiting to be written.
    pub fn queued(&self) -> usize {
        self.pending_rx.len()
    }

    /// Queues `op` for the driver and returns its future.
    ///
    /// Fails the future at once with `ClientError::NotAlive` if the node is down.
    pub fn enqueue(&self, op: Box<dyn Operation>) -> OperationFuture {
        if !self.is_alive() {
            return OperationFuture::failed(ClientError::NotAlive {
                endpoint: self.endpoint,
            });
        }

        let (pending, future) = PendingOp::new(op);
        if let Err(rejected) = self.pending_tx.send(pending) {
            rejected.0.fail(ClientError::NotAlive {
                endpoint: self.endpoint,
            });
            return future;
        }
        if !self.alive.load(Ordering::SeqCst) {
            // Failed after the check above; its drain may have missed this op.
            let _engine = self.engine.lock();
            if !self.is_alive() {
                fail_queued(
                    &self.pending_rx,
                    &ClientError::NotAlive {
                        endpoint: self.endpoint,
                    },
                );
            }
        }
        self.wake.set();
        future
    }

    /// Writes queued requests and flushes them to the socket.
    pub fn send(&self) -> ClientResult<bool> {
        self.run(|engine, node| engine.send(&node.pending_rx))
    }

    /// Parses available responses and completes their operations.
    pub fn receive(&self) -> ClientResult<bool> {
        self.run(|engine, node| engine.receive(&node.wake))
    }

    /// (Re)opens the connection and marks the node alive.
    ///
    /// With `reset`, operations still queued from before are failed instead of
    /// being sent on the new connection.
    pub fn connect(&self, reset: bool, token: &ShutdownToken) -> ClientResult<()> {
        if token.is_cancelled() {
            return Err(ClientError::Abandoned);
        }

        let mut engine = self.engine.lock();
        engine
            .reconnect()
            .map_err(|err| ClientError::io(self.endpoint, err))?;

        if reset {
            let error = ClientError::io(
                self.endpoint,
                io::Error::new(io::ErrorKind::ConnectionReset, "node was reset"),
            );
            engine.fail_in_flight(&error);
            fail_queued(&self.pending_rx, &error);
        }

        engine.failure_policy.reset();
        engine.must_reconnect = false;
        self.alive.store(true, Ordering::Release);
        debug!(endpoint = %self.endpoint, "node connected");
        Ok(())
    }

    /// Closes the socket and drops all outstanding work; the futures of
    /// dropped operations resolve to `ClientError::Abandoned`.
    pub fn shutdown(&self) {
        let mut engine = self.engine.lock();
        self.alive.store(false, Ordering::Release);
        engine.socket.shutdown();
        engine.abandon_all();
        while self.pending_rx.try_recv().is_ok() {}
        debug!(endpoint = %self.endpoint, "node shut down");
    }

    fn run<F>(&self, action: F) -> ClientResult<bool>
    where
        F: FnOnce(&mut NodeEngine, &Node) -> io::Result<bool>,
    {
        let mut engine = self.engine.lock();
        if !self.is_alive() {
            return Ok(false);
        }

        if engine.must_reconnect {
            if let Err(err) = engine.reconnect() {
                return self.handle_error(&mut engine, err);
            }
            engine.must_reconnect = false;
            debug!(endpoint = %self.endpoint, "node connected");
        }

        match action(&mut engine, self) {
            Ok(progress) => Ok(progress),
            Err(err) => self.handle_error(&mut engine, err),
        }
    }

    fn handle_error(&self, engine: &mut NodeEngine, err: io::Error) -> ClientResult<bool> {
        let fatal = engine.failure_policy.should_fail(&err);
        let error = ClientError::io(self.endpoint, err);

        // Whatever was sent on this connection can no longer be answered.
        engine.fail_in_flight(&error);
        engine.reset_buffers();

        if fatal {
            warn!(endpoint = %self.endpoint, error = %error, "node failed");
            self.alive.store(false, Ordering::SeqCst);
            engine.socket.shutdown();
            fail_queued(&self.pending_rx, &error);
            return Err(error);
        }

        debug!(endpoint = %self.endpoint, error = %error, "transient failure, reconnecting in place");
        engine.must_reconnect = true;
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.engine.lock().in_flight.len()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("endpoint", &self.endpoint)
            .field("alive", &self.is_alive())
            .field("queued", &self.queued())
            .finish()
    }
}

fn fail_queued(pending: &Receiver<PendingOp>, error: &ClientError) {
    for op in pending.try_iter() {
        op.fail(error.clone());
    }
}

impl NodeEngine {
    fn send(&mut self, pending: &Receiver<PendingOp>) -> io::Result<bool> {
        loop {
            if self.current.is_none() {
                let Ok(mut next) = pending.try_recv() else {
                    break;
                };
                match next.op.create_request(&self.allocator) {
                    Ok(request) => self.current = Some((next, request)),
                    Err(err) => {
                        next.fail(err);
                        continue;
                    }
                }
            }

            let Some((_, request)) = self.current.as_mut() else {
                break;
            };
            match request.write_to(&mut self.write_buffer) {
                Ok(true) => break,
                Ok(false) => {
                    if let Some((op, _)) = self.current.take() {
                        self.written.push_back(op);
                    }
                }
                Err(err) => {
                    if let Some((op, _)) = self.current.take() {
                        op.fail(err);
                    }
                }
            }
        }

        if self.write_buffer.position() == 0 {
            return Ok(false);
        }

        trace!(
            endpoint = %self.endpoint,
            bytes = self.write_buffer.position(),
            ops = self.written.len(),
            "flushing write buffer"
        );
        self.socket.send(self.write_buffer.as_slice())?;
        self.write_buffer.reset();
        self.in_flight.append_all(&mut self.written);
        Ok(true)
    }

    fn receive(&mut self, wake: &Arc<WakeSignal>) -> io::Result<bool> {
        if let Some(result) = self.receive_buffer.complete_fill() {
            result?;
        }
        if self.receive_buffer.is_fill_pending() {
            return Ok(false);
        }

        let mut progress = false;
        while !self.in_flight.is_empty() {
            if self.receive_buffer.is_eof() {
                self.receive_buffer.fill_async(self.socket.as_mut(), wake);
                return Ok(progress);
            }

            let mut response = self.response.take().unwrap_or_default();
            if response.read(&mut self.receive_buffer)? {
                self.response = Some(response);
                continue;
            }

            self.dispatch(response)?;
            progress = true;
        }
        Ok(progress)
    }

    /// Offers a complete response to the head of the in-flight queue, passing
    /// over quiet operations it does not belong to.
    fn dispatch(&mut self, response: BinaryResponse) -> io::Result<()> {
        loop {
            let Some(head) = self.in_flight.peek_front_mut() else {
                warn!(
                    endpoint = %self.endpoint,
                    opcode = response.opcode(),
                    opaque = response.opaque(),
                    "response without a pending operation"
                );
                return Ok(());
            };

            if head.op.handles(&response) {
                if !head.op.process_response(Some(&response)) {
                    self.complete_head();
                }
                return Ok(());
            }

            if head.op.process_response(None) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "response (opcode {:#04x}, opaque {}) does not match {:?}",
                        response.opcode(),
                        response.opaque(),
                        head.op
                    ),
                ));
            }
            self.complete_head();
        }
    }

    fn complete_head(&mut self) {
        match self.in_flight.pop_front() {
            Ok(done) => done.complete(),
            Err(err) => debug_assert!(false, "in-flight queue: {err}"),
        }
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.socket.shutdown();
        self.reset_buffers();
        self.socket = self.socket_factory.create();
        self.socket.connect(self.endpoint)
    }

    fn reset_buffers(&mut self) {
        self.write_buffer.reset();
        self.receive_buffer.reset();
        self.response = None;
    }

    /// Fails sent, partially written and buffered operations.
    fn fail_in_flight(&mut self, error: &ClientError) {
        self.response = None;
        for op in self.in_flight.drain() {
            op.fail(error.clone());
        }
        for op in self.written.drain() {
            op.fail(error.clone());
        }
        if let Some((op, _)) = self.current.take() {
            op.fail(error.clone());
        }
    }

    fn abandon_all(&mut self) {
        self.response = None;
        self.current = None;
        self.written.clear();
        self.in_flight.clear();
    }
}
