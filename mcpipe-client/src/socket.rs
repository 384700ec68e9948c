//! # Node Socket
//!
//! Purpose: The transport a node drives. The driver thread never blocks on a
//! read; it hands a buffer to `receive_async` and is called back when bytes
//! are available.
//!
//! ## Design Principles
//! 1. **Buffer Ownership Transfer**: An outstanding fill owns the receive
//!    buffer; the completion callback hands it back with the read result.
//! 2. **One Reader Per Connection**: `TcpSocket` runs a reader thread that
//!    keeps draining the stream into an inbox. Fills are served from the
//!    inbox, and the server never stalls on a full socket while the driver
//!    is still writing requests.
//! 3. **Replaceable Transport**: Nodes build sockets through a
//!    `SocketFactory`; tests swap in an in-memory one.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Completion callback of an asynchronous fill: the buffer and the read result.
pub type FillCallback = Box<dyn FnOnce(Vec<u8>, io::Result<usize>) + Send>;

/// Byte transport owned by a single node.
pub trait Socket: Send {
    /// Opens the connection.
    fn connect(&mut self, endpoint: SocketAddr) -> io::Result<()>;

    /// Writes all of `data`.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Blocking read of at most `buffer.len()` bytes; `Ok(0)` means closed.
    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Starts a read into `buffer` and invokes `on_complete` once it finishes.
    ///
    /// Errors are reported through the callback; the callback may run before
    /// this method returns.
    fn receive_async(&mut self, buffer: Vec<u8>, on_complete: FillCallback);

    /// Closes the connection; an outstanding fill completes with an error or
    /// end-of-stream.
    fn shutdown(&mut self);
}

/// Creates sockets for nodes (once at start and again on every reconnect).
pub trait SocketFactory: Send + Sync {
    fn create(&self) -> Box<dyn Socket>;
}

impl<F> SocketFactory for F
where
    F: Fn() -> Box<dyn Socket> + Send + Sync,
{
    fn create(&self) -> Box<dyn Socket> {
        self()
    }
}

/// Timeouts applied to every TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOptions {
    pub connect_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

/// Builds `TcpSocket`s with fixed options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory {
    options: SocketOptions,
}

impl TcpSocketFactory {
    pub fn new(options: SocketOptions) -> Self {
        TcpSocketFactory { options }
    }
}

impl SocketFactory for TcpSocketFactory {
    fn create(&self) -> Box<dyn Socket> {
        Box::new(TcpSocket::new(self.options))
    }
}

/// Bytes the reader pulls from the stream per `read` call.
const READ_CHUNK: usize = 64 * 1024;

/// How the reader thread stopped.
enum Closed {
    Eof,
    Failed(io::ErrorKind, String),
}

impl Closed {
    fn result(&self) -> io::Result<usize> {
        match self {
            Closed::Eof => Ok(0),
            Closed::Failed(kind, message) => Err(io::Error::new(*kind, message.clone())),
        }
    }
}

struct WaitingFill {
    buffer: Vec<u8>,
    on_complete: FillCallback,
    since: Instant,
}

impl WaitingFill {
    fn complete(self, result: io::Result<usize>) {
        (self.on_complete)(self.buffer, result);
    }
}

/// Bytes read off the stream but not yet handed to the node.
#[derive(Default)]
struct Inbox {
    bytes: BytesMut,
    closed: Option<Closed>,
    waiting: Option<WaitingFill>,
}

impl Inbox {
    fn copy_out(&mut self, buffer: &mut [u8]) -> usize {
        let count = buffer.len().min(self.bytes.len());
        buffer[..count].copy_from_slice(&self.bytes[..count]);
        self.bytes.advance(count);
        count
    }

    /// Serves the waiting fill if there is anything to hand it.
    fn take_ready(&mut self) -> Option<(WaitingFill, io::Result<usize>)> {
        if self.bytes.is_empty() && self.closed.is_none() {
            return None;
        }
        let mut fill = self.waiting.take()?;
        let result = if self.bytes.is_empty() {
            self.closed.as_ref().map_or(Ok(0), Closed::result)
        } else {
            Ok(self.copy_out(&mut fill.buffer))
        };
        Some((fill, result))
    }
}

/// Shared between the node's socket handle and its reader thread.
#[derive(Default)]
struct Inbound {
    inbox: Mutex<Inbox>,
    ready: Condvar,
}

impl Inbound {
    fn push(&self, data: &[u8]) {
        let ready = {
            let mut inbox = self.inbox.lock();
            inbox.bytes.extend_from_slice(data);
            inbox.take_ready()
        };
        self.ready.notify_all();
        if let Some((fill, result)) = ready {
            fill.complete(result);
        }
    }

    fn close(&self, closed: Closed) {
        let ready = {
            let mut inbox = self.inbox.lock();
            inbox.closed = Some(closed);
            inbox.take_ready()
        };
        self.ready.notify_all();
        if let Some((fill, result)) = ready {
            fill.complete(result);
        }
    }

    /// Fails a fill that has waited longer than `timeout` for data.
    fn expire(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return;
        };
        let expired = {
            let mut inbox = self.inbox.lock();
            let overdue = inbox
                .waiting
                .as_ref()
                .is_some_and(|fill| fill.since.elapsed() >= timeout);
            if overdue {
                inbox.waiting.take()
            } else {
                None
            }
        };
        if let Some(fill) = expired {
            fill.complete(Err(io::Error::new(io::ErrorKind::TimedOut, "receive timed out")));
        }
    }
}

struct Reader {
    inbound: Arc<Inbound>,
    thread: JoinHandle<()>,
}

/// TCP transport whose reader thread drains the stream continuously, so the
/// server can always finish writing responses while the driver is blocked
/// writing requests.
pub struct TcpSocket {
    options: SocketOptions,
    stream: Option<TcpStream>,
    reader: Option<Reader>,
}

impl TcpSocket {
    pub fn new(options: SocketOptions) -> Self {
        TcpSocket {
            options,
            stream: None,
            reader: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is not connected"))
    }

    fn inbound(&self) -> io::Result<&Arc<Inbound>> {
        self.reader
            .as_ref()
            .map(|reader| &reader.inbound)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket is not connected"))
    }

    fn spawn_reader(&mut self, endpoint: SocketAddr) -> io::Result<()> {
        let mut stream = self.stream()?.try_clone()?;
        let inbound = Arc::new(Inbound::default());
        let shared = Arc::clone(&inbound);
        let timeout = self.options.receive_timeout;

        let thread = thread::Builder::new()
            .name(format!("mcpipe-reader-{endpoint}"))
            .spawn(move || {
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => {
                            trace!(endpoint = %endpoint, "stream closed by peer");
                            shared.close(Closed::Eof);
                            return;
                        }
                        Ok(count) => shared.push(&chunk[..count]),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                            shared.expire(timeout);
                        }
                        Err(err) => {
                            trace!(endpoint = %endpoint, error = %err, "stream read failed");
                            shared.close(Closed::Failed(err.kind(), err.to_string()));
                            return;
                        }
                    }
                }
            })?;

        self.reader = Some(Reader { inbound, thread });
        Ok(())
    }
}

impl Socket for TcpSocket {
    fn connect(&mut self, endpoint: SocketAddr) -> io::Result<()> {
        self.shutdown();

        let stream = match self.options.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&endpoint, timeout)?,
            None => TcpStream::connect(endpoint)?,
        };
        stream.set_read_timeout(self.options.receive_timeout)?;
        stream.set_write_timeout(self.options.send_timeout)?;
        // Pipelined requests are flushed in batches; Nagle only adds latency.
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.spawn_reader(endpoint)?;
        debug!(endpoint = %endpoint, "socket connected");
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()
    }

    fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let timeout = self.options.receive_timeout;
        let inbound = Arc::clone(self.inbound()?);
        let mut inbox = inbound.inbox.lock();
        loop {
            if !inbox.bytes.is_empty() {
                return Ok(inbox.copy_out(buffer));
            }
            if let Some(closed) = &inbox.closed {
                return closed.result();
            }
            match timeout {
                Some(timeout) => {
                    if inbound.ready.wait_for(&mut inbox, timeout).timed_out() && inbox.bytes.is_empty() {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "receive timed out"));
                    }
                }
                None => inbound.ready.wait(&mut inbox),
            }
        }
    }

    fn receive_async(&mut self, buffer: Vec<u8>, on_complete: FillCallback) {
        let inbound = match self.inbound() {
            Ok(inbound) => Arc::clone(inbound),
            Err(err) => {
                on_complete(buffer, Err(err));
                return;
            }
        };

        let ready = {
            let mut inbox = inbound.inbox.lock();
            inbox.waiting = Some(WaitingFill {
                buffer,
                on_complete,
                since: Instant::now(),
            });
            inbox.take_ready()
        };
        if let Some((fill, result)) = ready {
            fill.complete(result);
        }
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(Reader { inbound, thread }) = self.reader.take() {
            let _ = thread.join();
            inbound.close(Closed::Eof);
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! Scripted in-memory transport for driving nodes without a network.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct State {
        sent: Vec<u8>,
        inbound: VecDeque<u8>,
        chunk: Option<usize>,
        pending: Option<(Vec<u8>, FillCallback)>,
        fail_send: bool,
        fail_connect: bool,
        connects: usize,
        connected: bool,
    }

    impl State {
        fn read_into(&mut self, buffer: &mut [u8]) -> usize {
            let limit = self.chunk.unwrap_or(usize::MAX).min(buffer.len());
            let count = limit.min(self.inbound.len());
            for (slot, byte) in buffer.iter_mut().zip(self.inbound.drain(..count)) {
                *slot = byte;
            }
            count
        }
    }

    /// Handle to a shared in-memory connection; clones observe the same state.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySocket {
        state: Arc<Mutex<State>>,
    }

    impl MemorySocket {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Factory handing out handles to this same connection.
        pub(crate) fn factory(&self) -> Arc<dyn SocketFactory> {
            let socket = self.clone();
            Arc::new(move || Box::new(socket.clone()) as Box<dyn Socket>)
        }

        /// Queues server bytes and completes an outstanding fill.
        pub(crate) fn push_inbound(&self, bytes: &[u8]) {
            let completion = {
                let mut state = self.state.lock();
                state.inbound.extend(bytes.iter().copied());
                match state.pending.take() {
                    Some((mut buffer, callback)) => {
                        let count = state.read_into(&mut buffer);
                        Some((buffer, callback, count))
                    }
                    None => None,
                }
            };
            if let Some((buffer, callback, count)) = completion {
                callback(buffer, Ok(count));
            }
        }

        /// Completes an outstanding fill with `error`.
        pub(crate) fn fail_pending_fill(&self, error: io::Error) {
            let pending = self.state.lock().pending.take();
            if let Some((buffer, callback)) = pending {
                callback(buffer, Err(error));
            }
        }

        pub(crate) fn has_pending_fill(&self) -> bool {
            self.state.lock().pending.is_some()
        }

        pub(crate) fn take_sent(&self) -> Vec<u8> {
            std::mem::take(&mut self.state.lock().sent)
        }

        pub(crate) fn set_chunk(&self, chunk: usize) {
            self.state.lock().chunk = Some(chunk);
        }

        pub(crate) fn fail_sends(&self, fail: bool) {
            self.state.lock().fail_send = fail;
        }

        pub(crate) fn fail_connects(&self, fail: bool) {
            self.state.lock().fail_connect = fail;
        }

        pub(crate) fn connects(&self) -> usize {
            self.state.lock().connects
        }

        pub(crate) fn is_connected(&self) -> bool {
            self.state.lock().connected
        }
    }

    impl Socket for MemorySocket {
        fn connect(&mut self, _endpoint: SocketAddr) -> io::Result<()> {
            let mut state = self.state.lock();
            if state.fail_connect {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            state.connects += 1;
            state.connected = true;
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            let mut state = self.state.lock();
            if state.fail_send {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            state.sent.extend_from_slice(data);
            Ok(())
        }

        fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.lock();
            if state.inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
            }
            Ok(state.read_into(buffer))
        }

        fn receive_async(&mut self, mut buffer: Vec<u8>, on_complete: FillCallback) {
            let count = {
                let mut state = self.state.lock();
                if state.inbound.is_empty() {
                    state.pending = Some((buffer, on_complete));
                    return;
                }
                state.read_into(&mut buffer)
            };
            on_complete(buffer, Ok(count));
        }

        fn shutdown(&mut self) {
            let pending = {
                let mut state = self.state.lock();
                state.connected = false;
                state.pending.take()
            };
            if let Some((buffer, callback)) = pending {
                callback(buffer, Ok(0));
            }
        }
    }
}
