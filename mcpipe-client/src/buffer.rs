//! # Frame Buffers
//!
//! Purpose: Fixed-capacity scratch space between the codec and the socket.
//! Requests are packed into a `WriteBuffer` and flushed with one write; responses
//! are parsed out of a `ReceiveBuffer` refilled one socket read at a time.
//!
//! ## Design Principles
//! 1. **Partial Progress**: `append` copies what fits and reports how much, so
//!    a request larger than the buffer is written across several flushes.
//! 2. **No Blocking on the Driver**: `fill_async` lends the backing storage to
//!    the socket and returns immediately; `complete_fill` takes it back.
//! 3. **Stale Bytes Are Dropped**: `reset` discards buffered input and any fill
//!    still in flight after a hard failure.
//!
//! ## Memory Layout Example
//!
//! ```text
//! ReceiveBuffer (capacity 8, one fill of 6 bytes):
//! +---+---+---+---+---+---+---+---+
//! | c | c | u | u | u | u | . | . |
//! +---+---+---+---+---+---+---+---+
//!          ^               ^
//!       position       available
//! c = consumed, u = unread, . = unused
//! ```

use std::io;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::signal::WakeSignal;
use crate::socket::Socket;

/// Outbound accumulation buffer.
#[derive(Debug)]
pub struct WriteBuffer {
    data: Vec<u8>,
    position: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        WriteBuffer {
            data: vec![0; capacity],
            position: 0,
        }
    }

    /// Copies as much of `source` as fits and returns the number of bytes taken.
    pub fn append(&mut self, source: &[u8]) -> usize {
        let count = source.len().min(self.remaining());
        self.data[self.position..self.position + count].copy_from_slice(&source[..count]);
        self.position += count;
        count
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.position == self.data.len()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// The filled prefix, ready for a single socket write.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.position]
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

struct FillCompletion {
    generation: u64,
    buffer: Vec<u8>,
    result: io::Result<usize>,
}

/// Inbound fill buffer.
pub struct ReceiveBuffer {
    data: Option<Vec<u8>>,
    capacity: usize,
    position: usize,
    available: usize,
    fill_pending: bool,
    generation: u64,
    completions: Sender<FillCompletion>,
    completed: Receiver<FillCompletion>,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        let (completions, completed) = unbounded();
        ReceiveBuffer {
            data: Some(vec![0; capacity]),
            capacity,
            position: 0,
            available: 0,
            fill_pending: false,
            generation: 0,
            completions,
            completed,
        }
    }

    /// True when every buffered byte has been consumed.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.position >= self.available
    }

    #[inline]
    pub fn is_fill_pending(&self) -> bool {
        self.fill_pending
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unread bytes.
    pub fn unread(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[self.position..self.available],
            None => &[],
        }
    }

    /// Copies unread bytes into `out` and returns how many were copied.
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let chunk = self.take(out.len());
        let count = chunk.len();
        out[..count].copy_from_slice(chunk);
        count
    }

    /// Consumes up to `max` unread bytes and returns them.
    pub fn take(&mut self, max: usize) -> &[u8] {
        let start = self.position;
        let count = max.min(self.available.saturating_sub(start));
        self.position += count;
        match &self.data {
            Some(data) => &data[start..start + count],
            None => &[],
        }
    }

    /// Blocking refill. Only reads when the buffer is exhausted.
    pub fn fill(&mut self, socket: &mut dyn Socket) -> io::Result<()> {
        if !self.is_eof() || self.fill_pending {
            return Ok(());
        }

        let data = self.data.get_or_insert_with(|| vec![0; self.capacity]);
        let count = socket.receive(data)?;
        self.accept(count)
    }

    /// Starts a non-blocking refill. `wake` is set once bytes (or an error)
    /// arrive; call `complete_fill` afterwards to take the buffer back.
    pub fn fill_async(&mut self, socket: &mut dyn Socket, wake: &Arc<WakeSignal>) {
        if !self.is_eof() || self.fill_pending {
            return;
        }

        let capacity = self.capacity;
        let buffer = self.data.take().unwrap_or_else(|| vec![0; capacity]);
        let completions = self.completions.clone();
        let generation = self.generation;
        let wake = Arc::clone(wake);

        // The socket may complete the fill before returning.
        self.fill_pending = true;
        socket.receive_async(
            buffer,
            Box::new(move |buffer, result| {
                let _ = completions.send(FillCompletion {
                    generation,
                    buffer,
                    result,
                });
                wake.set();
            }),
        );
    }

    /// Takes back the buffer of a finished fill.
    ///
    /// Returns `None` while no fill has finished, otherwise the fill outcome.
    /// A read of zero bytes is reported as `UnexpectedEof`.
    pub fn complete_fill(&mut self) -> Option<io::Result<()>> {
        if !self.fill_pending {
            return None;
        }

        loop {
            let completion = match self.completed.try_recv() {
                Ok(completion) => completion,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            };
            if completion.generation != self.generation {
                continue;
            }

            self.fill_pending = false;
            self.data = Some(completion.buffer);
            return Some(completion.result.and_then(|count| self.accept(count)));
        }
    }

    /// Drops all buffered bytes and forgets any outstanding fill.
    pub fn reset(&mut self) {
        self.position = 0;
        self.available = 0;
        self.fill_pending = false;
        self.generation += 1;
        if self.data.is_none() {
            self.data = Some(vec![0; self.capacity]);
        }
        while self.completed.try_recv().is_ok() {}
    }

    fn accept(&mut self, count: usize) -> io::Result<()> {
        self.position = 0;
        self.available = count;
        if count == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReceiveBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveBuffer")
            .field("capacity", &self.capacity)
            .field("position", &self.position)
            .field("available", &self.available)
            .field("fill_pending", &self.fill_pending)
            .finish()
    }
}
