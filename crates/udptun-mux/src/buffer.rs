//! Bounded byte staging area used for every socket-to-session and session-to-socket copy.
//!
//! A [`Buffer`] never grows on its own. Running out of room is reported to the caller as a
//! [`BufferError`] so it can apply backpressure; bytes already committed are never touched by a
//! failed call.

use thiserror::Error;

/// Default per-direction staging budget.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer overflow: {requested} bytes requested, {available} available")]
    Overflow { requested: usize, available: usize },

    #[error("buffer underflow: {requested} bytes requested, {used} buffered")]
    Underflow { requested: usize, used: usize },

    #[error("cannot resize buffer to {capacity} bytes while {used} bytes are buffered")]
    ResizeWouldTruncate { capacity: usize, used: usize },
}

/// Fixed-capacity byte buffer with head/tail cursors.
///
/// The readable region starts at the head offset and spans [`Buffer::used`] bytes. The writable
/// region returned by [`Buffer::tail_mut`] always spans [`Buffer::unused`] bytes; consumed bytes at
/// the front are reclaimed lazily when the tail is requested.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    used: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            head: 0,
            used: 0,
        }
    }

    /// Sets the capacity. Intended to run once, when the owning session is created.
    pub fn resize(&mut self, capacity: usize) -> Result<(), BufferError> {
        if capacity < self.used {
            return Err(BufferError::ResizeWouldTruncate {
                capacity,
                used: self.used,
            });
        }
        self.compact();
        self.data.resize(capacity, 0);
        self.data.shrink_to_fit();
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn unused(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Readable bytes, oldest first.
    pub fn head(&self) -> &[u8] {
        &self.data[self.head..self.head + self.used]
    }

    /// Writable region of exactly [`Buffer::unused`] bytes. Bytes written here become readable
    /// only after [`Buffer::commit`].
    pub fn tail_mut(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.used..]
    }

    /// Marks `n` bytes just written into [`Buffer::tail_mut`] as valid.
    pub fn commit(&mut self, n: usize) -> Result<(), BufferError> {
        let available = self.unused();
        if n > available {
            return Err(BufferError::Overflow {
                requested: n,
                available,
            });
        }
        self.compact();
        self.used += n;
        Ok(())
    }

    /// Consumes `n` bytes from the front.
    pub fn remove(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.used {
            return Err(BufferError::Underflow {
                requested: n,
                used: self.used,
            });
        }
        self.used -= n;
        self.head = if self.used == 0 { 0 } else { self.head + n };
        Ok(())
    }

    /// Copies `bytes` in and commits them, or fails without modifying the buffer.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let available = self.unused();
        if bytes.len() > available {
            return Err(BufferError::Overflow {
                requested: bytes.len(),
                available,
            });
        }
        self.tail_mut()[..bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Ok(())
    }

    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.head + self.used, 0);
        self.head = 0;
    }
}
