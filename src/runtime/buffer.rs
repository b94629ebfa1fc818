//! Growable FIFO byte buffer for per-connection I/O.
//!
//! Bytes are appended at the tail and consumed from the head. The live
//! region is `storage[head..tail]`; the backing vector is always fully
//! initialized so sockets can read straight into the spare tail region.
//!
//! ## Growth Policy
//!
//! Consuming never moves data. When the tail runs out of room, the buffer
//! either compacts (slides live bytes to the front) or doubles its capacity:
//! - compaction only happens when the dead prefix is at least as large as
//!   the live region, so every copied byte is paid for by a consumed one
//! - otherwise capacity doubles, giving amortized O(1) appends
//!
//! Doubling stops at an optional ceiling, so a buffer sized for the largest
//! legal message never reaches twice that size. A single reservation larger
//! than the ceiling is still honoured exactly.
//!
//! Draining the buffer resets both offsets, so the common request/response
//! pattern never copies at all.

/// Smallest capacity allocated once the buffer is first used.
const MIN_CAPACITY: usize = 4 * 1024;

/// FIFO byte buffer with head/tail offsets.
#[derive(Debug)]
pub struct ByteBuffer {
    /// Backing storage; `storage.len()` is the capacity.
    storage: Vec<u8>,
    /// Offset of the first live byte.
    head: usize,
    /// Offset one past the last live byte.
    tail: usize,
    /// Growth by doubling is clamped to this capacity.
    max_capacity: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl ByteBuffer {
    /// Create an empty buffer without allocating.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer whose growth is clamped to `max_capacity`.
    pub fn with_limit(max_capacity: usize) -> Self {
        Self {
            storage: Vec::new(),
            head: 0,
            tail: 0,
            max_capacity,
        }
    }

    /// Create an empty buffer with `capacity` bytes of backing storage.
    #[cfg(test)]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity],
            ..Self::default()
        }
    }

    /// Number of live bytes.
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Size of the backing storage.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The live bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.head..self.tail]
    }

    /// Append `data` at the tail.
    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.storage[self.tail..self.tail + data.len()].copy_from_slice(data);
        self.tail += data.len();
    }

    /// Drop `n` bytes from the head.
    ///
    /// # Panics
    /// Panics if `n` exceeds the number of live bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume({n}) past end of buffer ({})", self.len());
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Discard all live bytes, keeping the allocation.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Ensure at least `additional` bytes are writable after the tail.
    pub fn reserve(&mut self, additional: usize) {
        if self.storage.len() - self.tail >= additional {
            return;
        }

        let len = self.len();
        let needed = len + additional;

        if needed <= self.storage.len() && self.head >= len {
            // Dead prefix covers the copy cost
            self.storage.copy_within(self.head..self.tail, 0);
        } else {
            let new_capacity = (self.storage.len() * 2)
                .max(MIN_CAPACITY)
                .min(self.max_capacity)
                .max(needed);
            let mut storage = vec![0u8; new_capacity];
            storage[..len].copy_from_slice(self.as_slice());
            self.storage = storage;
        }

        self.head = 0;
        self.tail = len;
    }

    /// Writable region after the tail. Pair with [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.tail..]
    }

    /// Mark `n` bytes written into [`spare_mut`](Self::spare_mut) as live.
    ///
    /// # Panics
    /// Panics if `n` exceeds the spare capacity.
    pub fn commit(&mut self, n: usize) {
        assert!(
            self.tail + n <= self.storage.len(),
            "commit({n}) past capacity"
        );
        self.tail += n;
    }

    /// Release backing storage above `max_capacity` while the buffer is empty.
    ///
    /// Keeps one large message from pinning its allocation for the lifetime
    /// of the connection.
    pub fn shrink_to(&mut self, max_capacity: usize) {
        if self.is_empty() && self.storage.len() > max_capacity {
            self.storage = vec![0u8; max_capacity];
            self.head = 0;
            self.tail = 0;
        }
    }
}
