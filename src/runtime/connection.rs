//! Per-connection state machine and the connection registry.
//!
//! A connection moves through these states:
//!
//! ```text
//! Reading -> FrameReady -> Writing -> Reading
//!                                  \-> Closing -> Closed
//! ```
//!
//! The state is not stored explicitly. It follows from the buffers and the
//! `want_*` flags, which are recomputed after every unit of work.

use crate::protocols::Handler;
use crate::runtime::buffer::ByteBuffer;
use crate::runtime::codec::{self, Decoded};
use mio::{Interest, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{trace, warn};

/// Buffer limits shared by every connection of a loop.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    /// Bytes reserved ahead of each socket read.
    pub read_chunk_size: usize,
    /// Outbound size above which reads and dispatch pause.
    pub max_pending_output: usize,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: Option<SocketAddr>,
    limits: BufferLimits,
    /// Received bytes not yet handled.
    inbound: ByteBuffer,
    /// Encoded responses not yet sent.
    outbound: ByteBuffer,
    want_read: bool,
    want_write: bool,
    want_close: bool,
    /// Last readiness seen for reads; cleared on would-block.
    readable: bool,
    /// Last readiness seen for writes; cleared on would-block.
    writable: bool,
    /// Interest currently registered with the poller.
    registered: Option<Interest>,
    last_active: Instant,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a freshly accepted non-blocking stream.
    pub fn new(stream: S, peer: Option<SocketAddr>, limits: BufferLimits) -> Self {
        Self {
            stream,
            peer,
            limits,
            // Largest legal frame plus one read of slack
            inbound: ByteBuffer::with_limit(
                codec::HEADER_LEN + codec::MAX_MSG_SIZE + limits.read_chunk_size,
            ),
            outbound: ByteBuffer::new(),
            want_read: true,
            want_write: false,
            want_close: false,
            readable: false,
            // Try writing straight away; a would-block clears this
            writable: true,
            registered: None,
            last_active: Instant::now(),
        }
    }

    pub fn want_read(&self) -> bool {
        self.want_read
    }

    #[cfg(test)]
    pub fn want_write(&self) -> bool {
        self.want_write
    }

    pub fn want_close(&self) -> bool {
        self.want_close
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Record readiness reported by the poller.
    pub fn mark_ready(&mut self, readable: bool, writable: bool) {
        self.readable |= readable;
        self.writable |= writable;
    }

    /// One unit of work: read, dispatch buffered frames, flush.
    ///
    /// An `Err` means the socket is unusable and the connection must be
    /// finalized immediately.
    pub fn service<H: Handler + ?Sized>(&mut self, handler: &mut H) -> io::Result<()> {
        if self.readable && self.want_read {
            self.fill_inbound()?;
        }
        self.dispatch(handler);
        if self.writable && self.want_write {
            self.flush_outbound()?;
        }
        self.update_interest();
        Ok(())
    }

    /// Read until the socket would block, the peer closes, or a complete
    /// frame is buffered.
    ///
    /// Returns the number of bytes read.
    pub fn fill_inbound(&mut self) -> io::Result<usize> {
        let mut total = 0;

        while self.want_read {
            self.inbound.reserve(self.limits.read_chunk_size);
            match self.stream.read(self.inbound.spare_mut()) {
                Ok(0) => {
                    trace!(peer = ?self.peer, "peer closed");
                    self.readable = false;
                    self.want_close = true;
                }
                Ok(n) => {
                    self.inbound.commit(n);
                    self.last_active = Instant::now();
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.readable = false;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            self.update_interest();
        }

        Ok(total)
    }

    /// Hand every complete buffered frame to `handler` and queue the responses.
    ///
    /// Only frames already in `inbound` are processed; nothing more is read.
    /// Returns the number of frames dispatched.
    pub fn dispatch<H: Handler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let mut frames = 0;

        while self.outbound.len() < self.limits.max_pending_output {
            let decoded = match codec::try_decode_request(self.inbound.as_slice()) {
                Decoded::Incomplete => break,
                Decoded::Malformed(e) => Err(e),
                Decoded::Frame(request) => {
                    let payload = handler.handle(&request.args);
                    self.outbound.append(&codec::encode_response(&payload));
                    Ok(request.consumed)
                }
            };

            match decoded {
                Ok(consumed) => {
                    self.inbound.consume(consumed);
                    frames += 1;
                }
                Err(e) => {
                    warn!(peer = ?self.peer, error = %e, "protocol error, closing");
                    self.inbound.clear();
                    self.want_close = true;
                    break;
                }
            }
        }

        if self.inbound.is_empty() {
            self.inbound.shrink_to(self.idle_capacity());
        }
        self.update_interest();
        frames
    }

    /// Write queued bytes until the socket would block or the queue empties.
    ///
    /// Returns the number of bytes written.
    pub fn flush_outbound(&mut self) -> io::Result<usize> {
        let mut total = 0;

        while !self.outbound.is_empty() {
            match self.stream.write(self.outbound.as_slice()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    self.outbound.consume(n);
                    self.last_active = Instant::now();
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if self.outbound.is_empty() {
            self.outbound.shrink_to(self.idle_capacity());
        }
        self.update_interest();
        Ok(total)
    }

    /// Recompute `want_read` / `want_write` from buffer and lifecycle state.
    pub fn update_interest(&mut self) {
        // Stop reading once a frame is buffered (or the header is already
        // invalid); dispatch decides what happens next.
        self.want_read = !self.want_close
            && matches!(codec::frame_len(self.inbound.as_slice()), Ok(None))
            && self.outbound.len() < self.limits.max_pending_output;
        self.want_write = !self.outbound.is_empty();
    }

    /// Stop reading and drop any partial request; queued output still drains.
    pub fn close_gracefully(&mut self) {
        self.want_close = true;
        self.inbound.clear();
        self.update_interest();
    }

    /// Closing with nothing left to send.
    pub fn is_finished(&self) -> bool {
        self.want_close && self.outbound.is_empty()
    }

    /// Whether another `service` call would make progress without new readiness.
    pub fn has_pending_work(&self) -> bool {
        (self.readable && self.want_read)
            || (self.writable && self.want_write)
            || (self.has_complete_frame()
                && self.outbound.len() < self.limits.max_pending_output)
    }

    /// Interest the poller should watch, or `None` to stop watching.
    pub fn desired_interest(&self) -> Option<Interest> {
        match (self.want_read, self.want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    pub fn registered(&self) -> Option<Interest> {
        self.registered
    }

    pub fn set_registered(&mut self, interest: Option<Interest>) {
        self.registered = interest;
    }

    fn has_complete_frame(&self) -> bool {
        matches!(codec::frame_len(self.inbound.as_slice()), Ok(Some(_)))
    }

    fn idle_capacity(&self) -> usize {
        self.limits.read_chunk_size.max(4 * 1024)
    }
}

/// Identifier of a registered connection.
///
/// Pairs the slab slot with a generation so that an event for a closed
/// connection is never delivered to a later connection that reused its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId {
    slot: usize,
    generation: usize,
}

const SLOT_BITS: u32 = usize::BITS / 2;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;

impl ConnId {
    /// Poller token carrying both slot and generation.
    pub fn token(self) -> Token {
        Token((self.generation << SLOT_BITS) | self.slot)
    }

    pub fn from_token(token: Token) -> Self {
        Self {
            slot: token.0 & SLOT_MASK,
            generation: token.0 >> SLOT_BITS,
        }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
struct Entry<S> {
    generation: usize,
    conn: Connection<S>,
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<Entry<S>>,
    max_connections: usize,
    next_generation: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    ///
    /// The capacity is clamped so every slot fits in the token encoding and
    /// no token collides with `usize::MAX`.
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.min(SLOT_MASK);
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            next_generation: 0,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity; the connection is
    /// dropped, which closes its stream.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<ConnId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation = (self.next_generation + 1) & (usize::MAX >> SLOT_BITS);
        let slot = self.connections.insert(Entry { generation, conn });
        Some(ConnId { slot, generation })
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<S>> {
        self.connections
            .get_mut(id.slot)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| &mut entry.conn)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<S>> {
        if self.contains(id) {
            Some(self.connections.remove(id.slot).conn)
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: ConnId) -> bool {
        self.connections
            .get(id.slot)
            .is_some_and(|entry| entry.generation == id.generation)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Iterate over all connections mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnId, &mut Connection<S>)> {
        self.connections.iter_mut().map(|(slot, entry)| {
            let id = ConnId {
                slot,
                generation: entry.generation,
            };
            (id, &mut entry.conn)
        })
    }
}
