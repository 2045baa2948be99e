//! Fixed-capacity buffer segments.
//!
//! Each segment is split into three zones:
//!
//! ```text
//! +----------------+---------------------------+-----------------+
//! | header reserve | payload (max_payload)     | trailer reserve |
//! +----------------+---------------------------+-----------------+
//! 0          payload_start               payload_end        capacity
//! ```
//!
//! Payload writers only ever see the middle zone. The link driver reaches the
//! reserves through [`Segment::header_mut`] and [`Segment::trailer_mut`].
//!
//! A segment owns the next segment of its chain, so a chain is a singly linked
//! list of boxes and a segment can never sit in two chains at once.

use crate::config::Layout;
use std::fmt;

/// One buffer segment checked out of a pool.
pub struct Segment {
    /// Index within the owning pool.
    id: u16,
    /// Owning pool.
    pool: u32,
    /// Backing memory, padded so `base` can satisfy the payload alignment.
    buf: Box<[u8]>,
    /// Offset of the segment start within `buf`.
    base: usize,
    layout: Layout,
    /// Payload bytes written.
    len: usize,
    next: Option<Box<Segment>>,
}

impl Segment {
    /// Allocate backing memory for a segment.
    pub(crate) fn new(pool: u32, id: u16, layout: Layout, alignment: usize) -> Box<Self> {
        let buf = vec![0u8; layout.capacity + alignment - 1].into_boxed_slice();
        // The heap block does not move when the box does, so the offset stays valid.
        let base = buf.as_ptr().align_offset(alignment);
        Box::new(Self {
            id,
            pool,
            buf,
            base,
            layout,
            len: 0,
            next: None,
        })
    }

    /// Index of this segment within its pool.
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Identifier of the pool this segment belongs to.
    #[inline]
    pub fn pool_id(&self) -> u32 {
        self.pool
    }

    /// Payload bytes written.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable payload bytes (excludes header and trailer reserves).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.layout.max_payload
    }

    /// Payload bytes still free.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.layout.max_payload - self.len
    }

    /// The written payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        let start = self.base + self.layout.payload_start();
        &self.buf[start..start + self.len]
    }

    /// The written payload, mutably.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.base + self.layout.payload_start();
        &mut self.buf[start..start + self.len]
    }

    /// The header reserve.
    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.buf[self.base..self.base + self.layout.payload_start()]
    }

    /// The header reserve, for the link driver to fill in.
    #[inline]
    pub fn header_mut(&mut self) -> &mut [u8] {
        let end = self.base + self.layout.payload_start();
        &mut self.buf[self.base..end]
    }

    /// The trailer reserve.
    #[inline]
    pub fn trailer(&self) -> &[u8] {
        &self.buf[self.base + self.layout.payload_end()..self.base + self.layout.capacity]
    }

    /// The trailer reserve, for the link driver to fill in.
    #[inline]
    pub fn trailer_mut(&mut self) -> &mut [u8] {
        let start = self.base + self.layout.payload_end();
        let end = self.base + self.layout.capacity;
        &mut self.buf[start..end]
    }

    /// Header, written payload and trailer, in frame order.
    #[inline]
    pub fn frame_parts(&self) -> (&[u8], &[u8], &[u8]) {
        (self.header(), self.payload(), self.trailer())
    }

    /// Pointer to the first payload byte.
    #[inline]
    pub fn payload_ptr(&self) -> *const u8 {
        self.buf[self.base + self.layout.payload_start()..].as_ptr()
    }

    /// The next segment in the chain.
    #[inline]
    pub fn next(&self) -> Option<&Segment> {
        self.next.as_deref()
    }

    #[inline]
    pub(crate) fn next_mut(&mut self) -> Option<&mut Segment> {
        self.next.as_deref_mut()
    }

    #[inline]
    pub(crate) fn has_next(&self) -> bool {
        self.next.is_some()
    }

    #[inline]
    pub(crate) fn take_next(&mut self) -> Option<Box<Segment>> {
        self.next.take()
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: Option<Box<Segment>>) {
        self.next = next;
    }

    /// Copy as much of `bytes` as fits after the written payload.
    ///
    /// Returns the number of bytes copied.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        let start = self.base + self.layout.payload_start() + self.len;
        self.buf[start..start + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// Forget the written payload. Reserve zones are left as they are.
    #[inline]
    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("len", &self.len)
            .field("capacity", &self.layout.max_payload)
            .field("linked", &self.next.is_some())
            .finish()
    }
}

/// Iterator over the segments of a chain.
#[derive(Clone)]
pub struct Segments<'a> {
    pub(crate) cursor: Option<&'a Segment>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a Segment;

    fn next(&mut self) -> Option<Self::Item> {
        let segment = self.cursor?;
        self.cursor = segment.next();
        Some(segment)
    }
}
