//! Fragment tags, their wire header and the fragmenting iterator.
//!
//! Fragment header layout (12 bytes, byte order per [`Endianness`]):
//!
//! ```text
//! 0        4        8     9          12
//! +--------+--------+-----+----------+
//! | dgram  | offset | flg | reserved |
//! +--------+--------+-----+----------+
//! ```
//!
//! `flg` bit 0 is "more fragments". Other flag bits and the reserved bytes
//! are written as zero and ignored on decode.

use crate::config::Endianness;
use crate::error::{BufferError, Result};
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::stats::PoolCounters;
use bytes::{Buf, BufMut};

/// Encoded size of a [`FragmentHeader`].
pub const FRAGMENT_HEADER_LEN: usize = 12;

const FLAG_MORE_FRAGMENTS: u8 = 0x01;

/// Where a fragment sits within its original datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentInfo {
    /// Shared by every fragment of one datagram.
    pub datagram_id: u32,
    /// Byte offset of this fragment's payload in the original.
    pub offset: usize,
    /// False only on the last fragment.
    pub more_fragments: bool,
}

/// On-wire form of a [`FragmentInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub datagram_id: u32,
    pub offset: u32,
    pub more_fragments: bool,
}

impl FragmentHeader {
    /// Write the header into the first [`FRAGMENT_HEADER_LEN`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`FRAGMENT_HEADER_LEN`].
    pub fn encode(&self, mut buf: &mut [u8], endianness: Endianness) {
        let flags = if self.more_fragments {
            FLAG_MORE_FRAGMENTS
        } else {
            0
        };
        match endianness {
            Endianness::Little => {
                buf.put_u32_le(self.datagram_id);
                buf.put_u32_le(self.offset);
            }
            Endianness::Big => {
                buf.put_u32(self.datagram_id);
                buf.put_u32(self.offset);
            }
        }
        buf.put_u8(flags);
        buf.put_bytes(0, 3);
    }

    /// Read a header from the start of `buf`.
    pub fn decode(buf: &[u8], endianness: Endianness) -> Result<Self> {
        if buf.len() < FRAGMENT_HEADER_LEN {
            return Err(BufferError::Truncated {
                len: buf.len(),
                needed: FRAGMENT_HEADER_LEN,
            });
        }
        let mut buf = &buf[..FRAGMENT_HEADER_LEN];
        let (datagram_id, offset) = match endianness {
            Endianness::Little => (buf.get_u32_le(), buf.get_u32_le()),
            Endianness::Big => (buf.get_u32(), buf.get_u32()),
        };
        let flags = buf.get_u8();
        Ok(Self {
            datagram_id,
            offset,
            more_fragments: flags & FLAG_MORE_FRAGMENTS != 0,
        })
    }
}

impl TryFrom<FragmentInfo> for FragmentHeader {
    type Error = BufferError;

    fn try_from(info: FragmentInfo) -> Result<Self> {
        let offset = u32::try_from(info.offset).map_err(|_| BufferError::OutOfBounds {
            offset: info.offset,
            len: u32::MAX as usize,
        })?;
        Ok(Self {
            datagram_id: info.datagram_id,
            offset,
            more_fragments: info.more_fragments,
        })
    }
}

impl From<FragmentHeader> for FragmentInfo {
    fn from(header: FragmentHeader) -> Self {
        Self {
            datagram_id: header.datagram_id,
            offset: header.offset as usize,
            more_fragments: header.more_fragments,
        }
    }
}

/// Lazily splits a packet into link-sized fragments.
///
/// Created by [`PacketPool::fragment_for_link`]. Each call to `next` takes
/// one fragment's worth of segments from the pool and copies the matching
/// slice of the source into it. If the pool cannot supply them, the error
/// is yielded once and the iterator then ends with the position kept.
/// [`Fragmenter::resume`] continues from that position once segments are
/// freed; [`Fragmenter::restart`] starts over from offset zero under the
/// same datagram id.
#[derive(Debug)]
pub struct Fragmenter<'a> {
    pool: &'a PacketPool,
    source: &'a Packet,
    datagram_id: u32,
    fragment_len: usize,
    offset: usize,
    done: bool,
    /// Set after an error is yielded, cleared by `resume` or `restart`.
    stalled: bool,
}

impl<'a> Fragmenter<'a> {
    pub(crate) fn new(
        pool: &'a PacketPool,
        source: &'a Packet,
        datagram_id: u32,
        fragment_len: usize,
    ) -> Self {
        Self {
            pool,
            source,
            datagram_id,
            fragment_len,
            offset: 0,
            done: false,
            stalled: false,
        }
    }

    /// Identifier tagged on every fragment.
    pub fn datagram_id(&self) -> u32 {
        self.datagram_id
    }

    /// Payload bytes per fragment, except possibly the last.
    pub fn fragment_len(&self) -> usize {
        self.fragment_len
    }

    /// Total fragments this datagram splits into.
    pub fn fragment_count(&self) -> usize {
        self.source.len().div_ceil(self.fragment_len).max(1)
    }

    /// Source offset of the next fragment.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the last fragment failed to build.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Continue from the current offset after a failed fragment.
    pub fn resume(&mut self) {
        self.stalled = false;
    }

    /// Rewind to the first fragment.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.done = false;
        self.stalled = false;
    }

    fn build(&self, len: usize) -> Result<Packet> {
        let mut fragment = self.pool.allocate(len)?;
        for slice in self.source.slices(self.offset, len) {
            fragment.append(slice)?;
        }
        fragment.set_fragment_info(Some(FragmentInfo {
            datagram_id: self.datagram_id,
            offset: self.offset,
            more_fragments: self.offset + len < self.source.len(),
        }));
        Ok(fragment)
    }
}

impl Iterator for Fragmenter<'_> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.stalled {
            return None;
        }
        let total = self.source.len();
        let len = self.fragment_len.min(total - self.offset);

        let fragment = match self.build(len) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.stalled = true;
                return Some(Err(e));
            }
        };

        tracing::trace!(
            datagram_id = self.datagram_id,
            offset = self.offset,
            len,
            "fragment built"
        );
        PoolCounters::incr(&self.pool.shared.counters.fragments);

        self.offset += len;
        if self.offset >= total {
            self.done = true;
        }
        Some(Ok(fragment))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done || self.stalled {
            return (0, Some(0));
        }
        let left = (self.source.len() - self.offset)
            .div_ceil(self.fragment_len)
            .max(1);
        // A failed fragment ends the sequence early.
        (1, Some(left))
    }
}
