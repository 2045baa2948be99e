//! Packets: a chain of segments plus the bookkeeping that describes it.

use crate::error::{BufferError, Result};
use crate::fault::{self, Violation};
use crate::fragment::{FRAGMENT_HEADER_LEN, FragmentHeader, FragmentInfo};
use crate::pool::PoolShared;
use crate::segment::{Segment, Segments};
use crate::stats::PoolCounters;
use std::fmt;
use std::sync::Arc;

/// A packet built from one or more pool segments.
///
/// The packet owns its chain. Dropping it returns every segment to the pool,
/// as does [`Packet::release`]; after a release the packet is an empty husk
/// and further use fails with [`BufferError::Released`].
pub struct Packet {
    head: Option<Box<Segment>>,
    /// Payload bytes across the chain.
    len: usize,
    segment_count: usize,
    /// Index of the segment the next append writes into.
    write_index: usize,
    fragment: Option<FragmentInfo>,
    pool: Arc<PoolShared>,
}

impl Packet {
    /// Link `segments` in order into a packet.
    ///
    /// Segments may already hold payload; the write cursor is placed on the
    /// last segment with data.
    pub(crate) fn from_segments(pool: Arc<PoolShared>, segments: Vec<Box<Segment>>) -> Self {
        let segment_count = segments.len();
        let len: usize = segments.iter().map(|s| s.len()).sum();
        let write_index = segments.iter().rposition(|s| !s.is_empty()).unwrap_or(0);

        let mut head: Option<Box<Segment>> = None;
        for mut segment in segments.into_iter().rev() {
            segment.set_next(head.take());
            head = Some(segment);
        }

        let packet = Self {
            head,
            len,
            segment_count,
            write_index,
            fragment: None,
            pool,
        };
        packet.verify();
        packet
    }

    /// Unlink the chain and hand its segments over, leaving an empty husk.
    pub(crate) fn into_segments(mut self) -> Vec<Box<Segment>> {
        let segments = unlink(self.head.take());
        self.len = 0;
        self.segment_count = 0;
        segments
    }

    /// Payload bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Segments in the chain. Zero once released.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Whether the segments have been returned to the pool.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.head.is_none()
    }

    /// Identifier of the pool the segments came from.
    #[inline]
    pub fn pool_id(&self) -> u32 {
        self.pool.id
    }

    /// Payload bytes that fit without extending the chain.
    pub fn available(&self) -> usize {
        self.segments()
            .skip(self.write_index)
            .map(Segment::remaining)
            .sum()
    }

    /// Fragment tag, if this packet is a fragment.
    #[inline]
    pub fn fragment_info(&self) -> Option<FragmentInfo> {
        self.fragment
    }

    #[inline]
    pub(crate) fn set_fragment_info(&mut self, info: Option<FragmentInfo>) {
        self.fragment = info;
    }

    /// The first segment, where link framing goes.
    #[inline]
    pub fn first_segment(&self) -> Option<&Segment> {
        self.head.as_deref()
    }

    #[inline]
    pub fn first_segment_mut(&mut self) -> Option<&mut Segment> {
        self.head.as_deref_mut()
    }

    /// Iterate the chain in order.
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            cursor: self.head.as_deref(),
        }
    }

    /// Iterate the non-empty payload slices in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.segments().map(Segment::payload).filter(|p| !p.is_empty())
    }

    /// Visit every segment mutably, in order.
    ///
    /// Lets a link driver fill per-segment header and trailer reserves.
    pub fn for_each_segment_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Segment),
    {
        let mut cursor = self.head.as_deref_mut();
        while let Some(segment) = cursor {
            f(segment);
            cursor = segment.next_mut();
        }
    }

    /// Payload slices covering `len` bytes starting at `offset`.
    ///
    /// The range is clamped to the end of the packet.
    pub fn slices(&self, offset: usize, len: usize) -> impl Iterator<Item = &[u8]> {
        let end = offset.saturating_add(len).min(self.len);
        let mut position = 0;
        self.segments().filter_map(move |segment| {
            let payload = segment.payload();
            let start = position;
            position += payload.len();
            if position <= offset || start >= end {
                return None;
            }
            let from = offset.saturating_sub(start);
            let to = payload.len().min(end - start);
            Some(&payload[from..to])
        })
    }

    /// Copy the payload into `dest`. Returns the bytes copied.
    pub fn copy_to(&self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in self.chunks() {
            let n = chunk.len().min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            if copied == dest.len() {
                break;
            }
        }
        copied
    }

    /// Copy payload starting at `offset` into `dest`.
    ///
    /// Returns the bytes copied, which is short only at the end of the
    /// packet. An offset past the end is an error.
    pub fn read_at(&self, offset: usize, dest: &mut [u8]) -> Result<usize> {
        if self.is_released() {
            return Err(BufferError::Released);
        }
        if offset > self.len {
            return Err(BufferError::OutOfBounds {
                offset,
                len: self.len,
            });
        }
        let mut copied = 0;
        for slice in self.slices(offset, dest.len()) {
            dest[copied..copied + slice.len()].copy_from_slice(slice);
            copied += slice.len();
        }
        Ok(copied)
    }

    /// The whole payload as one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Append `bytes` after the current payload.
    ///
    /// Segments already in the chain are filled first. If more room is
    /// needed and chaining is enabled, the extra segments are taken from the
    /// pool in one step; if they cannot all be had, nothing is written.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_released() {
            return Err(BufferError::Released);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let available = self.available();
        if bytes.len() > available {
            let max_payload = self.pool.layout.max_payload;
            if !self.pool.config.chaining {
                PoolCounters::incr(&self.pool.counters.oversized);
                return Err(BufferError::OversizedPacket {
                    requested: self.len + bytes.len(),
                    capacity: max_payload,
                });
            }
            let extra = (bytes.len() - available).div_ceil(max_payload);
            let segments = self.pool.checkout(extra)?;
            self.link_tail(segments);
            tracing::trace!(pool = %self.pool.config.name, extra, "packet chain extended");
        }

        let policy = self.pool.config.fault_policy;
        let declared = self.segment_count;
        let mut index = self.write_index;
        let mut rest = bytes;
        let Some(mut cursor) = self.head.as_deref_mut() else {
            return Err(BufferError::Released);
        };
        for _ in 0..index {
            cursor = match cursor.next_mut() {
                Some(next) => next,
                None => fault::fatal(
                    policy,
                    Violation::ChainLengthMismatch {
                        declared,
                        actual: index,
                    },
                ),
            };
        }
        loop {
            let n = cursor.write(rest);
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
            index += 1;
            cursor = match cursor.next_mut() {
                Some(next) => next,
                None => fault::fatal(
                    policy,
                    Violation::ChainLengthMismatch {
                        declared,
                        actual: index,
                    },
                ),
            };
        }

        self.write_index = index;
        self.len += bytes.len();
        self.verify();
        Ok(())
    }

    /// Return every segment to the pool.
    ///
    /// Releasing twice is reported, not fatal: the second call fails with
    /// [`BufferError::DoubleRelease`] and changes nothing.
    pub fn release(&mut self) -> Result<()> {
        let Some(head) = self.head.take() else {
            PoolCounters::incr(&self.pool.counters.invalid_releases);
            tracing::warn!(pool = %self.pool.config.name, "packet released twice");
            return Err(BufferError::DoubleRelease);
        };

        self.pool.checkin(unlink(Some(head)));
        PoolCounters::incr(&self.pool.counters.releases);
        tracing::trace!(
            pool = %self.pool.config.name,
            len = self.len,
            segments = self.segment_count,
            "packet released"
        );

        self.len = 0;
        self.segment_count = 0;
        self.write_index = 0;
        self.fragment = None;
        Ok(())
    }

    /// Write this packet's fragment header into the tail of the first
    /// segment's header reserve, right before the payload.
    pub fn write_fragment_header(&mut self) -> Result<()> {
        let info = self.fragment.ok_or(BufferError::NotAFragment)?;
        let reserve = self.pool.layout.header_reserve;
        if reserve < FRAGMENT_HEADER_LEN {
            return Err(BufferError::HeaderTooSmall {
                reserve,
                needed: FRAGMENT_HEADER_LEN,
            });
        }
        let header = FragmentHeader::try_from(info)?;
        let endianness = self.pool.config.endianness;
        let segment = self.head.as_deref_mut().ok_or(BufferError::Released)?;
        let zone = segment.header_mut();
        let start = zone.len() - FRAGMENT_HEADER_LEN;
        header.encode(&mut zone[start..], endianness);
        Ok(())
    }

    fn link_tail(&mut self, segments: Vec<Box<Segment>>) {
        let count = segments.len();
        let mut extension: Option<Box<Segment>> = None;
        for mut segment in segments.into_iter().rev() {
            segment.set_next(extension.take());
            extension = Some(segment);
        }

        let policy = self.pool.config.fault_policy;
        let declared = self.segment_count;
        let Some(mut tail) = self.head.as_deref_mut() else {
            self.head = extension;
            self.segment_count = count;
            return;
        };
        let mut walked = 1;
        while tail.has_next() {
            tail = match tail.next_mut() {
                Some(next) => next,
                None => fault::fatal(
                    policy,
                    Violation::ChainLengthMismatch {
                        declared,
                        actual: walked,
                    },
                ),
            };
            walked += 1;
        }
        tail.set_next(extension);
        self.segment_count += count;
    }

    /// Re-check the chain against the recorded length and count.
    ///
    /// Runs only with `error_checking` enabled.
    fn verify(&self) {
        let config = &self.pool.config;
        if !config.error_checking {
            return;
        }
        let max = self.pool.layout.max_payload;
        let mut actual = 0;
        let mut count = 0;
        for segment in self.segments() {
            if segment.len() > max {
                fault::fatal(
                    config.fault_policy,
                    Violation::PayloadOutOfZone {
                        segment: segment.id(),
                        len: segment.len(),
                        max,
                    },
                );
            }
            actual += segment.len();
            count += 1;
        }
        if actual != self.len {
            fault::fatal(
                config.fault_policy,
                Violation::ChainLengthMismatch {
                    declared: self.len,
                    actual,
                },
            );
        }
        if count != self.segment_count {
            fault::fatal(
                config.fault_policy,
                Violation::ChainLengthMismatch {
                    declared: self.segment_count,
                    actual: count,
                },
            );
        }
    }
}

/// Break a chain into unlinked segments, head first.
fn unlink(mut head: Option<Box<Segment>>) -> Vec<Box<Segment>> {
    let mut segments = Vec::new();
    while let Some(mut segment) = head {
        head = segment.take_next();
        segments.push(segment);
    }
    segments
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(head) = self.head.take() {
            self.pool.checkin(unlink(Some(head)));
            PoolCounters::incr(&self.pool.counters.releases);
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("pool", &self.pool.id)
            .field("len", &self.len)
            .field("segments", &self.segment_count)
            .field("fragment", &self.fragment)
            .finish()
    }
}
