//! The segment pool and the packet manager built on it.
//!
//! All segments are allocated when the pool is created. A free list guarded
//! by a mutex hands them out and takes them back; the lock is held only for
//! the pop/push, never while payload bytes are copied. Once checked out, a
//! segment's memory is owned by the [`Packet`] holding it, so reads and writes
//! need no synchronization.
//!
//! Allocation never waits. If the free list is short, the request fails with
//! [`BufferError::PoolExhausted`] and no segment changes hands.

use crate::builder::PacketPoolBuilder;
use crate::config::{BufferConfig, Layout};
use crate::error::{BufferError, ConfigError, Result};
use crate::fault::{self, Violation};
use crate::fragment::{FragmentHeader, Fragmenter, FRAGMENT_HEADER_LEN};
use crate::packet::Packet;
use crate::reassembly::Reassembler;
use crate::segment::Segment;
use crate::stats::{PoolCounters, PoolInfo};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

/// Free list state.
struct FreeList {
    segments: VecDeque<Box<Segment>>,
    /// Indexed by segment id; true while the segment is held by a packet.
    checked_out: Vec<bool>,
}

/// State shared by a pool handle and every packet it has handed out.
pub(crate) struct PoolShared {
    pub(crate) id: u32,
    pub(crate) config: BufferConfig,
    pub(crate) layout: Layout,
    free: Mutex<FreeList>,
    pub(crate) counters: PoolCounters,
    next_datagram: AtomicU32,
}

impl PoolShared {
    /// Check out exactly `count` segments, or none.
    pub(crate) fn checkout(&self, count: usize) -> Result<Vec<Box<Segment>>> {
        let mut free = self.free.lock();
        let available = free.segments.len();
        if available < count {
            drop(free);
            PoolCounters::incr(&self.counters.empty_requests);
            tracing::warn!(
                pool = %self.config.name,
                needed = count,
                free = available,
                "packet pool exhausted"
            );
            return Err(BufferError::PoolExhausted {
                needed: count,
                free: available,
            });
        }

        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(segment) = free.segments.pop_front() {
                free.checked_out[segment.id() as usize] = true;
                segments.push(segment);
            }
        }
        drop(free);

        tracing::trace!(pool = %self.config.name, count, "segments checked out");
        Ok(segments)
    }

    /// Return unlinked segments to the free list.
    ///
    /// A segment from another pool, one that still owns a link, or one the
    /// free list already holds is a fatal violation.
    pub(crate) fn checkin(&self, segments: Vec<Box<Segment>>) {
        let policy = self.config.fault_policy;
        for segment in &segments {
            if segment.pool_id() != self.id {
                fault::fatal(
                    policy,
                    Violation::ForeignSegment {
                        pool: self.id,
                        owner: segment.pool_id(),
                        segment: segment.id(),
                    },
                );
            }
            if segment.has_next() {
                fault::fatal(
                    policy,
                    Violation::SegmentStillLinked {
                        pool: self.id,
                        segment: segment.id(),
                    },
                );
            }
        }

        let count = segments.len();
        let mut free = self.free.lock();
        for mut segment in segments {
            let slot = segment.id() as usize;
            if !free.checked_out[slot] {
                drop(free);
                fault::fatal(
                    policy,
                    Violation::SegmentAlreadyFree {
                        pool: self.id,
                        segment: segment.id(),
                    },
                );
            }
            free.checked_out[slot] = false;
            segment.clear();
            free.segments.push_back(segment);
        }
        drop(free);

        tracing::trace!(pool = %self.config.name, count, "segments checked in");
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().segments.len()
    }

    pub(crate) fn next_datagram_id(&self) -> u32 {
        self.next_datagram.fetch_add(1, Ordering::Relaxed)
    }
}

/// A pool of fixed-size segments and the operations that build packets from
/// them.
///
/// Cloning the handle is cheap and shares the same pool, so one pool can be
/// used from several interface threads at once.
///
/// # Example
///
/// ```
/// use packet_buffer::{BufferConfig, PacketPool};
///
/// let pool = PacketPool::new(BufferConfig::default()).unwrap();
/// let mut packet = pool.allocate(3000).unwrap();
/// assert_eq!(packet.segment_count(), 3);
///
/// pool.append(&mut packet, b"hello").unwrap();
/// pool.release(&mut packet).unwrap();
/// assert_eq!(pool.free_count(), pool.segment_count());
/// ```
#[derive(Clone)]
pub struct PacketPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl PacketPool {
    /// Create a pool, allocating every segment up front.
    pub fn new(config: BufferConfig) -> std::result::Result<Self, ConfigError> {
        let layout = config.validate()?;
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let alignment = config.alignment.unwrap_or(1);

        let segments: VecDeque<Box<Segment>> = (0..config.segment_count)
            .map(|i| Segment::new(id, i as u16, layout, alignment))
            .collect();
        let checked_out = vec![false; config.segment_count];

        tracing::debug!(
            pool = %config.name,
            id,
            segments = config.segment_count,
            capacity = layout.capacity,
            header = layout.header_reserve,
            trailer = layout.trailer_reserve,
            payload = layout.max_payload,
            chaining = config.chaining,
            fragmentation = config.fragmentation,
            "packet pool created"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                config,
                layout,
                free: Mutex::new(FreeList {
                    segments,
                    checked_out,
                }),
                counters: PoolCounters::default(),
                next_datagram: AtomicU32::new(1),
            }),
        })
    }

    /// Start building a pool from the default configuration.
    pub fn builder() -> PacketPoolBuilder {
        PacketPoolBuilder::new()
    }

    /// Process-unique pool identifier.
    #[inline]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    #[inline]
    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.shared.layout
    }

    /// Usable payload bytes per segment.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.shared.layout.max_payload
    }

    /// Total number of segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.shared.config.segment_count
    }

    /// Segments currently on the free list.
    pub fn free_count(&self) -> usize {
        self.shared.free_count()
    }

    /// Snapshot of pool state and counters.
    pub fn info(&self) -> PoolInfo {
        PoolInfo::capture(
            &self.shared.config.name,
            self.segment_count(),
            self.free_count(),
            &self.shared.counters,
        )
    }

    /// Allocate an empty packet with room for `len` payload bytes.
    ///
    /// The packet takes the fewest segments that cover `len` (at least one).
    /// Without chaining, anything above one segment's payload fails with
    /// [`BufferError::OversizedPacket`]. Either every segment is taken or
    /// none is.
    pub fn allocate(&self, len: usize) -> Result<Packet> {
        let shared = &self.shared;
        let needed = shared.layout.segments_for(len);

        if needed > 1 && !shared.config.chaining {
            PoolCounters::incr(&shared.counters.oversized);
            return Err(BufferError::OversizedPacket {
                requested: len,
                capacity: shared.layout.max_payload,
            });
        }

        let segments = shared.checkout(needed)?;
        PoolCounters::incr(&shared.counters.allocations);
        tracing::debug!(pool = %shared.config.name, len, segments = needed, "packet allocated");

        Ok(Packet::from_segments(Arc::clone(shared), segments))
    }

    /// Allocate a packet holding a copy of `bytes`.
    pub fn packet_from(&self, bytes: &[u8]) -> Result<Packet> {
        let mut packet = self.allocate(bytes.len())?;
        packet.append(bytes)?;
        Ok(packet)
    }

    /// Append `bytes` to a packet, extending its chain if needed.
    pub fn append(&self, packet: &mut Packet, bytes: &[u8]) -> Result<()> {
        packet.append(bytes)
    }

    /// Return every segment of `packet` to its pool.
    pub fn release(&self, packet: &mut Packet) -> Result<()> {
        packet.release()
    }

    /// Copy a packet (payload and fragment tag) into this pool.
    ///
    /// Used to hand a packet from one interface's pool to another's.
    pub fn copy_packet(&self, packet: &Packet) -> Result<Packet> {
        if packet.is_released() {
            return Err(BufferError::Released);
        }
        let mut copy = self.allocate(packet.len())?;
        for chunk in packet.chunks() {
            copy.append(chunk)?;
        }
        copy.set_fragment_info(packet.fragment_info());
        Ok(copy)
    }

    /// Split `packet` into fragments of at most `mtu` payload bytes.
    ///
    /// Fragments are produced lazily from this pool as the returned iterator
    /// is advanced. A packet that already fits yields a single fragment.
    pub fn fragment_for_link<'a>(&'a self, packet: &'a Packet, mtu: usize) -> Result<Fragmenter<'a>> {
        if mtu == 0 {
            return Err(BufferError::InvalidMtu(mtu));
        }
        if packet.is_released() {
            return Err(BufferError::Released);
        }
        if packet.len() > mtu && !self.shared.config.fragmentation {
            return Err(BufferError::FragmentationDisabled {
                len: packet.len(),
                mtu,
            });
        }

        let fragment_len = if self.shared.config.chaining {
            mtu
        } else {
            mtu.min(self.shared.layout.max_payload)
        };
        let datagram_id = self.shared.next_datagram_id();

        tracing::debug!(
            pool = %self.shared.config.name,
            datagram_id,
            len = packet.len(),
            mtu,
            "fragmenting packet"
        );

        Ok(Fragmenter::new(self, packet, datagram_id, fragment_len))
    }

    /// Reassemble one datagram from fragments in arrival order.
    ///
    /// Fails with [`BufferError::ReassemblyTimeout`] when `deadline` passes, or
    /// the sequence ends, before the datagram is complete. Fragments left in
    /// the sequence after completion are released.
    pub fn reassemble<I>(&self, fragments: I, deadline: Instant) -> Result<Packet>
    where
        I: IntoIterator<Item = Packet>,
    {
        let mut reassembler = Reassembler::new(self.clone());
        let mut last_id = 0;

        for fragment in fragments {
            let now = Instant::now();
            if let Some(info) = fragment.fragment_info() {
                last_id = info.datagram_id;
            }
            if now >= deadline {
                PoolCounters::incr(&self.shared.counters.reassembly_timeouts);
                tracing::warn!(datagram_id = last_id, "reassembly deadline passed");
                return Err(BufferError::ReassemblyTimeout {
                    datagram_id: last_id,
                });
            }
            if let Some(packet) = reassembler.push_until(fragment, now, deadline)? {
                return Ok(packet);
            }
        }

        PoolCounters::incr(&self.shared.counters.reassembly_timeouts);
        tracing::warn!(datagram_id = last_id, "fragment sequence ended before reassembly");
        Err(BufferError::ReassemblyTimeout {
            datagram_id: last_id,
        })
    }

    /// Build a tagged fragment packet from a received link frame.
    ///
    /// The frame starts with a fragment header followed by the payload.
    pub fn receive_frame(&self, frame: &[u8]) -> Result<Packet> {
        let header = FragmentHeader::decode(frame, self.shared.config.endianness)?;
        let mut packet = self.packet_from(&frame[FRAGMENT_HEADER_LEN..])?;
        packet.set_fragment_info(Some(header.into()));
        Ok(packet)
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("id", &self.shared.id)
            .field("name", &self.shared.config.name)
            .field("layout", &self.shared.layout)
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultPolicy;

    fn pool(chaining: bool, segments: usize) -> PacketPool {
        PacketPool::new(BufferConfig {
            segment_count: segments,
            chaining,
            error_checking: true,
            fault_policy: FaultPolicy::Panic,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_allocate_3000_chained() {
        let pool = pool(true, 8);
        let mut packet = pool.allocate(3000).unwrap();

        assert_eq!(packet.segment_count(), 3);
        assert!(packet.segments().all(|s| s.capacity() == 1492));
        assert_eq!(pool.free_count(), 5);

        pool.release(&mut packet).unwrap();
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_allocate_3000_unchained() {
        let pool = pool(false, 8);
        assert_eq!(
            pool.allocate(3000).unwrap_err(),
            BufferError::OversizedPacket {
                requested: 3000,
                capacity: 1492
            }
        );
        assert_eq!(pool.free_count(), 8);
        assert_eq!(pool.info().oversized, 1);
    }

    #[test]
    fn test_allocate_zero_takes_one_segment() {
        let pool = pool(true, 2);
        let packet = pool.allocate(0).unwrap();
        assert_eq!(packet.segment_count(), 1);
        assert!(packet.is_empty());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_exhaustion_is_all_or_nothing() {
        let pool = pool(true, 4);
        let _held = pool.allocate(1492 * 2).unwrap();
        assert_eq!(pool.free_count(), 2);

        assert_eq!(
            pool.allocate(1492 * 3).unwrap_err(),
            BufferError::PoolExhausted { needed: 3, free: 2 }
        );
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.info().empty_requests, 1);
    }

    #[test]
    fn test_drop_returns_segments() {
        let pool = pool(true, 4);
        {
            let _packet = pool.allocate(4000).unwrap();
            assert_eq!(pool.free_count(), 1);
        }
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.info().releases, 1);
    }

    #[test]
    fn test_copy_packet_between_pools() {
        let rx = PacketPool::builder().name("rx").segment_count(4).build().unwrap();
        let tx = PacketPool::builder()
            .name("tx")
            .segment_count(4)
            .header_reserve(16)
            .build()
            .unwrap();

        let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let packet = rx.packet_from(&data).unwrap();
        let copy = tx.copy_packet(&packet).unwrap();

        assert_eq!(copy.pool_id(), tx.id());
        assert_eq!(copy.to_vec(), data);
        assert_eq!(copy.segment_count(), 2);
        assert_eq!(tx.free_count(), 2);
        assert_eq!(rx.free_count(), 2);
    }

    #[test]
    fn test_fragment_for_link_rejects_zero_mtu() {
        let pool = pool(true, 4);
        let packet = pool.packet_from(b"abc").unwrap();
        assert_eq!(
            pool.fragment_for_link(&packet, 0).unwrap_err(),
            BufferError::InvalidMtu(0)
        );
    }

    #[test]
    fn test_fragmentation_disabled() {
        let pool = PacketPool::builder()
            .segment_count(4)
            .fragmentation(false)
            .build()
            .unwrap();
        let packet = pool.packet_from(&[7u8; 600]).unwrap();

        assert_eq!(
            pool.fragment_for_link(&packet, 576).unwrap_err(),
            BufferError::FragmentationDisabled { len: 600, mtu: 576 }
        );

        // Fits the link: passes through as one fragment.
        let fragments: Vec<_> = pool
            .fragment_for_link(&packet, 1500)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].to_vec(), vec![7u8; 600]);
    }

    #[test]
    fn test_info_counts() {
        let pool = pool(true, 4);
        let mut a = pool.allocate(10).unwrap();
        let mut b = pool.allocate(10).unwrap();
        a.release().unwrap();
        b.release().unwrap();
        assert_eq!(b.release(), Err(BufferError::DoubleRelease));

        let info = pool.info();
        assert_eq!(info.total_segments, 4);
        assert_eq!(info.free_segments, 4);
        assert_eq!(info.allocations, 2);
        assert_eq!(info.releases, 2);
        assert_eq!(info.invalid_releases, 1);
    }

    #[test]
    #[should_panic(expected = "belongs to pool")]
    fn test_foreign_segment_is_fatal() {
        let a = pool(true, 2);
        let b = pool(true, 2);
        let segments = a.shared.checkout(1).unwrap();
        b.shared.checkin(segments);
    }

    #[test]
    #[should_panic(expected = "still linked")]
    fn test_linked_segment_is_fatal() {
        let pool = pool(true, 2);
        let mut segments = pool.shared.checkout(2).unwrap();
        let tail = segments.pop().unwrap();
        segments[0].set_next(Some(tail));
        pool.shared.checkin(segments);
    }
}
