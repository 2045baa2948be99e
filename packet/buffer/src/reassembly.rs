//! Reassembly of fragmented datagrams.
//!
//! A [`Reassembler`] keeps one entry per datagram id. Fragments may arrive in
//! any order; each is held (as the packet it arrived in) until the set covers
//! the whole datagram, at which point the held packets are joined into one.
//!
//! With chaining enabled the join is a splice: the fragments' segments are
//! relinked into a single chain and no payload is copied. Without chaining the
//! payloads are copied into the first fragment's segment, so the datagram must
//! fit one segment.
//!
//! Each datagram's clock starts with its first fragment. Entries past their
//! deadline are dropped, with their segments, by [`Reassembler::expire`] or on
//! the next fragment for that datagram.

use crate::config::ReassemblyConfig;
use crate::error::{BufferError, Result};
use crate::fragment::FragmentInfo;
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::stats::PoolCounters;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Fragments held for one datagram, keyed by offset.
struct Partial {
    deadline: Instant,
    fragments: BTreeMap<usize, Packet>,
    received: usize,
    /// End of the contiguous run of held bytes starting at offset 0.
    prefix_end: usize,
    /// Held fragments not joined to that run. Only these count toward the
    /// hold limit.
    detached: usize,
    /// Datagram length, known once the last fragment arrives.
    total: Option<usize>,
}

impl Partial {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            fragments: BTreeMap::new(),
            received: 0,
            prefix_end: 0,
            detached: 0,
            total: None,
        }
    }

    fn insert(&mut self, info: FragmentInfo, fragment: Packet, hold_limit: usize) -> Result<()> {
        let datagram_id = info.datagram_id;
        let offset = info.offset;
        let len = fragment.len();
        let end = offset + len;

        let overlaps = self.fragments.contains_key(&offset)
            || self
                .fragments
                .range(..end)
                .next_back()
                .is_some_and(|(&start, held)| start + held.len() > offset);
        if overlaps {
            return Err(BufferError::Overlap {
                datagram_id,
                offset,
                len,
            });
        }

        let invalid = BufferError::InvalidFragment {
            datagram_id,
            offset,
        };
        if info.more_fragments {
            if self.total.is_some_and(|total| end > total) {
                return Err(invalid);
            }
        } else {
            if self.total.is_some_and(|total| total != end) {
                return Err(invalid);
            }
            let beyond = self
                .fragments
                .last_key_value()
                .is_some_and(|(&start, held)| start + held.len() > end);
            if beyond {
                return Err(invalid);
            }
        }

        let joins_prefix = offset == self.prefix_end;
        if !joins_prefix && self.detached >= hold_limit {
            return Err(BufferError::HoldLimitExceeded {
                datagram_id,
                limit: hold_limit,
            });
        }

        if joins_prefix {
            let mut cursor = end;
            for (&start, held) in self.fragments.range(end..) {
                if start != cursor {
                    break;
                }
                cursor += held.len();
                self.detached -= 1;
            }
            self.prefix_end = cursor;
        } else {
            self.detached += 1;
        }
        if !info.more_fragments {
            self.total = Some(end);
        }
        self.received += len;
        self.fragments.insert(offset, fragment);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.total == Some(self.received)
    }
}

/// Reassembles datagrams from fragments in any order.
pub struct Reassembler {
    pool: PacketPool,
    config: ReassemblyConfig,
    pending: HashMap<u32, Partial>,
}

impl Reassembler {
    /// Create a reassembler that builds datagrams in `pool`, using the
    /// pool's reassembly limits.
    pub fn new(pool: PacketPool) -> Self {
        let config = pool.config().reassembly.clone();
        Self {
            pool,
            config,
            pending: HashMap::new(),
        }
    }

    /// Datagrams currently incomplete.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Fragments held for `datagram_id`.
    pub fn held(&self, datagram_id: u32) -> usize {
        self.pending
            .get(&datagram_id)
            .map_or(0, |partial| partial.fragments.len())
    }

    /// Earliest deadline among incomplete datagrams.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|partial| partial.deadline).min()
    }

    /// Accept one fragment that arrived at `now`.
    ///
    /// Returns the datagram once its last missing fragment arrives. A
    /// fragment that overlaps held data, breaks the datagram's bounds, or
    /// exceeds the hold limit discards that datagram (all of its held
    /// fragments are released); other datagrams are unaffected.
    pub fn push(&mut self, fragment: Packet, now: Instant) -> Result<Option<Packet>> {
        let deadline = now + self.config.timeout;
        self.push_until(fragment, now, deadline)
    }

    /// Like [`Reassembler::push`], with an explicit deadline for a datagram
    /// not seen before.
    pub(crate) fn push_until(
        &mut self,
        fragment: Packet,
        now: Instant,
        deadline: Instant,
    ) -> Result<Option<Packet>> {
        let info = fragment.fragment_info().ok_or(BufferError::NotAFragment)?;
        let datagram_id = info.datagram_id;
        // Make room for a new datagram by dropping ones already past due.
        if !self.pending.contains_key(&datagram_id)
            && self.pending.len() >= self.config.max_datagrams
        {
            self.expire(now);
        }

        let counters = &self.pool.shared.counters;
        match self.pending.get(&datagram_id) {
            Some(partial) if now >= partial.deadline => {
                self.pending.remove(&datagram_id);
                PoolCounters::incr(&counters.reassembly_timeouts);
                tracing::warn!(datagram_id, "reassembly timed out");
                return Err(BufferError::ReassemblyTimeout { datagram_id });
            }
            Some(_) => {}
            None if self.pending.len() >= self.config.max_datagrams => {
                tracing::warn!(
                    datagram_id,
                    limit = self.config.max_datagrams,
                    "reassembly table full"
                );
                return Err(BufferError::TooManyDatagrams {
                    limit: self.config.max_datagrams,
                });
            }
            None => {}
        }

        let partial = self
            .pending
            .entry(datagram_id)
            .or_insert_with(|| Partial::new(deadline));

        if let Err(e) = partial.insert(info, fragment, self.config.hold_limit) {
            self.pending.remove(&datagram_id);
            if matches!(e, BufferError::Overlap { .. }) {
                PoolCounters::incr(&counters.overlaps);
            }
            tracing::warn!(datagram_id, error = %e, "datagram discarded");
            return Err(e);
        }
        tracing::trace!(
            datagram_id,
            offset = info.offset,
            held = partial.fragments.len(),
            "fragment held"
        );

        if !partial.is_complete() {
            return Ok(None);
        }
        match self.pending.remove(&datagram_id) {
            Some(partial) => self.assemble(datagram_id, partial).map(Some),
            None => Ok(None),
        }
    }

    /// Drop every datagram whose deadline is at or before `now`.
    ///
    /// Returns the expired datagram ids in ascending order.
    pub fn expire(&mut self, now: Instant) -> Vec<u32> {
        let mut expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, partial)| now >= partial.deadline)
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();

        for datagram_id in &expired {
            self.pending.remove(datagram_id);
            PoolCounters::incr(&self.pool.shared.counters.reassembly_timeouts);
            tracing::warn!(datagram_id, "reassembly timed out");
        }
        expired
    }

    /// Drop every incomplete datagram.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn assemble(&self, datagram_id: u32, partial: Partial) -> Result<Packet> {
        let count = partial.fragments.len();
        let total = partial.received;
        let same_pool = partial
            .fragments
            .values()
            .all(|fragment| fragment.pool_id() == self.pool.id());

        let packet = if self.pool.config().chaining && same_pool {
            self.splice(partial)
        } else {
            self.copy(partial, total, same_pool)?
        };

        PoolCounters::incr(&self.pool.shared.counters.reassembled);
        tracing::debug!(datagram_id, len = total, fragments = count, "datagram reassembled");
        Ok(packet)
    }

    /// Relink the fragments' segments into one chain.
    fn splice(&self, partial: Partial) -> Packet {
        let mut segments = Vec::new();
        let mut spare = Vec::new();
        for fragment in partial.fragments.into_values() {
            for segment in fragment.into_segments() {
                if segment.is_empty() {
                    spare.push(segment);
                } else {
                    segments.push(segment);
                }
            }
        }
        if segments.is_empty() {
            segments.extend(spare.pop());
        }
        if !spare.is_empty() {
            self.pool.shared.checkin(spare);
        }
        Packet::from_segments(Arc::clone(&self.pool.shared), segments)
    }

    /// Copy the fragments' payloads into a single packet.
    ///
    /// Fragments from this pool reuse the first fragment's segments; others
    /// are copied into a fresh packet.
    fn copy(&self, partial: Partial, total: usize, same_pool: bool) -> Result<Packet> {
        let mut fragments = partial.fragments.into_values();

        let mut packet = match (same_pool, fragments.next()) {
            (true, Some(mut first)) => {
                first.set_fragment_info(None);
                first
            }
            (false, Some(first)) => {
                let mut packet = self.pool.allocate(total)?;
                for chunk in first.chunks() {
                    packet.append(chunk)?;
                }
                packet
            }
            (_, None) => self.pool.allocate(0)?,
        };
        for fragment in fragments {
            for chunk in fragment.chunks() {
                packet.append(chunk)?;
            }
        }
        Ok(packet)
    }
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("pool", &self.pool.id())
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::fault::FaultPolicy;
    use std::time::Duration;

    fn pool(chaining: bool) -> PacketPool {
        PacketPool::new(BufferConfig {
            segment_capacity: 128,
            segment_count: 64,
            header_reserve: 16,
            chaining,
            error_checking: true,
            fault_policy: FaultPolicy::Panic,
            ..Default::default()
        })
        .unwrap()
    }

    fn fragment(pool: &PacketPool, id: u32, offset: usize, data: &[u8], more: bool) -> Packet {
        let mut packet = pool.packet_from(data).unwrap();
        packet.set_fragment_info(Some(FragmentInfo {
            datagram_id: id,
            offset,
            more_fragments: more,
        }));
        packet
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_out_of_order_splice() {
        let pool = pool(true);
        let data = pattern(500);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        assert!(r.push(fragment(&pool, 7, 400, &data[400..], false), now).unwrap().is_none());
        assert!(r.push(fragment(&pool, 7, 0, &data[..200], true), now).unwrap().is_none());
        assert_eq!(r.held(7), 2);
        let packet = r
            .push(fragment(&pool, 7, 200, &data[200..400], true), now)
            .unwrap()
            .unwrap();

        assert_eq!(packet.len(), 500);
        assert_eq!(packet.to_vec(), data);
        assert_eq!(packet.fragment_info(), None);
        assert_eq!(r.in_flight(), 0);
        // 200 -> 2 segments, 200 -> 2, 100 -> 1
        assert_eq!(packet.segment_count(), 5);

        drop(packet);
        assert_eq!(pool.free_count(), 64);
        assert_eq!(pool.info().reassembled, 1);
    }

    #[test]
    fn test_overlap_discards_only_that_datagram() {
        let pool = pool(true);
        let data = pattern(300);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 0, &data[..150], true), now).unwrap();
        r.push(fragment(&pool, 2, 0, &data[..100], true), now).unwrap();

        let err = r
            .push(fragment(&pool, 1, 100, &data[100..200], true), now)
            .unwrap_err();
        assert_eq!(
            err,
            BufferError::Overlap {
                datagram_id: 1,
                offset: 100,
                len: 100
            }
        );
        assert_eq!(r.held(1), 0);
        assert_eq!(r.held(2), 1);

        let packet = r
            .push(fragment(&pool, 2, 100, &data[100..300], false), now)
            .unwrap()
            .unwrap();
        assert_eq!(packet.to_vec(), data);
        assert_eq!(pool.info().overlaps, 1);
    }

    #[test]
    fn test_duplicate_is_overlap() {
        let pool = pool(true);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 3, 0, b"abcd", true), now).unwrap();
        assert!(matches!(
            r.push(fragment(&pool, 3, 0, b"abcd", true), now),
            Err(BufferError::Overlap { .. })
        ));
        assert_eq!(r.in_flight(), 0);
        assert_eq!(pool.free_count(), 64);
    }

    #[test]
    fn test_timeout_on_late_fragment() {
        let pool = pool(true);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 9, 0, b"head", true), now).unwrap();
        let late = now + pool.config().reassembly.timeout;
        assert_eq!(
            r.push(fragment(&pool, 9, 4, b"tail", false), late).unwrap_err(),
            BufferError::ReassemblyTimeout { datagram_id: 9 }
        );
        assert_eq!(r.in_flight(), 0);
        assert_eq!(pool.free_count(), 64);
        assert_eq!(pool.info().reassembly_timeouts, 1);
    }

    #[test]
    fn test_expire() {
        let pool = PacketPool::builder()
            .segment_count(8)
            .reassembly_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 5, 0, b"a", true), now).unwrap();
        r.push(fragment(&pool, 4, 0, b"b", true), now + Duration::from_millis(50)).unwrap();
        assert_eq!(r.next_deadline(), Some(now + Duration::from_millis(100)));

        assert!(r.expire(now + Duration::from_millis(99)).is_empty());
        assert_eq!(r.expire(now + Duration::from_millis(100)), vec![5]);
        assert_eq!(r.expire(now + Duration::from_secs(1)), vec![4]);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_hold_limit() {
        let pool = PacketPool::builder()
            .segment_count(16)
            .hold_limit(2)
            .build()
            .unwrap();
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 0, b"aa", true), now).unwrap();
        r.push(fragment(&pool, 1, 4, b"cc", true), now).unwrap();
        r.push(fragment(&pool, 1, 8, b"ee", true), now).unwrap();
        assert_eq!(
            r.push(fragment(&pool, 1, 12, b"gg", true), now).unwrap_err(),
            BufferError::HoldLimitExceeded {
                datagram_id: 1,
                limit: 2
            }
        );
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn test_in_order_fragments_ignore_hold_limit() {
        let pool = PacketPool::builder()
            .segment_count(64)
            .hold_limit(2)
            .build()
            .unwrap();
        let data = pattern(40);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        for i in 0..39 {
            let out = r.push(fragment(&pool, 1, i, &data[i..i + 1], true), now).unwrap();
            assert!(out.is_none());
        }
        assert_eq!(r.held(1), 39);
        let packet = r
            .push(fragment(&pool, 1, 39, &data[39..], false), now)
            .unwrap()
            .unwrap();
        assert_eq!(packet.to_vec(), data);
    }

    #[test]
    fn test_gap_fill_frees_hold_slots() {
        let pool = PacketPool::builder()
            .segment_count(16)
            .hold_limit(2)
            .build()
            .unwrap();
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 2, b"cc", true), now).unwrap();
        r.push(fragment(&pool, 1, 6, b"ee", true), now).unwrap();
        // Joins the prefix and pulls in the fragment at 2.
        r.push(fragment(&pool, 1, 0, b"aa", true), now).unwrap();
        r.push(fragment(&pool, 1, 10, b"gg", true), now).unwrap();
        r.push(fragment(&pool, 1, 4, b"dd", true), now).unwrap();
        r.push(fragment(&pool, 1, 8, b"ff", true), now).unwrap();
        let packet = r
            .push(fragment(&pool, 1, 12, b"h", false), now)
            .unwrap()
            .unwrap();
        assert_eq!(packet.to_vec(), b"aaccddeeffggh");
    }

    #[test]
    fn test_too_many_datagrams() {
        let pool = PacketPool::builder()
            .segment_count(16)
            .max_datagrams(2)
            .build()
            .unwrap();
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 0, b"a", true), now).unwrap();
        r.push(fragment(&pool, 2, 0, b"a", true), now).unwrap();
        assert_eq!(
            r.push(fragment(&pool, 3, 0, b"a", true), now).unwrap_err(),
            BufferError::TooManyDatagrams { limit: 2 }
        );
        // Known datagrams still accepted.
        assert!(r.push(fragment(&pool, 1, 1, b"b", false), now).unwrap().is_some());
    }

    #[test]
    fn test_expired_datagrams_make_room() {
        let pool = PacketPool::builder()
            .segment_count(16)
            .max_datagrams(2)
            .reassembly_timeout(Duration::from_millis(100))
            .build()
            .unwrap();
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 0, b"a", true), now).unwrap();
        r.push(fragment(&pool, 2, 0, b"a", true), now).unwrap();

        let later = now + Duration::from_millis(100);
        r.push(fragment(&pool, 3, 0, b"a", true), later).unwrap();
        assert_eq!(r.in_flight(), 1);
        assert_eq!(r.held(3), 1);
        assert_eq!(pool.info().reassembly_timeouts, 2);
        assert_eq!(pool.free_count(), 15);
    }

    #[test]
    fn test_not_a_fragment() {
        let pool = pool(true);
        let mut r = Reassembler::new(pool.clone());
        let packet = pool.packet_from(b"plain").unwrap();
        assert_eq!(
            r.push(packet, Instant::now()).unwrap_err(),
            BufferError::NotAFragment
        );
        assert_eq!(pool.free_count(), 64);
    }

    #[test]
    fn test_fragment_past_terminal_is_invalid() {
        let pool = pool(true);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 0, b"abcd", false), now).unwrap();
        // A single terminal fragment completes immediately; start another.
        r.push(fragment(&pool, 2, 4, b"efgh", false), now).unwrap();
        assert_eq!(
            r.push(fragment(&pool, 2, 8, b"ij", true), now).unwrap_err(),
            BufferError::InvalidFragment {
                datagram_id: 2,
                offset: 8
            }
        );
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn test_copy_without_chaining() {
        let pool = pool(false);
        let data = pattern(100);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 60, &data[60..], false), now).unwrap();
        r.push(fragment(&pool, 1, 30, &data[30..60], true), now).unwrap();
        let packet = r
            .push(fragment(&pool, 1, 0, &data[..30], true), now)
            .unwrap()
            .unwrap();

        assert_eq!(packet.segment_count(), 1);
        assert_eq!(packet.to_vec(), data);
        drop(packet);
        assert_eq!(pool.free_count(), 64);
    }

    #[test]
    fn test_unchained_datagram_too_large() {
        let pool = pool(false);
        let data = pattern(200);
        let now = Instant::now();
        let mut r = Reassembler::new(pool.clone());

        r.push(fragment(&pool, 1, 0, &data[..100], true), now).unwrap();
        assert!(matches!(
            r.push(fragment(&pool, 1, 100, &data[100..], false), now),
            Err(BufferError::OversizedPacket { .. })
        ));
        assert_eq!(pool.free_count(), 64);
    }

    #[test]
    fn test_fragments_from_another_pool_are_copied() {
        let rx = pool(true);
        let other = pool(true);
        let data = pattern(250);
        let now = Instant::now();
        let mut r = Reassembler::new(rx.clone());

        r.push(fragment(&other, 1, 0, &data[..125], true), now).unwrap();
        let packet = r
            .push(fragment(&rx, 1, 125, &data[125..], false), now)
            .unwrap()
            .unwrap();

        assert_eq!(packet.pool_id(), rx.id());
        assert_eq!(packet.to_vec(), data);
        drop(packet);
        assert_eq!(rx.free_count(), 64);
        assert_eq!(other.free_count(), 64);
    }
}
