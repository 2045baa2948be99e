//! Fragment and reassemble round trips through the public API.
//!
//! These tests cover arrival orders, link sizes and pool settings together,
//! and check that every segment finds its way back to the pool.

use packet_buffer::{
    BufferConfig, BufferError, Endianness, FRAGMENT_HEADER_LEN, FaultPolicy, Packet, PacketPool,
    ReassemblyConfig, Reassembler, Result,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::{Duration, Instant};

/// Generate a verifiable payload with a position-dependent pattern.
fn generate_payload(size: usize, seed: u8) -> Vec<u8> {
    (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn create_pool(chaining: bool, segment_capacity: usize, segment_count: usize) -> PacketPool {
    PacketPool::new(BufferConfig {
        name: "test".to_string(),
        segment_capacity,
        segment_count,
        header_reserve: 16,
        chaining,
        error_checking: true,
        fault_policy: FaultPolicy::Panic,
        ..Default::default()
    })
    .expect("Failed to create pool")
}

fn fragment_all(pool: &PacketPool, packet: &Packet, mtu: usize) -> Vec<Packet> {
    pool.fragment_for_link(packet, mtu)
        .expect("fragment_for_link failed")
        .collect::<Result<Vec<_>>>()
        .expect("fragment allocation failed")
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn test_round_trip_lengths_and_mtus() {
    for len in [0usize, 1, 239, 240, 241, 1000, 4096, 9000] {
        for mtu in [1, 64, 240, 576, 1500, 20_000] {
            // Source chain, every fragment and the spliced result held at once.
            let segments = 2 * (len.div_ceil(240) + len.div_ceil(mtu)) + 8;
            let pool = create_pool(true, 256, segments);
            let data = generate_payload(len, len as u8);
            let packet = pool.packet_from(&data).unwrap();
            let fragments = fragment_all(&pool, &packet, mtu);

            assert_eq!(fragments.len(), len.div_ceil(mtu).max(1), "len={len} mtu={mtu}");
            assert!(fragments.iter().all(|f| f.len() <= mtu));

            let whole = pool
                .reassemble(fragments, Instant::now() + Duration::from_secs(5))
                .unwrap();
            assert_eq!(whole.len(), len);
            assert_eq!(whole.to_vec(), data, "len={len} mtu={mtu}");

            drop((whole, packet));
            assert_eq!(pool.free_count(), segments, "segments leaked");
        }
    }
}

#[test]
fn test_in_order_round_trip_default_config() {
    let pool = PacketPool::builder().segment_count(512).build().unwrap();
    let data = generate_payload(200, 4);
    let packet = pool.packet_from(&data).unwrap();

    let fragments = fragment_all(&pool, &packet, 1);
    assert_eq!(fragments.len(), 200);
    assert!(fragments.len() > pool.config().reassembly.hold_limit);

    let whole = pool
        .reassemble(fragments, Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(whole.to_vec(), data);
}

#[test]
fn test_shuffled_arrival() {
    // Up to 120 fragments per datagram, all of them possibly out of order.
    let pool = PacketPool::new(BufferConfig {
        segment_capacity: 128,
        segment_count: 1024,
        header_reserve: 16,
        error_checking: true,
        fault_policy: FaultPolicy::Panic,
        reassembly: ReassemblyConfig {
            hold_limit: 128,
            ..Default::default()
        },
        ..Default::default()
    })
    .expect("Failed to create pool");
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5eed);

    for round in 0..50 {
        let len = rng.random_range(1..6000);
        let mtu = rng.random_range(50..700);
        let data = generate_payload(len, round as u8);
        let packet = pool.packet_from(&data).unwrap();

        let mut fragments = fragment_all(&pool, &packet, mtu);
        fragments.shuffle(&mut rng);
        drop(packet);

        let mut reassembler = Reassembler::new(pool.clone());
        let now = Instant::now();
        let mut result = None;
        let count = fragments.len();
        for (i, fragment) in fragments.into_iter().enumerate() {
            let out = reassembler.push(fragment, now).unwrap();
            if i + 1 < count {
                assert!(out.is_none(), "completed early in round {round}");
            } else {
                result = out;
            }
        }

        let whole = result.expect("datagram not completed");
        assert_eq!(whole.to_vec(), data, "round {round}");
        assert_eq!(reassembler.in_flight(), 0);
    }

    assert_eq!(pool.free_count(), 1024);
}

#[test]
fn test_interleaved_datagrams() {
    let pool = create_pool(true, 128, 512);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);

    let payloads: Vec<Vec<u8>> = (0..4).map(|i| generate_payload(700 + i * 300, i as u8)).collect();
    let sources: Vec<Packet> = payloads.iter().map(|p| pool.packet_from(p).unwrap()).collect();

    let mut arrivals = Vec::new();
    let mut ids = Vec::new();
    for source in &sources {
        let fragmenter = pool.fragment_for_link(source, 200).unwrap();
        ids.push(fragmenter.datagram_id());
        arrivals.extend(fragmenter.map(|f| f.unwrap()));
    }
    arrivals.shuffle(&mut rng);

    let mut reassembler = Reassembler::new(pool.clone());
    let now = Instant::now();
    let mut completed = Vec::new();
    for fragment in arrivals {
        if let Some(packet) = reassembler.push(fragment, now).unwrap() {
            completed.push(packet);
        }
    }

    assert_eq!(completed.len(), 4);
    for packet in &completed {
        assert!(payloads.iter().any(|p| *p == packet.to_vec()));
    }
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 4, "datagram ids must differ");
}

#[test]
fn test_round_trip_without_chaining() {
    let pool = create_pool(false, 1536, 64);
    let max = pool.max_payload();
    let data = generate_payload(max, 3);
    let packet = pool.packet_from(&data).unwrap();

    let mut fragments = fragment_all(&pool, &packet, 500);
    assert!(fragments.iter().all(|f| f.segment_count() == 1));
    fragments.reverse();

    let whole = pool
        .reassemble(fragments, Instant::now() + Duration::from_secs(1))
        .unwrap();
    assert_eq!(whole.segment_count(), 1);
    assert_eq!(whole.to_vec(), data);
}

// =============================================================================
// Link frames
// =============================================================================

#[test]
fn test_frames_through_link() {
    for endianness in [Endianness::Little, Endianness::Big] {
        let tx = PacketPool::builder()
            .name("tx")
            .segment_count(32)
            .endianness(endianness)
            .build()
            .unwrap();
        let rx = PacketPool::builder()
            .name("rx")
            .segment_count(32)
            .endianness(endianness)
            .build()
            .unwrap();

        let data = generate_payload(4000, 9);
        let packet = tx.packet_from(&data).unwrap();

        // Serialize each fragment as header + payload, as a link driver would.
        let mut frames = Vec::new();
        for fragment in tx.fragment_for_link(&packet, 1400).unwrap() {
            let mut fragment = fragment.unwrap();
            fragment.write_fragment_header().unwrap();
            let header = fragment.first_segment().unwrap().header();
            let mut frame = header[header.len() - FRAGMENT_HEADER_LEN..].to_vec();
            frame.extend(fragment.to_vec());
            frames.push(frame);
        }
        frames.reverse();

        let received: Vec<Packet> = frames
            .iter()
            .map(|frame| rx.receive_frame(frame).unwrap())
            .collect();
        let whole = rx
            .reassemble(received, Instant::now() + Duration::from_secs(1))
            .unwrap();

        assert_eq!(whole.pool_id(), rx.id());
        assert_eq!(whole.to_vec(), data);
        drop(whole);
        assert_eq!(rx.free_count(), 32);
    }
}

// =============================================================================
// Failure paths
// =============================================================================

#[test]
fn test_missing_fragment_times_out() {
    let pool = create_pool(true, 256, 64);
    let packet = pool.packet_from(&generate_payload(1000, 1)).unwrap();
    let mut fragments = fragment_all(&pool, &packet, 300);
    fragments.remove(1);

    let err = pool
        .reassemble(fragments, Instant::now() + Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, BufferError::ReassemblyTimeout { .. }));

    drop(packet);
    assert_eq!(pool.free_count(), 64);
    assert_eq!(pool.info().reassembly_timeouts, 1);
}

#[test]
fn test_past_deadline_times_out() {
    let pool = create_pool(true, 256, 64);
    let packet = pool.packet_from(&generate_payload(1000, 1)).unwrap();
    let fragments = fragment_all(&pool, &packet, 300);
    let id = fragments[0].fragment_info().unwrap().datagram_id;

    let err = pool.reassemble(fragments, Instant::now()).unwrap_err();
    assert_eq!(err, BufferError::ReassemblyTimeout { datagram_id: id });
}

#[test]
fn test_fragmenting_under_pool_pressure() {
    let pool = create_pool(true, 128, 16);
    let data = generate_payload(112 * 8, 2);
    let packet = pool.packet_from(&data).unwrap();
    assert_eq!(pool.free_count(), 8);

    // Consume fragments as they are built so the pool never runs dry.
    let mut reassembler = Reassembler::new(pool.clone());
    let now = Instant::now();
    let mut whole = None;
    for fragment in pool.fragment_for_link(&packet, 112).unwrap() {
        whole = reassembler.push(fragment.unwrap(), now).unwrap();
    }
    assert_eq!(whole.unwrap().to_vec(), data);
}
