#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_buffer::{FragmentHeader, PacketPool, Reassembler};
use std::time::{Duration, Instant};

// Each record is: datagram id (1 byte), offset (2 bytes), more flag (1 byte),
// length (1 byte). Payload bytes are derived from the offset so a completed
// datagram can be checked.
fuzz_target!(|data: &[u8]| {
    let pool = PacketPool::builder()
        .segment_capacity(128)
        .segment_count(64)
        .header_reserve(16)
        .hold_limit(8)
        .max_datagrams(4)
        .error_checking(true)
        .build()
        .unwrap();
    let mut reassembler = Reassembler::new(pool.clone());
    let start = Instant::now();

    for (i, record) in data.chunks_exact(5).enumerate() {
        let offset = u16::from_le_bytes([record[1], record[2]]) as usize % 1024;
        let len = record[4] as usize;
        let payload: Vec<u8> = (offset..offset + len).map(|b| b as u8).collect();

        let mut frame = vec![0u8; 12];
        FragmentHeader {
            datagram_id: record[0] as u32 % 8,
            offset: offset as u32,
            more_fragments: record[3] & 1 == 1,
        }
        .encode(&mut frame, pool.config().endianness);
        frame.extend_from_slice(&payload);

        let Ok(fragment) = pool.receive_frame(&frame) else {
            continue;
        };
        let now = start + Duration::from_millis(i as u64);
        if let Ok(Some(packet)) = reassembler.push(fragment, now) {
            let bytes = packet.to_vec();
            assert!(bytes.iter().enumerate().all(|(j, &b)| b == j as u8));
        }
        if i % 16 == 15 {
            reassembler.expire(now);
        }
    }

    drop(reassembler);
    assert_eq!(pool.free_count(), 64);
});
