#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_buffer::{FRAGMENT_HEADER_LEN, PacketPool};

fuzz_target!(|data: &[u8]| {
    let pool = PacketPool::builder()
        .segment_capacity(256)
        .segment_count(8)
        .header_reserve(16)
        .error_checking(true)
        .build()
        .unwrap();

    match pool.receive_frame(data) {
        Ok(packet) => {
            assert_eq!(packet.len(), data.len() - FRAGMENT_HEADER_LEN);
            assert_eq!(packet.to_vec(), &data[FRAGMENT_HEADER_LEN..]);
            assert!(packet.fragment_info().is_some());
        }
        // Short frames and payloads beyond the pool are expected.
        Err(_) => {}
    }
    assert_eq!(pool.free_count(), 8);
});
