#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_buffer::{Endianness, FRAGMENT_HEADER_LEN, FragmentHeader};

fuzz_target!(|data: &[u8]| {
    for endianness in [Endianness::Little, Endianness::Big] {
        let Ok(header) = FragmentHeader::decode(data, endianness) else {
            assert!(data.len() < FRAGMENT_HEADER_LEN);
            continue;
        };

        // Re-encoding keeps the fields; unknown flag bits and reserved bytes
        // are normalized to zero.
        let mut encoded = [0u8; FRAGMENT_HEADER_LEN];
        header.encode(&mut encoded, endianness);
        assert_eq!(encoded[..8], data[..8]);
        assert_eq!(encoded[8], data[8] & 0x01);
        assert_eq!(FragmentHeader::decode(&encoded, endianness).unwrap(), header);
    }
});
