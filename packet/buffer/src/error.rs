//! Error types for packet buffer operations.
//!
//! Everything here is an ordinary, recoverable result. Broken internal
//! invariants never show up as a [`BufferError`]; they go through
//! [`crate::fault`] instead.

/// Errors returned by pool, packet, fragmentation and reassembly operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The payload does not fit and the chain cannot be extended.
    #[error("packet too large: {requested} bytes requested, {capacity} bytes available")]
    OversizedPacket { requested: usize, capacity: usize },

    /// Not enough free segments to satisfy the request.
    #[error("pool exhausted: {needed} segments needed, {free} free")]
    PoolExhausted { needed: usize, free: usize },

    /// The packet exceeds the link MTU and fragmentation is disabled.
    #[error("fragmentation disabled: {len} byte packet exceeds mtu {mtu}")]
    FragmentationDisabled { len: usize, mtu: usize },

    /// The link MTU must be at least one byte.
    #[error("invalid mtu: {0}")]
    InvalidMtu(usize),

    /// Two fragments of the same datagram claim overlapping bytes.
    #[error("datagram {datagram_id}: fragment at offset {offset} ({len} bytes) overlaps held data")]
    Overlap {
        datagram_id: u32,
        offset: usize,
        len: usize,
    },

    /// The datagram did not complete before its deadline.
    #[error("datagram {datagram_id}: reassembly timed out")]
    ReassemblyTimeout { datagram_id: u32 },

    /// Too many out-of-order fragments held for one datagram.
    #[error("datagram {datagram_id}: more than {limit} fragments held")]
    HoldLimitExceeded { datagram_id: u32, limit: usize },

    /// Too many datagrams are being reassembled at once.
    #[error("reassembly table full ({limit} datagrams in flight)")]
    TooManyDatagrams { limit: usize },

    /// A packet without a fragment tag was handed to the reassembler.
    #[error("packet is not a fragment")]
    NotAFragment,

    /// A fragment is inconsistent with the datagram's terminal fragment.
    #[error("datagram {datagram_id}: fragment at offset {offset} is inconsistent")]
    InvalidFragment { datagram_id: u32, offset: usize },

    /// The packet was already released.
    #[error("packet already released")]
    DoubleRelease,

    /// The packet was used after its segments went back to the pool.
    #[error("packet has been released")]
    Released,

    /// A read went past the end of the packet.
    #[error("offset {offset} out of bounds for {len} byte packet")]
    OutOfBounds { offset: usize, len: usize },

    /// The header reserve is too small to hold the fragment header.
    #[error("header reserve of {reserve} bytes cannot hold a {needed} byte fragment header")]
    HeaderTooSmall { reserve: usize, needed: usize },

    /// A frame was shorter than the fragment header.
    #[error("truncated frame: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },
}

/// Result type for packet buffer operations.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors found while validating a [`crate::BufferConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("segment_count must be at least 1")]
    NoSegments,

    #[error("segment_count {0} exceeds the maximum of {max}", max = u16::MAX)]
    TooManySegments(usize),

    #[error(
        "segment_capacity {capacity} leaves no payload after {header} header and {trailer} trailer bytes"
    )]
    NoPayload {
        capacity: usize,
        header: usize,
        trailer: usize,
    },

    #[error("alignment {0} is not a power of two")]
    AlignmentNotPowerOfTwo(usize),

    #[error("segment_capacity {capacity} is not a multiple of alignment {alignment}")]
    CapacityNotAligned { capacity: usize, alignment: usize },

    #[error("reassembly hold_limit must be at least 1")]
    ZeroHoldLimit,

    #[error("reassembly max_datagrams must be at least 1")]
    ZeroDatagrams,

    #[error("sntp_min_stratum {0} outside 1..=15")]
    InvalidStratum(u8),
}
