//! packet-buffer: packet buffers for an embedded TCP/IP stack.
//!
//! This crate provides the buffer layer that sits between a network stack
//! and its link driver:
//!
//! - **Pools**: Fixed-size segments preallocated up front, handed out and
//!   taken back without blocking
//! - **Segments**: Header reserve, payload and trailer reserve in one buffer
//! - **Packets**: Chains of segments holding one payload, extended on append
//! - **Fragmentation**: Splitting a packet into link-sized, tagged fragments
//! - **Reassembly**: Joining tagged fragments that arrive in any order
//! - **Configuration**: Layout, feature switches and limits from TOML or a
//!   builder
//!
//! # Layout
//!
//! ```text
//!  Packet
//!    |
//!    v
//! +--------+---------------+-----+    +--------+---------------+-----+
//! | header | payload       | trl | -> | header | payload       | trl |
//! +--------+---------------+-----+    +--------+---------------+-----+
//!  segment 0                           segment 1
//! ```
//!
//! # Example
//!
//! ```
//! use packet_buffer::{PacketPool, Reassembler};
//! use std::time::Instant;
//!
//! let pool = PacketPool::builder().segment_count(16).build().unwrap();
//! let data = vec![0x5A; 3000];
//! let packet = pool.packet_from(&data).unwrap();
//!
//! let mut reassembler = Reassembler::new(pool.clone());
//! let mut whole = None;
//! for fragment in pool.fragment_for_link(&packet, 1000).unwrap() {
//!     whole = reassembler.push(fragment.unwrap(), Instant::now()).unwrap();
//! }
//! assert_eq!(whole.unwrap().to_vec(), data);
//! ```
//!
//! # Failure model
//!
//! Ordinary failures (pool exhausted, oversized payload, overlapping
//! fragments) are returned as [`BufferError`]. A broken internal invariant
//! (a segment returned twice, a chain whose length disagrees with its
//! segments) is never returned: it stops the current context according to
//! the pool's [`FaultPolicy`].

mod builder;
mod config;
mod error;
mod fault;
mod fragment;
mod packet;
mod pool;
mod reassembly;
mod segment;
mod stats;

pub use builder::PacketPoolBuilder;
pub use config::{
    BufferConfig, DEFAULT_HEADER_RESERVE, DEFAULT_HOLD_LIMIT, DEFAULT_LINK_PTP_SEND,
    DEFAULT_MAX_DATAGRAMS, DEFAULT_REASSEMBLY_TIMEOUT, DEFAULT_SEGMENT_CAPACITY,
    DEFAULT_SEGMENT_COUNT, DEFAULT_SNTP_MIN_STRATUM, DEFAULT_TRAILER_RESERVE, Endianness,
    Layout, ReassemblyConfig, StackProfile, parse_size,
};
pub use error::{BufferError, ConfigError, Result};
pub use fault::{FaultPolicy, Violation};
pub use fragment::{FRAGMENT_HEADER_LEN, FragmentHeader, FragmentInfo, Fragmenter};
pub use packet::Packet;
pub use pool::PacketPool;
pub use reassembly::Reassembler;
pub use segment::{Segment, Segments};
pub use stats::{PoolCounters, PoolInfo};
