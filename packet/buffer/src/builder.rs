//! Fluent construction of a [`PacketPool`].

use crate::config::{BufferConfig, Endianness, StackProfile};
use crate::error::ConfigError;
use crate::fault::FaultPolicy;
use crate::pool::PacketPool;
use std::time::Duration;

/// Builder for creating a [`PacketPool`].
///
/// Starts from [`BufferConfig::default`]; every setter overrides one field.
///
/// # Example
/// ```
/// use packet_buffer::PacketPool;
///
/// let pool = PacketPool::builder()
///     .name("wlan0-tx")
///     .segment_count(32)
///     .chaining(false)
///     .build()
///     .unwrap();
/// assert_eq!(pool.max_payload(), 1492);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PacketPoolBuilder {
    config: BufferConfig,
}

impl PacketPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: BufferConfig) -> Self {
        Self { config }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Bytes per segment, framing included (default: 1536).
    pub fn segment_capacity(mut self, capacity: usize) -> Self {
        self.config.segment_capacity = capacity;
        self
    }

    /// Number of preallocated segments (default: 64).
    pub fn segment_count(mut self, count: usize) -> Self {
        self.config.segment_count = count;
        self
    }

    /// Bytes reserved ahead of the payload (default: 44).
    pub fn header_reserve(mut self, bytes: usize) -> Self {
        self.config.header_reserve = bytes;
        self
    }

    /// Bytes reserved after the payload (default: 0).
    pub fn trailer_reserve(mut self, bytes: usize) -> Self {
        self.config.trailer_reserve = bytes;
        self
    }

    /// Align the payload start to `alignment` bytes.
    ///
    /// The header reserve is rounded up to a multiple of `alignment`.
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.config.alignment = Some(alignment);
        self
    }

    pub fn fragmentation(mut self, enabled: bool) -> Self {
        self.config.fragmentation = enabled;
        self
    }

    pub fn chaining(mut self, enabled: bool) -> Self {
        self.config.chaining = enabled;
        self
    }

    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.config.endianness = endianness;
        self
    }

    /// Re-verify chain bookkeeping after each mutation (default: off).
    pub fn error_checking(mut self, enabled: bool) -> Self {
        self.config.error_checking = enabled;
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.config.fault_policy = policy;
        self
    }

    /// Fragments held per datagram (default: 64).
    pub fn hold_limit(mut self, limit: usize) -> Self {
        self.config.reassembly.hold_limit = limit;
        self
    }

    /// Datagrams reassembled at once (default: 16).
    pub fn max_datagrams(mut self, limit: usize) -> Self {
        self.config.reassembly.max_datagrams = limit;
        self
    }

    /// Time a datagram may stay incomplete (default: 60s).
    pub fn reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.config.reassembly.timeout = timeout;
        self
    }

    pub fn stack(mut self, stack: StackProfile) -> Self {
        self.config.stack = stack;
        self
    }

    /// Validate the configuration and allocate the pool.
    pub fn build(self) -> Result<PacketPool, ConfigError> {
        PacketPool::new(self.config)
    }
}
