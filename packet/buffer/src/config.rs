//! Pool configuration.
//!
//! A [`BufferConfig`] is built once (from TOML or through
//! [`crate::PacketPoolBuilder`]) and handed to the pool constructor, which
//! validates it into a [`Layout`]. Nothing here changes after the pool exists.
//!
//! The defaults describe an Ethernet link behind a bus/SDPCM transport: 44
//! bytes of physical header (14 Ethernet + 12 bus + 18 SDPCM), no trailer,
//! fragmentation and chaining enabled.

use crate::error::ConfigError;
use crate::fault::FaultPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Default segment capacity: one 1500 byte payload plus framing, rounded up.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 1536;

/// Default number of segments in a pool.
pub const DEFAULT_SEGMENT_COUNT: usize = 64;

/// Ethernet header (14) + bus header (12) + SDPCM header (18).
pub const DEFAULT_HEADER_RESERVE: usize = 14 + 12 + 18;

/// No CRC appendage by default.
pub const DEFAULT_TRAILER_RESERVE: usize = 0;

/// Default number of fragments held per datagram.
pub const DEFAULT_HOLD_LIMIT: usize = 64;

/// Default number of datagrams reassembled concurrently.
pub const DEFAULT_MAX_DATAGRAMS: usize = 16;

/// Default reassembly timeout.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default SNTP server stratum floor.
pub const DEFAULT_SNTP_MIN_STRATUM: u8 = 3;

/// Link driver command id for precision time protocol sends.
pub const DEFAULT_LINK_PTP_SEND: u32 = 51;

/// Byte order used for on-wire fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Complete configuration for one packet pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferConfig {
    /// Pool name, used in logs and statistics.
    pub name: String,

    /// Total bytes per segment, framing included (e.g. 1536, "2KB").
    #[serde(deserialize_with = "deserialize_size")]
    pub segment_capacity: usize,

    /// Number of segments preallocated by the pool.
    pub segment_count: usize,

    /// Bytes reserved ahead of the payload for link framing.
    #[serde(deserialize_with = "deserialize_size")]
    pub header_reserve: usize,

    /// Bytes reserved after the payload (e.g. CRC).
    #[serde(deserialize_with = "deserialize_size")]
    pub trailer_reserve: usize,

    /// Optional power-of-two alignment of the payload start.
    pub alignment: Option<usize>,

    /// Allow splitting packets larger than the link MTU.
    pub fragmentation: bool,

    /// Allow a packet to span several segments.
    pub chaining: bool,

    /// Byte order for the fragment header.
    pub endianness: Endianness,

    /// Re-verify chain bookkeeping after every mutating operation.
    ///
    /// Checks that protect memory and the free list always run; this only
    /// controls the redundant ones.
    pub error_checking: bool,

    /// What to do on a broken invariant.
    pub fault_policy: FaultPolicy,

    /// Reassembly limits.
    pub reassembly: ReassemblyConfig,

    /// Parameters carried for the rest of the stack.
    pub stack: StackProfile,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            segment_count: DEFAULT_SEGMENT_COUNT,
            header_reserve: DEFAULT_HEADER_RESERVE,
            trailer_reserve: DEFAULT_TRAILER_RESERVE,
            alignment: None,
            fragmentation: true,
            chaining: true,
            endianness: Endianness::Little,
            error_checking: false,
            fault_policy: FaultPolicy::Halt,
            reassembly: ReassemblyConfig::default(),
            stack: StackProfile::default(),
        }
    }
}

impl BufferConfig {
    /// Check the configuration and derive the segment layout.
    pub fn validate(&self) -> Result<Layout, ConfigError> {
        if self.segment_count == 0 {
            return Err(ConfigError::NoSegments);
        }
        if self.segment_count > u16::MAX as usize {
            return Err(ConfigError::TooManySegments(self.segment_count));
        }

        let mut header_reserve = self.header_reserve;
        if let Some(alignment) = self.alignment {
            if !alignment.is_power_of_two() {
                return Err(ConfigError::AlignmentNotPowerOfTwo(alignment));
            }
            if self.segment_capacity % alignment != 0 {
                return Err(ConfigError::CapacityNotAligned {
                    capacity: self.segment_capacity,
                    alignment,
                });
            }
            header_reserve = header_reserve.next_multiple_of(alignment);
        }

        let framing = header_reserve + self.trailer_reserve;
        if framing >= self.segment_capacity {
            return Err(ConfigError::NoPayload {
                capacity: self.segment_capacity,
                header: header_reserve,
                trailer: self.trailer_reserve,
            });
        }

        if self.reassembly.hold_limit == 0 {
            return Err(ConfigError::ZeroHoldLimit);
        }
        if self.reassembly.max_datagrams == 0 {
            return Err(ConfigError::ZeroDatagrams);
        }
        if !(1..=15).contains(&self.stack.sntp_min_stratum) {
            return Err(ConfigError::InvalidStratum(self.stack.sntp_min_stratum));
        }

        Ok(Layout {
            capacity: self.segment_capacity,
            header_reserve,
            trailer_reserve: self.trailer_reserve,
            max_payload: self.segment_capacity - framing,
        })
    }
}

/// Derived per-segment geometry.
///
/// `header_reserve + max_payload + trailer_reserve == capacity` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Bytes per segment.
    pub capacity: usize,
    /// Header reserve after alignment rounding.
    pub header_reserve: usize,
    /// Trailer reserve.
    pub trailer_reserve: usize,
    /// Usable payload bytes per segment.
    pub max_payload: usize,
}

impl Layout {
    /// Offset of the payload zone within a segment.
    #[inline]
    pub fn payload_start(&self) -> usize {
        self.header_reserve
    }

    /// Offset one past the payload zone.
    #[inline]
    pub fn payload_end(&self) -> usize {
        self.header_reserve + self.max_payload
    }

    /// Segments needed to hold `len` payload bytes. Never less than one.
    #[inline]
    pub fn segments_for(&self, len: usize) -> usize {
        len.div_ceil(self.max_payload).max(1)
    }
}

/// Limits applied while reassembling fragmented datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReassemblyConfig {
    /// Fragments buffered per datagram before giving up.
    pub hold_limit: usize,
    /// Datagrams reassembled at the same time.
    pub max_datagrams: usize,
    /// How long a datagram may stay incomplete after its first fragment.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            hold_limit: DEFAULT_HOLD_LIMIT,
            max_datagrams: DEFAULT_MAX_DATAGRAMS,
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

/// Settings owned by other parts of the network stack.
///
/// The buffer manager validates and exposes these; it does not act on them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackProfile {
    pub ipv6: bool,
    pub secure: bool,
    pub extended_notify: bool,
    pub ip_packet_filter: bool,
    /// DNS client brings its own packet pool.
    pub dns_client_packet_pool: bool,
    /// Lowest acceptable SNTP server stratum.
    pub sntp_min_stratum: u8,
    /// Link driver command id for PTP sends.
    pub link_ptp_send: u32,
}

impl Default for StackProfile {
    fn default() -> Self {
        Self {
            ipv6: false,
            secure: true,
            extended_notify: true,
            ip_packet_filter: true,
            dns_client_packet_pool: true,
            sntp_min_stratum: DEFAULT_SNTP_MIN_STRATUM,
            link_ptp_send: DEFAULT_LINK_PTP_SEND,
        }
    }
}

/// Deserialize a size from an integer or a human-readable string ("2KB").
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Int(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Int(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Deserialize a duration from a human-readable string (e.g. "5s", "250ms").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a size string like "1536", "2KB" or "1MB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let num_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(num_end);
    let num: usize = num_str
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", num_str, e))?;

    let multiplier: usize = match suffix.trim().to_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' overflows", s))
}
