//! Fail-stop handling for broken pool invariants.
//!
//! A [`Violation`] means the pool's bookkeeping can no longer be trusted (a
//! segment handed back twice, a segment returned while still linked, a chain
//! whose length disagrees with its segments). Continuing would corrupt the
//! free list, so the affected execution context is stopped instead of
//! returning an error the caller could ignore.

use serde::Deserialize;
use std::fmt;

/// What to do when a [`Violation`] is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Abort the process. Nothing unwinds and no destructor runs.
    #[default]
    Halt,
    /// Panic the current thread. Other threads keep running; the pool
    /// that detected the violation should not be used again.
    Panic,
}

/// A broken internal invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// A segment came back to a pool that already lists it as free.
    SegmentAlreadyFree { pool: u32, segment: u16 },
    /// A segment came back while still owning a link to another segment.
    SegmentStillLinked { pool: u32, segment: u16 },
    /// A segment was returned to a pool that did not hand it out.
    ForeignSegment {
        pool: u32,
        owner: u32,
        segment: u16,
    },
    /// The packet's recorded length disagrees with its segments.
    ChainLengthMismatch { declared: usize, actual: usize },
    /// A segment's payload bounds escaped its payload zone.
    PayloadOutOfZone { segment: u16, len: usize, max: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::SegmentAlreadyFree { pool, segment } => {
                write!(f, "pool {pool}: segment {segment} released while already free")
            }
            Violation::SegmentStillLinked { pool, segment } => {
                write!(f, "pool {pool}: segment {segment} released while still linked")
            }
            Violation::ForeignSegment {
                pool,
                owner,
                segment,
            } => write!(
                f,
                "pool {pool}: segment {segment} belongs to pool {owner}"
            ),
            Violation::ChainLengthMismatch { declared, actual } => write!(
                f,
                "chain length mismatch: declared {declared}, segments hold {actual}"
            ),
            Violation::PayloadOutOfZone { segment, len, max } => write!(
                f,
                "segment {segment}: payload length {len} exceeds zone of {max}"
            ),
        }
    }
}

/// Stop the current execution context.
#[cold]
#[inline(never)]
pub fn fatal(policy: FaultPolicy, violation: Violation) -> ! {
    tracing::error!(%violation, ?policy, "fatal invariant violation");
    match policy {
        FaultPolicy::Halt => std::process::abort(),
        FaultPolicy::Panic => panic!("fatal invariant violation: {violation}"),
    }
}
