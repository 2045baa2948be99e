//! Load driver metrics.

use metriken::{AtomicHistogram, Counter, metric};

#[metric(name = "datagrams", description = "Datagrams sent through fragment and reassembly")]
pub static DATAGRAMS: Counter = Counter::new();

#[metric(name = "fragments", description = "Fragments produced")]
pub static FRAGMENTS: Counter = Counter::new();

#[metric(name = "bytes", description = "Payload bytes reassembled")]
pub static BYTES: Counter = Counter::new();

#[metric(name = "completed", description = "Datagrams reassembled intact")]
pub static COMPLETED: Counter = Counter::new();

#[metric(name = "pool_exhausted", description = "Round trips that ran out of segments")]
pub static POOL_EXHAUSTED: Counter = Counter::new();

#[metric(name = "oversized", description = "Round trips rejected as oversized")]
pub static OVERSIZED: Counter = Counter::new();

#[metric(name = "errors", description = "Round trips failed for any other reason")]
pub static ERRORS: Counter = Counter::new();

#[metric(name = "corrupt", description = "Reassembled datagrams that differ from the source")]
pub static CORRUPT: Counter = Counter::new();

#[metric(
    name = "round_trip_latency",
    description = "Fragment and reassemble latency histogram (nanoseconds)"
)]
pub static ROUND_TRIP_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "allocate_latency",
    description = "Source packet build latency histogram (nanoseconds)"
)]
pub static ALLOCATE_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);
