//! Worker thread: build, fragment, deliver and reassemble datagrams.

use crate::config::Config;
use crate::metrics;

use packet_buffer::{BufferError, FRAGMENT_HEADER_LEN, Packet, PacketPool, Reassembler};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Test phase, controlled by main thread and read by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Run the workload but don't record metrics.
    Warmup = 0,
    /// Record metrics.
    Running = 1,
    /// Workers should exit.
    Stop = 2,
}

impl Phase {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Warmup,
            1 => Phase::Running,
            _ => Phase::Stop,
        }
    }
}

/// Shared state between main thread and workers.
pub struct SharedState {
    phase: AtomicU8,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Warmup as u8),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Per-worker state reused across round trips.
struct Link<'a> {
    tx: &'a PacketPool,
    rx: &'a PacketPool,
    reassembler: Reassembler,
    mtu: usize,
    link_frames: bool,
    shuffle: bool,
    frame: Vec<u8>,
    arrivals: Vec<Packet>,
}

impl Link<'_> {
    /// Send one datagram across the link and reassemble it.
    ///
    /// Returns the reassembled packet and the number of fragments used.
    fn round_trip(&mut self, data: &[u8], rng: &mut Xoshiro256PlusPlus) -> Result<(Packet, usize), BufferError> {
        let start = Instant::now();
        let packet = self.tx.packet_from(data)?;
        let built_ns = start.elapsed().as_nanos() as u64;
        let _ = metrics::ALLOCATE_LATENCY.increment(built_ns);

        self.arrivals.clear();
        for fragment in self.tx.fragment_for_link(&packet, self.mtu)? {
            let mut fragment = fragment?;
            let arrival = if self.link_frames {
                fragment.write_fragment_header()?;
                self.frame.clear();
                if let Some(first) = fragment.first_segment() {
                    let header = first.header();
                    self.frame
                        .extend_from_slice(&header[header.len() - FRAGMENT_HEADER_LEN..]);
                }
                for chunk in fragment.chunks() {
                    self.frame.extend_from_slice(chunk);
                }
                self.rx.receive_frame(&self.frame)?
            } else {
                self.rx.copy_packet(&fragment)?
            };
            self.arrivals.push(arrival);
        }
        drop(packet);

        if self.shuffle {
            self.arrivals.shuffle(rng);
        }

        let count = self.arrivals.len();
        let now = Instant::now();
        let mut whole = None;
        for fragment in self.arrivals.drain(..) {
            if let Some(packet) = self.reassembler.push(fragment, now)? {
                whole = Some(packet);
            }
        }

        match whole {
            Some(packet) => Ok((packet, count)),
            None => Err(BufferError::ReassemblyTimeout { datagram_id: 0 }),
        }
    }
}

/// Compare a packet's payload against `data` without flattening it.
fn same_payload(packet: &Packet, data: &[u8]) -> bool {
    if packet.len() != data.len() {
        return false;
    }
    let mut offset = 0;
    for chunk in packet.chunks() {
        if chunk != &data[offset..offset + chunk.len()] {
            return false;
        }
        offset += chunk.len();
    }
    true
}

/// Run a single worker thread.
pub fn run_worker(id: usize, config: &Config, tx: &PacketPool, rx: &PacketPool, shared: &SharedState) {
    let workload = &config.workload;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    let mut data = vec![0u8; workload.payload.max];
    rng.fill_bytes(&mut data);

    let mut link = Link {
        tx,
        rx,
        reassembler: Reassembler::new(rx.clone()),
        mtu: workload.mtu,
        link_frames: workload.link_frames,
        shuffle: workload.shuffle,
        frame: Vec::with_capacity(workload.mtu + FRAGMENT_HEADER_LEN),
        arrivals: Vec::new(),
    };

    tracing::debug!(worker = id, "worker started");

    loop {
        let phase = shared.phase();
        if phase == Phase::Stop {
            break;
        }
        let recording = phase == Phase::Running;

        let len = rng.random_range(workload.payload.min..=workload.payload.max);
        let start = Instant::now();
        let result = link.round_trip(&data[..len], &mut rng);
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        match result {
            Ok((packet, fragments)) => {
                let intact = same_payload(&packet, &data[..len]);
                if recording {
                    metrics::DATAGRAMS.increment();
                    metrics::FRAGMENTS.add(fragments as u64);
                    metrics::BYTES.add(len as u64);
                    if intact {
                        metrics::COMPLETED.increment();
                    } else {
                        metrics::CORRUPT.increment();
                    }
                    let _ = metrics::ROUND_TRIP_LATENCY.increment(elapsed_ns);
                }
                if !intact {
                    tracing::error!(worker = id, len, "reassembled datagram differs from source");
                }
            }
            Err(e) => {
                // Anything half-assembled belongs to the failed datagram.
                link.reassembler.clear();
                link.arrivals.clear();
                if recording {
                    metrics::DATAGRAMS.increment();
                    match e {
                        BufferError::PoolExhausted { .. } => metrics::POOL_EXHAUSTED.increment(),
                        BufferError::OversizedPacket { .. } => metrics::OVERSIZED.increment(),
                        _ => metrics::ERRORS.increment(),
                    };
                }
                tracing::trace!(worker = id, len, error = %e, "round trip failed");
            }
        }
    }

    tracing::debug!(worker = id, "worker stopped");
}
