//! Packet pool load driver: workers fragment datagrams out of a transmit pool,
//! deliver the fragments into a receive pool and reassemble them, while the
//! main thread reports throughput and latency.

mod config;
mod logging;
mod metrics;
mod worker;

use crate::config::Config;
use crate::worker::{Phase, SharedState};

use clap::Parser;
use metriken::{AtomicHistogram, histogram::Histogram};
use packet_buffer::{PacketPool, PoolInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "packet-bench")]
#[command(about = "Fragment/reassemble load driver for packet pools")]
struct Args {
    /// Path to configuration file
    config: PathBuf,

    /// Override the number of worker threads
    #[arg(long)]
    threads: Option<usize>,
}

fn main() {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(threads) = args.threads.filter(|&t| t > 0) {
        config.general.threads = threads;
    }

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let tx = PacketPool::new(config.pool.clone())?;
    let rx = PacketPool::new(config.rx_pool())?;
    print_config(&config, &tx, &rx);

    let num_threads = config.general.threads;
    let warmup = config.general.warmup;
    let duration = config.general.duration;

    let shared = Arc::new(SharedState::new());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let config = Arc::new(config);
    let mut handles = Vec::with_capacity(num_threads);

    for id in 0..num_threads {
        let shared = Arc::clone(&shared);
        let config = Arc::clone(&config);
        let tx = tx.clone();
        let rx = rx.clone();

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                worker::run_worker(id, &config, &tx, &rx, &shared);
            })?;

        handles.push(handle);
    }

    tracing::info!(threads = num_threads, ?warmup, "warming up");

    let start = Instant::now();
    let report_interval = Duration::from_secs(1);
    let mut last_report = Instant::now();
    let mut last_completed = 0u64;
    let mut last_bytes = 0u64;
    let mut last_histogram: Option<Histogram> = None;
    let mut current_phase = Phase::Warmup;

    loop {
        thread::sleep(Duration::from_millis(100));

        if !running.load(Ordering::SeqCst) {
            shared.set_phase(Phase::Stop);
            break;
        }

        let elapsed = start.elapsed();
        if elapsed >= warmup + duration {
            shared.set_phase(Phase::Stop);
            break;
        }

        if current_phase == Phase::Warmup && elapsed >= warmup {
            shared.set_phase(Phase::Running);
            current_phase = Phase::Running;
            tracing::info!(?duration, "running");
            print_header();
            last_report = Instant::now();
            last_completed = metrics::COMPLETED.value();
            last_bytes = metrics::BYTES.value();
            last_histogram = metrics::ROUND_TRIP_LATENCY.load();
        }

        if current_phase != Phase::Running {
            continue;
        }

        if last_report.elapsed() >= report_interval {
            let completed = metrics::COMPLETED.value();
            let bytes = metrics::BYTES.value();
            let elapsed_secs = last_report.elapsed().as_secs_f64();

            let rate = (completed - last_completed) as f64 / elapsed_secs;
            let mbps = (bytes - last_bytes) as f64 * 8.0 / elapsed_secs / 1_000_000.0;
            last_completed = completed;
            last_bytes = bytes;

            let current_histogram = metrics::ROUND_TRIP_LATENCY.load();
            let (p50, p99, max) = match (&current_histogram, &last_histogram) {
                (Some(current), Some(previous)) => match current.wrapping_sub(previous) {
                    Ok(delta) => latency_triple(&delta),
                    Err(_) => (0.0, 0.0, 0.0),
                },
                (Some(current), None) => latency_triple(current),
                _ => (0.0, 0.0, 0.0),
            };
            last_histogram = current_histogram;

            println!(
                "{:>12.0} {:>10.1} {:>6.1}% {:>6.1}% {:>10.1} {:>10.1} {:>10.1}",
                rate,
                mbps,
                tx.info().utilization(),
                rx.info().utilization(),
                p50,
                p99,
                max,
            );

            last_report = Instant::now();
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    print_summary(&config, &tx.info(), &rx.info());

    Ok(())
}

fn print_config(config: &Config, tx: &PacketPool, rx: &PacketPool) {
    eprintln!("packet-bench configuration:");
    for pool in [tx, rx] {
        let layout = pool.layout();
        eprintln!(
            "  {:<10} {} x {} bytes (header {}, payload {}, trailer {}), chaining={}",
            pool.name(),
            pool.segment_count(),
            layout.capacity,
            layout.header_reserve,
            layout.max_payload,
            layout.trailer_reserve,
            pool.config().chaining,
        );
    }
    eprintln!("  threads:   {}", config.general.threads);
    eprintln!("  duration:  {:?}", config.general.duration);
    eprintln!("  warmup:    {:?}", config.general.warmup);
    eprintln!("  mtu:       {}", config.workload.mtu);
    eprintln!(
        "  payload:   {}..={} bytes",
        config.workload.payload.min, config.workload.payload.max
    );
    eprintln!(
        "  delivery:  {}{}",
        if config.workload.link_frames { "frames" } else { "copy" },
        if config.workload.shuffle { ", shuffled" } else { "" },
    );
    eprintln!();
}

fn print_header() {
    println!(
        "{:>12} {:>10} {:>7} {:>7} {:>10} {:>10} {:>10}",
        "dgram/sec", "Mbit/s", "tx%", "rx%", "p50(us)", "p99(us)", "max(us)",
    );
    println!("{}", "-".repeat(74));
}

fn print_summary(config: &Config, tx: &PoolInfo, rx: &PoolInfo) {
    let datagrams = metrics::DATAGRAMS.value();
    let completed = metrics::COMPLETED.value();
    let fragments = metrics::FRAGMENTS.value();
    let exhausted = metrics::POOL_EXHAUSTED.value();
    let oversized = metrics::OVERSIZED.value();
    let errors = metrics::ERRORS.value();
    let corrupt = metrics::CORRUPT.value();

    let elapsed = config.general.duration.as_secs_f64();
    let avg_rate = if elapsed > 0.0 {
        completed as f64 / elapsed
    } else {
        0.0
    };
    let per_datagram = if completed > 0 {
        fragments as f64 / completed as f64
    } else {
        0.0
    };

    eprintln!();
    eprintln!("=== Final Summary ===");
    eprintln!("  datagrams:     {datagrams}");
    eprintln!("  completed:     {completed} ({avg_rate:.0}/sec, {per_datagram:.1} fragments each)");
    eprintln!("  exhausted:     {exhausted}");
    eprintln!("  oversized:     {oversized}");
    eprintln!("  other errors:  {errors}");
    eprintln!("  corrupt:       {corrupt}");
    eprintln!();

    print_latency_summary("BUILD", &metrics::ALLOCATE_LATENCY);
    print_latency_summary("TRIP", &metrics::ROUND_TRIP_LATENCY);
    eprintln!();

    for info in [tx, rx] {
        eprintln!(
            "  pool {:<8} free {}/{}  allocs {}  releases {}  empty {}  fragments {}  reassembled {}  timeouts {}  overlaps {}",
            info.name,
            info.free_segments,
            info.total_segments,
            info.allocations,
            info.releases,
            info.empty_requests,
            info.fragments,
            info.reassembled,
            info.reassembly_timeouts,
            info.overlaps,
        );
    }
}

fn print_latency_summary(label: &str, hist: &AtomicHistogram) {
    let (p50, p99, max) = match hist.load() {
        Some(snapshot) => latency_triple(&snapshot),
        None => (0.0, 0.0, 0.0),
    };
    let p90 = percentile(hist, 90.0) / 1000.0;
    let p999 = percentile(hist, 99.9) / 1000.0;

    eprintln!(
        "  {label:<6} latency (us): p50={p50:.1}  p90={p90:.1}  p99={p99:.1}  p999={p999:.1}  max={max:.1}",
    );
}

// --- Histogram helpers ---

/// p50, p99 and max in microseconds.
fn latency_triple(hist: &Histogram) -> (f64, f64, f64) {
    (
        percentile_from_histogram(hist, 50.0) / 1000.0,
        percentile_from_histogram(hist, 99.0) / 1000.0,
        percentile_from_histogram(hist, 100.0) / 1000.0,
    )
}

fn percentile(hist: &AtomicHistogram, p: f64) -> f64 {
    if let Some(snapshot) = hist.load() {
        percentile_from_histogram(&snapshot, p)
    } else {
        0.0
    }
}

fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p])
        && let Some((_pct, bucket)) = results.first()
    {
        return bucket.end() as f64;
    }
    0.0
}
