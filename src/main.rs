//! respcache workload driver
//!
//! Builds a cache from a backend name and a JSON option blob, runs a
//! synthetic insert/lookup workload against it and reports the counters.
//!
//! ```text
//! respcache --backend local --config '{"size": "1048576"}' --entries 500
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use respcache::cache::{Buffer, Entry, Item, ResponseCache};
use respcache::{BackendKind, ErrorKind};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Response cache workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache backend (local, redis)
    #[arg(long, env = "RESPCACHE_BACKEND", default_value = "local")]
    backend: BackendKind,

    /// Backend options as a JSON object of strings
    #[arg(long, env = "RESPCACHE_CONFIG", default_value = r#"{"size": "1048576"}"#)]
    config: String,

    /// Distinct keys to insert
    #[arg(long, default_value = "1000")]
    entries: usize,

    /// Items per entry
    #[arg(long, default_value = "1")]
    items: usize,

    /// Buffers per item
    #[arg(long, default_value = "2")]
    buffers_per_item: usize,

    /// Bytes per buffer
    #[arg(long, default_value = "256")]
    buffer_size: usize,

    /// Worker threads sharing the cache
    #[arg(long, default_value = "4")]
    threads: usize,

    /// Print Prometheus metrics when done
    #[arg(long)]
    print_metrics: bool,

    /// Flush the cache before exiting
    #[arg(long)]
    flush: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting respcache workload");
    info!("  Backend: {}", args.backend);
    info!(
        "  Entries: {} x {} items x {} buffers of {} bytes",
        args.entries, args.items, args.buffers_per_item, args.buffer_size
    );

    let cache = Arc::new(
        ResponseCache::from_json(args.backend, &args.config)
            .with_context(|| format!("failed to create {} cache", args.backend))?,
    );

    let threads = args.threads.max(1);
    let started = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            let shape = Shape::from(&args);
            let entries = args.entries;
            thread::spawn(move || run_worker(&cache, worker, threads, entries, shape))
        })
        .collect();

    let mut totals = WorkerStats::default();
    for handle in handles {
        let stats = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
        totals.merge(&stats);
    }
    let elapsed = started.elapsed();

    let snapshot = cache.metrics();
    info!(
        inserted = totals.inserted,
        duplicates = totals.duplicates,
        failed = totals.failed,
        verified = totals.verified,
        corrupted = totals.corrupted,
        "workload finished in {:?}",
        elapsed
    );
    info!(
        hits = snapshot.hits,
        misses = snapshot.misses,
        hit_ratio = snapshot.hit_ratio,
        entries = snapshot.store.entries,
        evictions = snapshot.store.evictions,
        "cache state"
    );

    if args.print_metrics {
        println!("{}", cache.prometheus()?);
    }

    if args.flush {
        cache.flush()?;
    }

    if totals.corrupted > 0 {
        anyhow::bail!("{} entries came back different from what was inserted", totals.corrupted);
    }
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Shape {
    items: usize,
    buffers_per_item: usize,
    buffer_size: usize,
}

impl From<&Args> for Shape {
    fn from(args: &Args) -> Self {
        Self {
            items: args.items,
            buffers_per_item: args.buffers_per_item,
            buffer_size: args.buffer_size.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    inserted: u64,
    duplicates: u64,
    failed: u64,
    verified: u64,
    corrupted: u64,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
        self.verified += other.verified;
        self.corrupted += other.corrupted;
    }
}

/// Deterministic entry for key `n`
fn make_entry(n: usize, shape: Shape) -> Entry {
    let items = (0..shape.items)
        .map(|item| {
            let buffers = (0..shape.buffers_per_item)
                .map(|index| {
                    let seed = (n + item * 31 + index * 7) as u8;
                    let data: Vec<u8> = (0..shape.buffer_size)
                        .map(|i| seed.wrapping_add(i as u8))
                        .collect();
                    Buffer::new(data)
                })
                .collect();
            Item::from_buffers(buffers)
        })
        .collect();
    Entry::from_items(items)
}

fn run_worker(
    cache: &ResponseCache,
    worker: usize,
    threads: usize,
    entries: usize,
    shape: Shape,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    for n in (worker..entries).step_by(threads) {
        let key = format!("request-{}", n);
        let entry = make_entry(n, shape);

        match cache.insert(&key, &entry) {
            Ok(()) => stats.inserted += 1,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => stats.duplicates += 1,
            Err(err) => {
                warn!(key = %key, error = %err, "insert failed");
                stats.failed += 1;
                continue;
            }
        }

        match cache.lookup(&key) {
            Ok(found) if found == entry => stats.verified += 1,
            Ok(_) => stats.corrupted += 1,
            // evicted by another worker before we got back to it
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key = %key, "evicted before lookup")
            }
            Err(err) => {
                warn!(key = %key, error = %err, "lookup failed");
                stats.failed += 1;
            }
        }
    }
    stats
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
