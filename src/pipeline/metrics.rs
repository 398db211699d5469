//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Records pulled from the source
    pub records_read: AtomicU64,

    /// Records serialized to the output
    pub records_written: AtomicU64,

    /// Chunks written to the output
    pub chunks_written: AtomicU64,

    /// Chunks the transforms reduced to nothing
    pub chunks_skipped: AtomicU64,

    /// Total bytes handed to the output, framing included
    pub bytes_written: AtomicU64,

    /// Number of failed runs
    pub failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-phase timing (in microseconds for precision)
    /// Time spent pulling records from the source (microseconds)
    pub source_us: AtomicU64,

    /// Time spent in the transform chain (microseconds)
    pub transform_us: AtomicU64,

    /// Time spent formatting (microseconds)
    pub format_us: AtomicU64,

    /// Time spent writing to the output (microseconds)
    pub write_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record records pulled from the source.
    pub fn add_records_read(&self, count: u64) {
        self.records_read.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a written chunk and the records it carried.
    pub fn add_chunk_written(&self, records: u64) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(records, Ordering::Relaxed);
    }

    /// Record a skipped chunk.
    pub fn add_chunk_skipped(&self) {
        self.chunks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failure.
    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_source_time(&self, duration: Duration) {
        self.source_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_transform_time(&self, duration: Duration) {
        self.transform_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_format_time(&self, duration: Duration) {
        self.format_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_write_time(&self, duration: Duration) {
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get records written per second.
    pub fn records_per_second(&self) -> f64 {
        let records = self.records_written.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            records as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get write throughput in MB/s.
    pub fn write_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_written.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (bytes as f64) / (1024.0 * 1024.0) / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let to_secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunks_skipped: self.chunks_skipped.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            records_per_second: self.records_per_second(),
            write_throughput_mbps: self.write_throughput_mbps(),
            source_secs: to_secs(&self.source_us),
            transform_secs: to_secs(&self.transform_us),
            format_secs: to_secs(&self.format_us),
            write_secs: to_secs(&self.write_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_read: u64,
    pub records_written: u64,
    pub chunks_written: u64,
    pub chunks_skipped: u64,
    pub bytes_written: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub records_per_second: f64,
    pub write_throughput_mbps: f64,
    /// Time spent pulling from the source (seconds)
    pub source_secs: f64,
    /// Time spent transforming (seconds, summed across workers)
    pub transform_secs: f64,
    /// Time spent formatting (seconds)
    pub format_secs: f64,
    /// Time spent writing (seconds)
    pub write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    fn phase_percentages(&self) -> [f64; 4] {
        let phases = [
            self.source_secs,
            self.transform_secs,
            self.format_secs,
            self.write_secs,
        ];
        let total: f64 = phases.iter().sum();
        if total > 0.0 {
            phases.map(|p| p / total * 100.0)
        } else {
            [0.0; 4]
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [source_pct, transform_pct, format_pct, write_pct] = self.phase_percentages();

        write!(
            f,
            "Records: {} read, {} written | Chunks: {} written, {} skipped | \
             Output: {:.2} MB @ {:.2} MB/s | Rate: {:.0} records/s | \
             Failures: {} | Elapsed: {:.1}s | \
             Time: source {:.0}% | transform {:.0}% | format {:.0}% | write {:.0}%",
            self.records_read,
            self.records_written,
            self.chunks_written,
            self.chunks_skipped,
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.write_throughput_mbps,
            self.records_per_second,
            self.failures,
            self.elapsed.as_secs_f64(),
            source_pct,
            transform_pct,
            format_pct,
            write_pct,
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Log progress every interval until `shutdown` fires or its sender drops.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("{}", self.metrics.snapshot());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Records read: {}", snapshot.records_read);
        println!("Records written: {}", snapshot.records_written);
        println!("Chunks written: {}", snapshot.chunks_written);
        println!("Chunks skipped: {}", snapshot.chunks_skipped);
        println!(
            "Data written: {:.2} MB",
            snapshot.bytes_written as f64 / (1024.0 * 1024.0)
        );
        println!("Processing rate: {:.0} records/s", snapshot.records_per_second);
        println!("Failures: {}", snapshot.failures);

        let total_phase =
            snapshot.source_secs + snapshot.transform_secs + snapshot.format_secs + snapshot.write_secs;
        if total_phase > 0.0 {
            let [source_pct, transform_pct, format_pct, write_pct] = snapshot.phase_percentages();
            println!("\n--- Phase Time Breakdown ---");
            println!("Source:     {:>7.2}s ({:>5.1}%)", snapshot.source_secs, source_pct);
            println!("Transform:  {:>7.2}s ({:>5.1}%)", snapshot.transform_secs, transform_pct);
            println!("Format:     {:>7.2}s ({:>5.1}%)", snapshot.format_secs, format_pct);
            println!("Write:      {:>7.2}s ({:>5.1}%)", snapshot.write_secs, write_pct);
        }
        println!("========================\n");
    }
}
