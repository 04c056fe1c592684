//! Transfer statistics collection for `--stats` output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::conduit::sender::RouteKind;
use crate::error::lock;

/// Counters shared by every conduit end on a process.
///
/// Updated with relaxed atomics from whichever thread moves the data, so the
/// totals are only meaningful once the run has finished.
pub struct TransferStats {
    started: Instant,
    phases: Mutex<Vec<(&'static str, Duration)>>,
    frames_inserted: AtomicU64,
    frames_extracted: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    remote_transfers: AtomicU64,
    local_transfers: AtomicU64,
    intra_task_transfers: AtomicU64,
    sequence_errors: AtomicU64,
    cancellations: AtomicU64,
}

/// Plain copy of the counters at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_inserted: u64,
    pub frames_extracted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub remote_transfers: u64,
    pub local_transfers: u64,
    pub intra_task_transfers: u64,
    pub sequence_errors: u64,
    pub cancellations: u64,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            phases: Mutex::new(Vec::new()),
            frames_inserted: AtomicU64::new(0),
            frames_extracted: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            remote_transfers: AtomicU64::new(0),
            local_transfers: AtomicU64::new(0),
            intra_task_transfers: AtomicU64::new(0),
            sequence_errors: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&self, name: &'static str, duration: Duration) {
        lock(&self.phases).push((name, duration));
    }

    pub fn frame_inserted(&self) {
        self.frames_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_extracted(&self) {
        self.frames_extracted.fetch_add(1, Ordering::Relaxed);
    }

    /// One connection-level send of `bytes` payload bytes over `route`.
    pub fn record_send(&self, route: RouteKind, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        let counter = match route {
            RouteKind::Remote => &self.remote_transfers,
            RouteKind::LocalThread => &self.local_transfers,
            RouteKind::IntraTask => &self.intra_task_transfers,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn sequence_error(&self) {
        self.sequence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancelled(&self, count: u64) {
        self.cancellations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_inserted: self.frames_inserted.load(Ordering::Relaxed),
            frames_extracted: self.frames_extracted.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            remote_transfers: self.remote_transfers.load(Ordering::Relaxed),
            local_transfers: self.local_transfers.load(Ordering::Relaxed),
            intra_task_transfers: self.intra_task_transfers.load(Ordering::Relaxed),
            sequence_errors: self.sequence_errors.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.started.elapsed();
        let s = self.snapshot();
        eprintln!();
        eprintln!("=== Conduit Transfer Stats ===");

        for (name, dur) in lock(&self.phases).iter() {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        eprintln!("  Frames inserted:        {}", s.frames_inserted);
        eprintln!("  Frames extracted:       {}", s.frames_extracted);
        eprintln!("  Transfers:              remote={}  local={}  intra-task={}",
            s.remote_transfers, s.local_transfers, s.intra_task_transfers);
        eprintln!("  Bytes:                  sent={}  received={}", s.bytes_sent, s.bytes_received);

        if s.sequence_errors > 0 {
            eprintln!("  Sequence errors:        {}", s.sequence_errors);
        }
        if s.cancellations > 0 {
            eprintln!("  Cancelled transfers:    {}", s.cancellations);
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}
