// Per-connection traffic counters, mirrored to the `metrics` facade.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ConnectionStats {
    created_at: Instant,
    ops_received: AtomicU64,
    // Nanoseconds after `created_at`; 0 until the first op arrives.
    last_op_received_ns: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    heartbeats_sent: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub ops_received: u64,
    pub last_op_received_at: Option<Instant>,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub heartbeats_sent: u64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            created_at: Instant::now(),
            ops_received: AtomicU64::new(0),
            last_op_received_ns: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
        }
    }
}

impl ConnectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let last_ns = self.last_op_received_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            ops_received: self.ops_received.load(Ordering::Relaxed),
            last_op_received_at: (last_ns > 0)
                .then(|| self.created_at + Duration::from_nanos(last_ns)),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_bytes_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("natter_client_bytes_in_total").increment(bytes as u64);
    }

    pub(crate) fn record_op_received(&self) {
        self.ops_received.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.created_at.elapsed().as_nanos().max(1);
        self.last_op_received_ns
            .store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::Relaxed);
        metrics::counter!("natter_client_ops_in_total").increment(1);
    }

    pub(crate) fn record_frame_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("natter_client_frames_out_total").increment(1);
        metrics::counter!("natter_client_bytes_out_total").increment(bytes as u64);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("natter_client_heartbeats_total").increment(1);
    }
}
