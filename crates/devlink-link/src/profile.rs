//! Per-link traffic counters.
//!
//! Counting is off until [`LinkProfiler::start`]. Only packets moved through
//! [`Link::write`](crate::Link::write) and [`Link::read`](crate::Link::read)
//! (and their timeout variants) are counted; acknowledgements and control
//! traffic are not.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

use crate::types::LinkId;

/// Counters captured at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub packets_written: u64,
    pub bytes_written: u64,
    /// Time spent inside successful writes, flow-control waits included.
    pub write_time: Duration,
    pub packets_read: u64,
    pub bytes_read: u64,
    /// Time spent inside successful reads, blocking included.
    pub read_time: Duration,
    /// Wall time the profiler has been running.
    pub elapsed: Duration,
}

impl ProfileSnapshot {
    /// Bytes per second over the time spent writing, or 0 with no writes.
    pub fn write_throughput(&self) -> f64 {
        rate(self.bytes_written, self.write_time)
    }

    /// Bytes per second over the time spent reading, or 0 with no reads.
    pub fn read_throughput(&self) -> f64 {
        rate(self.bytes_read, self.read_time)
    }
}

fn rate(bytes: u64, time: Duration) -> f64 {
    let secs = time.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    /// Running time of earlier start/stop windows.
    accumulated: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct LinkProfiler {
    enabled: AtomicBool,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    write_nanos: AtomicU64,
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    read_nanos: AtomicU64,
    window: Mutex<Window>,
}

impl LinkProfiler {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Start counting. Counters keep their values across stop and start.
    pub fn start(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if self.enabled.swap(true, Ordering::AcqRel) {
            return false;
        }
        window.started = Some(Instant::now());
        true
    }

    pub fn stop(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(started) = window.started.take() {
            window.accumulated += started.elapsed();
        }
        true
    }

    pub fn record_write(&self, bytes: usize, took: Duration) {
        if self.is_enabled() {
            self.packets_written.fetch_add(1, Ordering::Relaxed);
            self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
            self.write_nanos.fetch_add(nanos(took), Ordering::Relaxed);
        }
    }

    pub fn record_read(&self, bytes: usize, took: Duration) {
        if self.is_enabled() {
            self.packets_read.fetch_add(1, Ordering::Relaxed);
            self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
            self.read_nanos.fetch_add(nanos(took), Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let elapsed = {
            let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            window.accumulated + window.started.map_or(Duration::ZERO, |at| at.elapsed())
        };
        ProfileSnapshot {
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_time: Duration::from_nanos(self.write_nanos.load(Ordering::Relaxed)),
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            read_time: Duration::from_nanos(self.read_nanos.load(Ordering::Relaxed)),
            elapsed,
        }
    }

    /// Emit the current counters as one `info` event and return them.
    pub fn print(&self, link: LinkId) -> ProfileSnapshot {
        let snap = self.snapshot();
        info!(
            %link,
            running = self.is_enabled(),
            packets_written = snap.packets_written,
            bytes_written = snap.bytes_written,
            write_time = ?snap.write_time,
            write_bps = snap.write_throughput(),
            packets_read = snap.packets_read,
            bytes_read = snap.bytes_read,
            read_time = ?snap.read_time,
            read_bps = snap.read_throughput(),
            elapsed = ?snap.elapsed,
            "link profile"
        );
        snap
    }
}

fn nanos(took: Duration) -> u64 {
    u64::try_from(took.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_counts_until_started() {
        let prof = LinkProfiler::default();
        prof.record_write(100, Duration::from_millis(1));
        assert_eq!(prof.snapshot(), ProfileSnapshot::default());

        assert!(prof.start());
        assert!(!prof.start());
        prof.record_write(100, Duration::from_millis(2));
        prof.record_read(40, Duration::from_millis(1));
        assert!(prof.stop());
        assert!(!prof.stop());
        prof.record_read(40, Duration::from_millis(1));

        let snap = prof.snapshot();
        assert_eq!(snap.packets_written, 1);
        assert_eq!(snap.bytes_written, 100);
        assert_eq!(snap.write_time, Duration::from_millis(2));
        assert_eq!(snap.packets_read, 1);
        assert_eq!(snap.bytes_read, 40);
        assert_eq!(snap.write_throughput(), 50_000.0);
    }

    #[test]
    fn elapsed_freezes_while_stopped() {
        let prof = LinkProfiler::default();
        prof.start();
        std::thread::sleep(Duration::from_millis(5));
        prof.stop();
        let first = prof.snapshot().elapsed;
        assert!(first >= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(prof.snapshot().elapsed, first);
        assert_eq!(ProfileSnapshot::default().read_throughput(), 0.0);
    }
}
