//! Shared transfer counters.
//!
//! One [`Metrics`] value is shared by every stage; workers bump counters with relaxed atomics and
//! the progress display samples them on its own cadence.  The `downloaded`/`scanned`/`uploaded`
//! counters are monotone; the totals may be revised downward by the reader when resume or subset
//! filtering removes work from the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct Metrics {
    total_files: AtomicU64,
    total_bytes: AtomicU64,

    downloaded_files: AtomicU64,
    downloaded_bytes: AtomicU64,

    scanned_files: AtomicU64,

    /// Segments uploaded to the destination bucket.
    uploaded_files: AtomicU64,
    /// Source objects contained in uploaded segments.
    uploaded_archived_files: AtomicU64,
    uploaded_bytes: AtomicU64,

    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            total_files: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            downloaded_files: AtomicU64::new(0),
            downloaded_bytes: AtomicU64::new(0),
            scanned_files: AtomicU64::new(0),
            uploaded_files: AtomicU64::new(0),
            uploaded_archived_files: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_totals(&self, files: u64, bytes: u64) {
        self.total_files.store(files, Ordering::Relaxed);
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Remove an already-archived entry from the advertised totals.
    pub(crate) fn discount_total(&self, bytes: u64) {
        self.total_files.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_downloaded_bytes(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_downloaded_file(&self) {
        self.downloaded_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_scanned_file(&self) {
        self.scanned_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_uploaded_bytes(&self, bytes: u64) {
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_uploaded_segment(&self, archived_files: u64) {
        self.uploaded_files.fetch_add(1, Ordering::Relaxed);
        self.uploaded_archived_files
            .fetch_add(archived_files, Ordering::Relaxed);
    }

    /// Lock-free snapshot for the progress display.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_files: self.total_files.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            downloaded_files: self.downloaded_files.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            scanned_files: self.scanned_files.load(Ordering::Relaxed),
            uploaded_files: self.uploaded_files.load(Ordering::Relaxed),
            uploaded_archived_files: self.uploaded_archived_files.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// A point-in-time copy of the counters.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub total_files: u64,
    pub total_bytes: u64,
    pub downloaded_files: u64,
    pub downloaded_bytes: u64,
    pub scanned_files: u64,
    pub uploaded_files: u64,
    pub uploaded_archived_files: u64,
    pub uploaded_bytes: u64,
    pub elapsed: std::time::Duration,
}

impl MetricsSnapshot {
    /// Estimated time remaining for the download leg, based on the average rate so far.
    pub fn eta(&self) -> Option<std::time::Duration> {
        if self.downloaded_bytes == 0
            || self.total_bytes == 0
            || self.downloaded_bytes >= self.total_bytes
        {
            return None;
        }

        let rate = self.downloaded_bytes as f64 / self.elapsed.as_secs_f64();
        if rate <= 0.0 {
            return None;
        }

        let remaining = (self.total_bytes - self.downloaded_bytes) as f64 / rate;
        Some(std::time::Duration::from_secs_f64(remaining))
    }
}
