//! Per-instance counters for producers and consumers.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ConsumerStats {
    fetched: AtomicU64,
    fetch_errors: AtomicU64,
    decode_errors: AtomicU64,
    handled: AtomicU64,
    handler_errors: AtomicU64,
    committed: AtomicU64,
    commit_errors: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub fetched: u64,
    pub fetch_errors: u64,
    pub decode_errors: u64,
    pub handled: u64,
    /// Failed handler attempts, including ones that later succeeded.
    pub handler_errors: u64,
    pub committed: u64,
    pub commit_errors: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub(crate) fn record_fetch(&self, ok: bool) {
        if ok {
            self.fetched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fetch_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handle(&self, ok: bool) {
        if ok {
            self.handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.handler_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_commit(&self, ok: bool) {
        if ok {
            self.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commit_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            commit_errors: self.commit_errors.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProducerStats {
    records: AtomicU64,
    bytes: AtomicU64,
    framed: AtomicU64,
    write_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStatsSnapshot {
    pub records: u64,
    pub bytes: u64,
    /// Records written with registry framing.
    pub framed: u64,
    pub write_errors: u64,
}

impl ProducerStats {
    pub(crate) fn record_write(&self, records: usize, bytes: usize, framed: usize) {
        self.records.fetch_add(records as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.framed.fetch_add(framed as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            records: self.records.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            framed: self.framed.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}
