//! Outcome counters for batch commands.
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

/// Counts per-item outcomes of a batch, shared across worker threads.
#[derive(Debug, Default)]
pub struct Counter {
    ok: AtomicUsize,
    skipped: AtomicUsize,
    error: AtomicUsize,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_ok(&self) {
        self.ok.fetch_add(1, SeqCst);
    }

    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, SeqCst);
    }

    pub fn inc_error(&self) {
        self.error.fetch_add(1, SeqCst);
    }

    pub fn errors(&self) -> usize {
        self.error.load(SeqCst)
    }

    pub fn oks(&self) -> usize {
        self.ok.load(SeqCst)
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OK: {}, Skipped: {}, Error: {}",
            self.ok.load(SeqCst),
            self.skipped.load(SeqCst),
            self.error.load(SeqCst),
        )
    }
}
