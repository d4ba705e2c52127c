use observatory_core::ResultCode;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scan counters shared by all workers. Relaxed ordering: read for reporting only.
#[derive(Debug, Default)]
pub struct ScanProgress {
    attempted: AtomicU64,
    connect_failed: AtomicU64,
    tcp_timeout: AtomicU64,
    completed: AtomicU64,
    tls_timeout: AtomicU64,
    tls_error: AtomicU64,
    stored: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub attempted: u64,
    pub connect_failed: u64,
    pub tcp_timeout: u64,
    pub completed: u64,
    pub tls_timeout: u64,
    pub tls_error: u64,
    pub stored: u64,
    pub store_failures: u64,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> u64 {
        self.connect_failed + self.tcp_timeout + self.completed + self.tls_timeout + self.tls_error
    }
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result(&self, code: ResultCode) {
        let counter = match code {
            ResultCode::ConnectFailed => &self.connect_failed,
            ResultCode::TcpHandshakeTimeout => &self.tcp_timeout,
            ResultCode::TlsHandshakeCompleted => &self.completed,
            ResultCode::TlsHandshakeTimeout => &self.tls_timeout,
            ResultCode::TlsError => &self.tls_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self, stored: u64, failed: u64) {
        self.stored.fetch_add(stored, Ordering::Relaxed);
        self.store_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            connect_failed: self.connect_failed.load(Ordering::Relaxed),
            tcp_timeout: self.tcp_timeout.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            tls_timeout: self.tls_timeout.load(Ordering::Relaxed),
            tls_error: self.tls_error.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}
