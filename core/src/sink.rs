//! Storage seams and the time-boxed transaction policy shared by both stages.

use crate::outcome::{CertificateRecord, ScanOutcome};
use anyhow::Result;
use std::time::{Duration, Instant};

/// Explicit transaction control. Inserts between `begin` and `commit` are batched.
pub trait Transactional {
    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
}

/// Destination for raw scan outcomes (`raw_data` rows).
pub trait RawResultSink: Transactional {
    fn insert_raw(&mut self, outcome: &ScanOutcome) -> Result<()>;
}

/// Destination for unique, classified certificates.
pub trait CertificateSink: Transactional {
    fn insert_certificate(&mut self, record: &CertificateRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub stored: u64,
    pub failed: u64,
}

/// Keeps one transaction open across many inserts and commits it once it has
/// been open for `max_age`. Callers check the age after each batch and call
/// `flush` when they are done.
pub struct TransactionWindow<S> {
    sink: S,
    opened_at: Option<Instant>,
    max_age: Duration,
}

impl<S: Transactional> TransactionWindow<S> {
    pub fn new(sink: S, max_age: Duration) -> Self {
        TransactionWindow { sink, opened_at: None, max_age }
    }

    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Returns the sink without committing; call `flush` first.
    pub fn into_inner(self) -> S {
        self.sink
    }

    pub fn ensure_open(&mut self, now: Instant) -> Result<()> {
        if self.opened_at.is_none() {
            self.sink.begin_transaction()?;
            self.opened_at = Some(now);
        }
        Ok(())
    }

    /// Commits when the open transaction has reached `max_age`. Returns whether it committed.
    pub fn commit_if_due(&mut self, now: Instant) -> Result<bool> {
        match self.opened_at {
            Some(opened) if now.duration_since(opened) >= self.max_age => {
                self.flush()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Commits the open transaction. A failed commit leaves it open, so the
    /// next due check retries instead of beginning a nested transaction.
    pub fn flush(&mut self) -> Result<()> {
        if self.opened_at.is_some() {
            self.sink.commit_transaction()?;
            self.opened_at = None;
        }
        Ok(())
    }
}

impl<S: RawResultSink> TransactionWindow<S> {
    /// Best-effort insert of one tick's outcomes. Failures are logged and counted.
    pub fn store_outcomes(&mut self, outcomes: &[ScanOutcome], now: Instant) -> BatchReport {
        let mut report = BatchReport::default();
        if outcomes.is_empty() {
            return report;
        }
        if let Err(e) = self.ensure_open(now) {
            tracing::warn!(error = %e, rows = outcomes.len(), "begin transaction failed, dropping batch");
            report.failed = outcomes.len() as u64;
            return report;
        }
        for outcome in outcomes {
            match self.sink.insert_raw(outcome) {
                Ok(()) => report.stored += 1,
                Err(e) => {
                    tracing::warn!(error = %e, ip = %crate::format_ipv4(outcome.address), "raw insert failed");
                    report.failed += 1;
                }
            }
        }
        if let Err(e) = self.commit_if_due(now) {
            tracing::warn!(error = %e, "commit failed");
        }
        report
    }
}

impl<S: CertificateSink> TransactionWindow<S> {
    pub fn store_certificate(&mut self, record: &CertificateRecord, now: Instant) -> Result<()> {
        self.ensure_open(now)?;
        let inserted = self.sink.insert_certificate(record);
        if let Err(e) = self.commit_if_due(now) {
            tracing::warn!(error = %e, "commit failed");
        }
        inserted
    }
}
