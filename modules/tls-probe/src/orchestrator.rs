use crate::capability::HandshakeFactory;
use crate::progress::{ProgressSnapshot, ScanProgress};
use crate::worker::{ScanWorker, WorkerConfig, WorkerReport};
use anyhow::{anyhow, Context, Result};
use observatory_core::{RawResultSink, TransactionWindow};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sweep::Sweeper;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub workers: usize,
    pub worker: WorkerConfig,
    /// Maximum age of an open raw-result transaction.
    pub commit_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig { workers: 4, worker: WorkerConfig::default(), commit_interval: Duration::from_millis(5000) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub workers: usize,
    pub seed: u64,
    pub total_addresses: u64,
    pub elapsed_ms: u64,
    pub interrupted: bool,
    pub progress: ProgressSnapshot,
    pub reports: Vec<WorkerReport>,
}

/// Splits the sweep into one shard per worker thread and runs them to completion.
pub struct Orchestrator {
    sweeper: Sweeper,
    config: ScanConfig,
    progress: Arc<ScanProgress>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(sweeper: Sweeper, config: ScanConfig) -> Self {
        Orchestrator { sweeper, config, progress: Arc::new(ScanProgress::new()), shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn progress(&self) -> Arc<ScanProgress> {
        self.progress.clone()
    }

    /// Setting the flag stops every worker after its current tick.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Blocks until all workers finish; returns the summary and the sink
    /// after the last transaction was committed.
    pub fn run<S>(self, sink: S, factory: Arc<dyn HandshakeFactory>) -> Result<(ScanSummary, S)>
    where
        S: RawResultSink + Send + 'static,
    {
        let started = Instant::now();
        let workers = self.config.workers.max(1);
        let shards = (0..workers)
            .map(|i| self.sweeper.get_slice(workers, i))
            .collect::<Result<Vec<_>, _>>()?;
        let window = Arc::new(Mutex::new(TransactionWindow::new(sink, self.config.commit_interval)));
        tracing::info!(workers, total = self.sweeper.total_length(), seed = self.sweeper.seed(), "scan starting");

        let mut handles = Vec::with_capacity(workers);
        for (i, shard) in shards.into_iter().enumerate() {
            let worker = ScanWorker::new(
                i,
                shard,
                self.config.worker.clone(),
                factory.clone(),
                window.clone(),
                self.progress.clone(),
                self.shutdown.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("scan-worker-{i}"))
                .spawn(move || worker.run())
                .with_context(|| format!("spawn scan worker {i}"))?;
            handles.push(handle);
        }

        let mut reports = Vec::with_capacity(workers);
        let mut failure = None;
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    tracing::error!(worker = i, error = %e, "worker failed");
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    tracing::error!(worker = i, "worker panicked");
                    failure.get_or_insert(anyhow!("scan worker {i} panicked"));
                }
            }
        }

        let window = Arc::try_unwrap(window).map_err(|_| anyhow!("result sink still shared after workers exited"))?;
        let mut window = window.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.flush().context("final commit of raw results")?;
        if let Some(e) = failure {
            return Err(e);
        }

        let summary = ScanSummary {
            workers,
            seed: self.sweeper.seed(),
            total_addresses: self.sweeper.total_length(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            interrupted: reports.iter().any(|r| r.interrupted),
            progress: self.progress.snapshot(),
            reports,
        };
        tracing::info!(
            attempted = summary.progress.attempted,
            completed = summary.progress.completed,
            stored = summary.progress.stored,
            elapsed_ms = summary.elapsed_ms,
            "scan finished"
        );
        Ok((summary, window.into_inner()))
    }
}
