use crate::capability::HandshakeFactory;
use crate::connection::{Action, ConnectionState, Event};
use crate::poller::{Poller, Readiness};
use crate::progress::ScanProgress;
use crate::socket::{ProbeSocket, ReadStatus};
use anyhow::Result;
use observatory_core::{unix_millis, RawResultSink, ResultCode, ScanOutcome, TransactionWindow};
use serde::Serialize;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sweep::{SweepError, Sweeper};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Persist hosts that never completed the TCP handshake.
    pub store_unanswered: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            port: 443,
            max_connections: 1024,
            timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            store_unanswered: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub attempted: u64,
    pub finished: u64,
    pub dropped_in_flight: usize,
    pub interrupted: bool,
}

struct Slot {
    state: ConnectionState,
    socket: ProbeSocket,
    poll_index: usize,
}

/// Drives up to `max_connections` probes from one shard.
pub struct ScanWorker<S> {
    id: usize,
    shard: Sweeper,
    config: WorkerConfig,
    factory: Arc<dyn HandshakeFactory>,
    sink: Arc<Mutex<TransactionWindow<S>>>,
    progress: Arc<ScanProgress>,
    shutdown: Arc<AtomicBool>,
    slots: Vec<Slot>,
    poller: Poller,
    report: WorkerReport,
}

impl<S: RawResultSink> ScanWorker<S> {
    pub fn new(
        id: usize,
        shard: Sweeper,
        mut config: WorkerConfig,
        factory: Arc<dyn HandshakeFactory>,
        sink: Arc<Mutex<TransactionWindow<S>>>,
        progress: Arc<ScanProgress>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        config.max_connections = config.max_connections.max(1);
        let capacity = config.max_connections;
        ScanWorker {
            id,
            shard,
            config,
            factory,
            sink,
            progress,
            shutdown,
            slots: Vec::with_capacity(capacity),
            poller: Poller::with_capacity(capacity),
            report: WorkerReport { worker: id, ..Default::default() },
        }
    }

    /// Runs until the shard is drained and every slot finished, or until shutdown.
    pub fn run(mut self) -> Result<WorkerReport> {
        let (start, end) = self.shard.window();
        tracing::debug!(worker = self.id, start, end, "worker started");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.report.interrupted = true;
                self.report.dropped_in_flight = self.slots.len();
                tracing::info!(worker = self.id, dropped = self.slots.len(), "worker stopping on shutdown");
                self.slots.clear();
                break;
            }
            let mut outcomes = Vec::new();
            self.fill(&mut outcomes)?;
            if self.slots.is_empty() && self.shard.has_range_finished() {
                self.persist(outcomes);
                break;
            }
            self.tick();
            self.harvest(&mut outcomes);
            self.persist(outcomes);
        }
        tracing::debug!(worker = self.id, attempted = self.report.attempted, "worker finished");
        Ok(self.report)
    }

    fn fill(&mut self, outcomes: &mut Vec<ScanOutcome>) -> Result<()> {
        while self.slots.len() < self.config.max_connections && !self.shard.has_range_finished() {
            let ip = match self.shard.get_ip() {
                Ok(ip) => ip,
                Err(SweepError::Exhausted) => break,
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "address sweep failed");
                    return Err(e.into());
                }
            };
            self.report.attempted += 1;
            self.progress.record_attempt();
            let address = u32::from(ip);
            let capability = match self.factory.create(ip) {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(%ip, error = %e, "handshake setup failed");
                    self.finish_now(outcomes, address, ResultCode::TlsError);
                    continue;
                }
            };
            let socket = match ProbeSocket::connect(SocketAddrV4::new(ip, self.config.port)) {
                Ok(s) => s,
                Err(e) => {
                    tracing::trace!(%ip, error = %e, "connect failed");
                    self.finish_now(outcomes, address, ResultCode::ConnectFailed);
                    continue;
                }
            };
            let state = ConnectionState::new(address, self.config.port, capability, self.config.timeout, Instant::now());
            self.slots.push(Slot { state, socket, poll_index: 0 });
        }
        Ok(())
    }

    fn finish_now(&mut self, outcomes: &mut Vec<ScanOutcome>, address: u32, result: ResultCode) {
        self.report.finished += 1;
        self.progress.record_result(result);
        outcomes.push(ScanOutcome { address, port: self.config.port, result, raw: Vec::new(), fetched_at_ms: unix_millis() });
    }

    fn tick(&mut self) {
        self.poller.clear();
        for slot in &mut self.slots {
            slot.poll_index = self.poller.register(slot.socket.as_raw_fd(), slot.state.wants_write());
        }
        if let Err(e) = self.poller.wait(self.config.poll_interval) {
            tracing::warn!(worker = self.id, error = %e, "poll failed");
        }
        let now = Instant::now();
        for slot in &mut self.slots {
            let readiness = self.poller.readiness(slot.poll_index);
            drive(slot, readiness, now);
        }
    }

    fn harvest(&mut self, outcomes: &mut Vec<ScanOutcome>) {
        let before = outcomes.len();
        self.slots.retain_mut(|slot| {
            if !slot.state.is_terminal() {
                return true;
            }
            if let Some(outcome) = slot.state.take_outcome() {
                outcomes.push(outcome);
            }
            false
        });
        for outcome in &outcomes[before..] {
            self.progress.record_result(outcome.result);
        }
        self.report.finished += (outcomes.len() - before) as u64;
    }

    fn persist(&self, mut outcomes: Vec<ScanOutcome>) {
        retain_storable(&mut outcomes, self.config.store_unanswered);
        if outcomes.is_empty() {
            return;
        }
        let mut window = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let report = window.store_outcomes(&outcomes, Instant::now());
        self.progress.record_stored(report.stored, report.failed);
    }
}

/// Drops unanswered-host outcomes unless they are to be kept.
pub fn retain_storable(outcomes: &mut Vec<ScanOutcome>, store_unanswered: bool) {
    if !store_unanswered {
        outcomes.retain(|o| o.result != ResultCode::TcpHandshakeTimeout);
    }
}

fn drive(slot: &mut Slot, readiness: Readiness, now: Instant) {
    if !readiness.is_idle() {
        let action = if slot.state.wants_write() {
            connect_event(slot, readiness, now)
        } else {
            read_event(slot, readiness, now)
        };
        apply(slot, action, now);
    }
    // bounds slots that keep receiving bytes without progress
    slot.state.transition(Event::Tick, now);
}

fn connect_event(slot: &mut Slot, readiness: Readiness, now: Instant) -> Action {
    if readiness.error || readiness.hangup {
        return slot.state.transition(Event::Error, now);
    }
    if !readiness.writable {
        return Action::None;
    }
    match slot.socket.take_error() {
        Ok(None) => slot.state.transition(Event::Writable, now),
        Ok(Some(_)) | Err(_) => slot.state.transition(Event::Error, now),
    }
}

fn read_event(slot: &mut Slot, readiness: Readiness, now: Instant) -> Action {
    if !(readiness.readable || readiness.hangup) {
        return if readiness.error { slot.state.transition(Event::Error, now) } else { Action::None };
    }
    let mut buf = Vec::new();
    match slot.socket.read_available(&mut buf) {
        Ok(status) => {
            let mut action = Action::None;
            if !buf.is_empty() {
                action = slot.state.transition(Event::Readable(&buf), now);
            }
            let end = match status {
                ReadStatus::Open => None,
                ReadStatus::Closed => Some(Event::Hangup),
                ReadStatus::Failed => Some(Event::Error),
            };
            if let Some(event) = end {
                if !slot.state.is_terminal() {
                    apply(slot, action, now);
                    action = slot.state.transition(event, now);
                }
            }
            action
        }
        Err(e) => {
            tracing::trace!(peer = %slot.socket.peer(), error = %e, "read failed");
            slot.state.transition(Event::Error, now)
        }
    }
}

fn apply(slot: &mut Slot, action: Action, now: Instant) {
    if let Action::Send(bytes) = action {
        match slot.socket.send(&bytes) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                slot.state.transition(Event::SendFailed, now);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::{HandshakeCapability, HandshakeError, Progress};
    use crate::connection::tests::Scripted;
    use observatory_core::Transactional;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};

    #[derive(Default, Debug)]
    pub(crate) struct MemorySink {
        pub rows: Vec<ScanOutcome>,
        pub commits: usize,
    }

    impl Transactional for MemorySink {
        fn begin_transaction(&mut self) -> Result<()> {
            Ok(())
        }
        fn commit_transaction(&mut self) -> Result<()> {
            self.commits += 1;
            Ok(())
        }
    }

    impl RawResultSink for MemorySink {
        fn insert_raw(&mut self, outcome: &ScanOutcome) -> Result<()> {
            self.rows.push(outcome.clone());
            Ok(())
        }
    }

    /// Sends a fixed hello and reports `Done` on the first byte received.
    pub(crate) struct ScriptedFactory;

    impl HandshakeFactory for ScriptedFactory {
        fn create(&self, _address: Ipv4Addr) -> Result<Box<dyn HandshakeCapability + Send>, HandshakeError> {
            let mut s = Scripted::default();
            s.steps.extend([Progress::AwaitingInput, Progress::Done]);
            s.outputs.push_back(b"HELLO".to_vec());
            Ok(Box::new(s))
        }
    }

    fn localhost_sweeper() -> Sweeper {
        let mut s = Sweeper::with_seed(1);
        s.add_range(Ipv4Addr::LOCALHOST, 32).unwrap();
        s
    }

    /// Sends a fixed hello and never reports progress on its own.
    struct PatientFactory;

    impl HandshakeFactory for PatientFactory {
        fn create(&self, _address: Ipv4Addr) -> Result<Box<dyn HandshakeCapability + Send>, HandshakeError> {
            let mut s = Scripted::default();
            s.outputs.push_back(b"HELLO".to_vec());
            Ok(Box::new(s))
        }
    }

    fn worker(port: u16, shutdown: bool) -> (ScanWorker<MemorySink>, Arc<Mutex<TransactionWindow<MemorySink>>>) {
        worker_with(port, shutdown, Arc::new(ScriptedFactory))
    }

    fn worker_with(
        port: u16,
        shutdown: bool,
        factory: Arc<dyn HandshakeFactory>,
    ) -> (ScanWorker<MemorySink>, Arc<Mutex<TransactionWindow<MemorySink>>>) {
        let sink = Arc::new(Mutex::new(TransactionWindow::new(MemorySink::default(), Duration::from_secs(5))));
        let config = WorkerConfig { port, timeout: Duration::from_secs(5), poll_interval: Duration::from_millis(20), ..Default::default() };
        let w = ScanWorker::new(
            0,
            localhost_sweeper(),
            config,
            factory,
            sink.clone(),
            Arc::new(ScanProgress::new()),
            Arc::new(AtomicBool::new(shutdown)),
        );
        (w, sink)
    }

    #[test]
    fn captures_server_reply() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hello = [0u8; 5];
            stream.read_exact(&mut hello).unwrap();
            stream.write_all(&[22, 3, 3, 0, 1, 11]).unwrap();
            hello
        });

        let (w, sink) = worker(port, false);
        let report = w.run().unwrap();
        assert_eq!(server.join().unwrap(), *b"HELLO");
        assert_eq!(report.attempted, 1);
        assert_eq!(report.finished, 1);

        let mut window = sink.lock().unwrap();
        window.flush().unwrap();
        let rows = &window.sink().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].result, ResultCode::TlsHandshakeCompleted);
        assert_eq!(rows[0].raw, vec![22, 3, 3, 0, 1, 11]);
        assert_eq!(rows[0].address, u32::from(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn reply_followed_by_reset_is_kept() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hello = [0u8; 5];
            stream.read_exact(&mut hello).unwrap();
            stream.write_all(&[21, 3, 3, 0, 2, 2, 40]).unwrap();
            socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO)).unwrap();
        });

        let (w, sink) = worker_with(port, false, Arc::new(PatientFactory));
        w.run().unwrap();
        server.join().unwrap();

        let mut window = sink.lock().unwrap();
        window.flush().unwrap();
        let rows = &window.sink().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].result, ResultCode::TlsError);
        assert_eq!(rows[0].raw, vec![21, 3, 3, 0, 2, 2, 40]);
    }

    #[test]
    fn sweep_failure_ends_the_worker_with_an_error() {
        let mut shard = Sweeper::with_seed(crate::orchestrator::tests::walking_seed()).with_cycle_cap(0);
        shard.add_cidr("127.0.1.0/29").unwrap();
        let sink = Arc::new(Mutex::new(TransactionWindow::new(MemorySink::default(), Duration::from_secs(5))));
        let w = ScanWorker::new(
            0,
            shard,
            WorkerConfig { port: 1, max_connections: 1, poll_interval: Duration::from_millis(10), ..Default::default() },
            Arc::new(ScriptedFactory),
            sink,
            Arc::new(ScanProgress::new()),
            Arc::new(AtomicBool::new(false)),
        );
        let err = w.run().unwrap_err();
        assert!(err.downcast_ref::<SweepError>().is_some_and(SweepError::is_fatal));
    }

    #[test]
    fn closed_port_is_connect_failed() {
        let port = {
            let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let (w, sink) = worker(port, false);
        w.run().unwrap();
        let window = sink.lock().unwrap();
        assert_eq!(window.sink().rows.len(), 1);
        assert_eq!(window.sink().rows[0].result, ResultCode::ConnectFailed);
    }

    #[test]
    fn shutdown_before_start_probes_nothing() {
        let (w, sink) = worker(1, true);
        let report = w.run().unwrap();
        assert!(report.interrupted);
        assert_eq!(report.attempted, 0);
        assert!(sink.lock().unwrap().sink().rows.is_empty());
    }

    #[test]
    fn unanswered_hosts_are_filtered_unless_requested() {
        let timeout = ScanOutcome { address: 1, port: 443, result: ResultCode::TcpHandshakeTimeout, raw: vec![], fetched_at_ms: 0 };
        let refused = ScanOutcome::connect_failed(2, 443, 0);
        let mut outcomes = vec![timeout.clone(), refused.clone()];
        retain_storable(&mut outcomes, false);
        assert_eq!(outcomes, vec![refused.clone()]);

        let mut outcomes = vec![timeout.clone(), refused.clone()];
        retain_storable(&mut outcomes, true);
        assert_eq!(outcomes.len(), 2);
    }
}
