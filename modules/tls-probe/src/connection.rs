use crate::capability::{HandshakeCapability, Progress};
use observatory_core::{unix_millis, ResultCode, ScanOutcome};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Handshaking,
    Complete,
    TimedOut,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::TimedOut)
    }
}

/// Socket readiness or I/O result, fed in by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    Tick,
    Writable,
    Readable(&'a [u8]),
    Hangup,
    Error,
    SendFailed,
}

/// What the worker must do with the socket next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Send(Vec<u8>),
    Close,
}

/// One probe: connect, send the ClientHello, capture the server's reply.
///
/// The machine owns no socket. `transition` is a pure function of the event,
/// the clock and the handshake capability, so it never blocks.
pub struct ConnectionState {
    address: u32,
    port: u16,
    phase: Phase,
    raw: Vec<u8>,
    changed_at: Instant,
    timeout: Duration,
    result: Option<ResultCode>,
    capability: Box<dyn HandshakeCapability + Send>,
}

impl ConnectionState {
    pub fn new(address: u32, port: u16, capability: Box<dyn HandshakeCapability + Send>, timeout: Duration, now: Instant) -> Self {
        ConnectionState { address, port, phase: Phase::Connecting, raw: Vec::new(), changed_at: now, timeout, result: None, capability }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Readiness the worker should poll for.
    pub fn wants_write(&self) -> bool {
        self.phase == Phase::Connecting
    }

    pub fn transition(&mut self, event: Event<'_>, now: Instant) -> Action {
        if self.phase.is_terminal() {
            return Action::None;
        }
        match (self.phase, event) {
            (_, Event::Tick) => {
                if now.duration_since(self.changed_at) > self.timeout {
                    let code = match self.phase {
                        Phase::Connecting => ResultCode::TcpHandshakeTimeout,
                        _ => ResultCode::TlsHandshakeTimeout,
                    };
                    self.phase = Phase::TimedOut;
                    self.result = Some(code);
                    return Action::Close;
                }
                Action::None
            }
            (_, Event::SendFailed) => {
                let code = if self.raw.is_empty() { ResultCode::ConnectFailed } else { ResultCode::TlsError };
                self.finish(code)
            }
            (Phase::Connecting, Event::Writable) => self.start_handshake(now),
            (Phase::Connecting, Event::Error | Event::Hangup) => self.finish(ResultCode::ConnectFailed),
            (Phase::Handshaking, Event::Readable(bytes)) => self.absorb(bytes, now),
            (Phase::Handshaking, Event::Error | Event::Hangup) => self.finish(ResultCode::TlsError),
            // readable before our hello went out, or writable again while waiting
            _ => Action::None,
        }
    }

    fn start_handshake(&mut self, now: Instant) -> Action {
        if let Err(e) = self.capability.initiate() {
            tracing::debug!(error = %e, "handshake initiate failed");
            return self.finish(ResultCode::TlsError);
        }
        if self.capability.step() == Progress::Failed {
            return self.finish(ResultCode::TlsError);
        }
        let hello = self.capability.pending_output();
        if hello.is_empty() {
            return self.finish(ResultCode::TlsError);
        }
        self.phase = Phase::Handshaking;
        self.changed_at = now;
        Action::Send(hello)
    }

    fn absorb(&mut self, bytes: &[u8], now: Instant) -> Action {
        self.raw.extend_from_slice(bytes);
        self.capability.feed_input(bytes);
        match self.capability.step() {
            Progress::Done => self.finish(ResultCode::TlsHandshakeCompleted),
            Progress::Failed => self.finish(ResultCode::TlsError),
            Progress::AwaitingInput => {
                let out = self.capability.pending_output();
                if out.is_empty() {
                    return Action::None;
                }
                self.changed_at = now;
                Action::Send(out)
            }
        }
    }

    fn finish(&mut self, code: ResultCode) -> Action {
        self.phase = Phase::Complete;
        self.result = Some(code);
        Action::Close
    }

    /// Moves the outcome out once the machine is terminal.
    pub fn take_outcome(&mut self) -> Option<ScanOutcome> {
        if !self.phase.is_terminal() {
            return None;
        }
        let result = self.result.take()?;
        Some(ScanOutcome {
            address: self.address,
            port: self.port,
            result,
            raw: std::mem::take(&mut self.raw),
            fetched_at_ms: unix_millis(),
        })
    }
}
