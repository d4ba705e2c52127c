use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness reported for one registered descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    pub fn is_idle(&self) -> bool {
        !(self.readable || self.writable || self.hangup || self.error)
    }
}

/// `poll(2)` over a descriptor list rebuilt every tick.
#[derive(Default)]
pub struct Poller {
    fds: Vec<libc::pollfd>,
}

impl Poller {
    pub fn with_capacity(n: usize) -> Self {
        Poller { fds: Vec::with_capacity(n) }
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Registers `fd`; the returned index addresses its readiness after `wait`.
    pub fn register(&mut self, fd: RawFd, want_write: bool) -> usize {
        let events = if want_write { libc::POLLOUT } else { libc::POLLIN };
        self.fds.push(libc::pollfd { fd, events, revents: 0 });
        self.fds.len() - 1
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Blocks for at most `timeout`. Returns the number of ready descriptors;
    /// an interrupted wait counts as none ready.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ret = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(ret as usize)
    }

    pub fn readiness(&self, index: usize) -> Readiness {
        let Some(pfd) = self.fds.get(index) else {
            return Readiness::default();
        };
        let r = pfd.revents;
        Readiness {
            readable: r & libc::POLLIN != 0,
            writable: r & libc::POLLOUT != 0,
            hangup: r & libc::POLLHUP != 0,
            error: r & (libc::POLLERR | libc::POLLNVAL) != 0,
        }
    }
}
