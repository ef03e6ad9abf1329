//! Bridges POSIX signals into readable events on the readiness loop.
//!
//! `{SIGTERM, SIGINT, SIGCHLD, AIO_SIGNAL}` are blocked at the process level
//! and delivered through a `signalfd(2)` registered like any other mio
//! source. SIGPIPE is ignored once, process-wide — the only truly
//! process-wide signal policy; everything else lives on the per-loop
//! bridge and is torn down with it.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Mutex, OnceLock};

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::net::buffer::Buffer;

static AIO_SIGNAL_CELL: OnceLock<i32> = OnceLock::new();

/// Real-time signal used to notify completion of an AIO operation.
///
/// `libc::SIGRTMIN()` reads `/proc` the first time it's called (its value
/// depends on glibc's reserved range), so it's resolved once and cached
/// rather than re-queried per signal.
pub fn aio_signal() -> i32 {
    *AIO_SIGNAL_CELL.get_or_init(libc::SIGRTMIN)
}

/// Ask the current process's accept loop to shut down. Safe to call from
/// any thread, or from a signal handler: it only raises `SIGTERM` on the
/// calling process, which `SignalBridge` already blocks and delivers
/// through the readiness loop as an ordinary wake-up, same as a `SIGTERM`
/// sent by an external `kill`.
pub fn stop() {
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }
}

static SIGPIPE_IGNORED: Mutex<bool> = Mutex::new(false);

/// Ignore `SIGPIPE` for the whole process. Idempotent; safe to call more
/// than once (e.g. once per worker after fork).
pub fn ignore_sigpipe() {
    let mut guard = SIGPIPE_IGNORED.lock().unwrap();
    if *guard {
        return;
    }
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    *guard = true;
}

/// One structured record drained from the signal fd.
#[derive(Debug, Clone, Copy)]
pub enum SignalRecord {
    Terminate,
    ChildReaped,
    AioCompleted { record_id: usize },
}

/// A readable descriptor that yields structured signal records.
pub struct SignalBridge {
    fd: RawFd,
    /// Bytes read from the signalfd that didn't form a whole
    /// `signalfd_siginfo` record yet — kept for the next drain.
    pending: Buffer,
}

const SIGINFO_SIZE: usize = mem::size_of::<libc::signalfd_siginfo>();

impl SignalBridge {
    /// Blocks the bridged signals at the process level and creates the
    /// signalfd. Must be (re-)created after every `fork()` — children do
    /// not inherit the parent's bridge descriptor across this call, since
    /// each process needs its own copy of the pending-signal mask state.
    pub fn new() -> io::Result<Self> {
        let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGTERM);
            libc::sigaddset(&mut mask, libc::SIGINT);
            libc::sigaddset(&mut mask, libc::SIGCHLD);
            libc::sigaddset(&mut mask, aio_signal());

            if libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            pending: Buffer::new(),
        })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        SourceFd(&self.fd).register(registry, token, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.fd).deregister(registry)
    }

    /// Drain every whole `signalfd_siginfo` record currently available,
    /// translating each into a `SignalRecord`. Partial trailing bytes are
    /// retained for the next call.
    pub fn drain(&mut self) -> io::Result<Vec<SignalRecord>> {
        let mut out = Vec::new();

        loop {
            self.pending.reserve_back(4096);
            let spare = self.pending.spare_capacity_mut();
            let read_len = spare.len().min(4096);
            let rc = unsafe {
                libc::read(
                    self.fd,
                    spare.as_mut_ptr() as *mut libc::c_void,
                    read_len,
                )
            };

            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(err);
            }
            if rc == 0 {
                break;
            }

            unsafe {
                self.pending.extend_len(rc as usize);
            }

            if (rc as usize) < read_len {
                // Short read means the fd drained to would-block for now.
                break;
            }
        }

        let mut consumed = 0;
        while self.pending.len() - consumed >= SIGINFO_SIZE {
            let bytes = &self.pending.as_slice()[consumed..consumed + SIGINFO_SIZE];
            let info: libc::signalfd_siginfo =
                unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
            consumed += SIGINFO_SIZE;

            out.push(translate(&info));
        }

        if consumed > 0 {
            self.pending.erase_front(consumed);
        }

        Ok(out)
    }
}

fn translate(info: &libc::signalfd_siginfo) -> SignalRecord {
    match info.ssi_signo as i32 {
        libc::SIGTERM | libc::SIGINT => SignalRecord::Terminate,
        libc::SIGCHLD => SignalRecord::ChildReaped,
        signo if signo == aio_signal() => SignalRecord::AioCompleted {
            record_id: info.ssi_ptr as usize,
        },
        other => {
            debug!(signo = other, "unexpected signal in bridge");
            SignalRecord::Terminate
        }
    }
}

impl AsRawFd for SignalBridge {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Reap all pending zombie children non-blockingly, invoking `on_reaped`
/// for each one's pid. Used by the acceptor after a `SignalRecord::ChildReaped`.
pub fn reap_zombies(mut on_reaped: impl FnMut(libc::pid_t)) {
    loop {
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        on_reaped(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_sigpipe_is_idempotent() {
        ignore_sigpipe();
        ignore_sigpipe();
    }

    #[test]
    fn bridge_creation_blocks_signals_and_opens_fd() {
        let bridge = SignalBridge::new().unwrap();
        assert!(bridge.as_raw_fd() >= 0);
    }

    #[test]
    fn drain_with_nothing_pending_returns_empty() {
        let mut bridge = SignalBridge::new().unwrap();
        let records = bridge.drain().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn sigterm_self_signal_is_observed_as_terminate() {
        let mut bridge = SignalBridge::new().unwrap();
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        let records = bridge.drain().unwrap();
        assert!(records
            .iter()
            .any(|r| matches!(r, SignalRecord::Terminate)));
    }

    #[test]
    fn stop_is_observed_as_terminate() {
        let mut bridge = SignalBridge::new().unwrap();
        stop();
        let records = bridge.drain().unwrap();
        assert!(records
            .iter()
            .any(|r| matches!(r, SignalRecord::Terminate)));
    }
}
