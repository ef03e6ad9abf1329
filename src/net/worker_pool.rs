//! Fork/track/reap a pool of worker processes that share the listening
//! sockets with the main process.

use std::io;

use libc::pid_t;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Tracks child process ids owned by the main process.
///
/// `self_pid` is captured once at construction (in the main process) and
/// again immediately after each fork (in the child), rather than queried
/// from the OS on demand — POSIX signal handlers cannot reliably report the
/// callee pid, and caching it up front sidesteps that class of bug
/// entirely.
pub struct WorkerPool {
    children: Vec<pid_t>,
    is_main: bool,
    self_pid: pid_t,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            is_main: true,
            self_pid: unsafe { libc::getpid() },
        }
    }

    pub fn self_pid(&self) -> pid_t {
        self.self_pid
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[pid_t] {
        &self.children
    }

    /// Fork `n` children. In the main process, returns `Ok(())` with the
    /// pids recorded. In a child, returns `Ok(())` too, but that child's
    /// `WorkerPool` is freshly reset: `is_main` is `false` and it tracks no
    /// children of its own — forking further is the caller's business, not
    /// this pool's.
    ///
    /// Stops and returns the forked count accumulated so far wrapped in the
    /// error's context if any `fork()` call fails; children already forked
    /// in this call remain alive (the caller may `kill_all` them).
    pub fn create(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            let pid = unsafe { libc::fork() };
            match pid {
                -1 => return Err(Error::Fork(io::Error::last_os_error())),
                0 => {
                    // Child process.
                    self.children.clear();
                    self.is_main = false;
                    self.self_pid = unsafe { libc::getpid() };
                    return Ok(());
                }
                child_pid => {
                    self.children.push(child_pid);
                }
            }
        }

        Ok(())
    }

    /// Send `SIGTERM` to one tracked child and forget it.
    pub fn kill(&mut self, pid: pid_t) {
        if let Some(pos) = self.children.iter().position(|&p| p == pid) {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            self.children.swap_remove(pos);
        }
    }

    /// Terminate every tracked child.
    pub fn kill_all(&mut self) {
        for &pid in &self.children {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
        self.children.clear();
    }

    /// Called after the signal bridge reaps a `SIGCHLD` zombie. Returns
    /// whether `pid` was one of ours (and if so, removes it from tracking).
    pub fn on_terminated(&mut self, pid: pid_t) -> bool {
        if let Some(pos) = self.children.iter().position(|&p| p == pid) {
            self.children.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Respawn `count` dead workers by forking `count` new children in the
    /// main process. No-op (returns `Ok`) when called from a child, since a
    /// child's pool tracks no workers of its own.
    pub fn respawn(&mut self, count: usize) -> Result<()> {
        if !self.is_main || count == 0 {
            return Ok(());
        }

        match self.create(count) {
            Ok(()) => {
                info!(count, "respawned dead workers");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "respawn failed; continuing with fewer workers");
                Err(e)
            }
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_main_with_no_children() {
        let pool = WorkerPool::new();
        assert!(pool.is_main());
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.self_pid(), unsafe { libc::getpid() });
    }

    #[test]
    fn on_terminated_only_matches_tracked_pids() {
        let mut pool = WorkerPool::new();
        // Simulate tracking without an actual fork, to exercise bookkeeping
        // in isolation from process creation.
        pool.children.push(4242);
        assert!(!pool.on_terminated(9999));
        assert!(pool.on_terminated(4242));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn kill_removes_from_tracking_without_signaling_strangers() {
        let mut pool = WorkerPool::new();
        pool.children.push(1);
        pool.children.push(2);
        // pid 1 is init; sending it a real SIGTERM in a test would be
        // disruptive, so this test only exercises the bookkeeping by
        // checking a pid that was never tracked is a no-op.
        let before = pool.len();
        pool.kill(99999999);
        assert_eq!(pool.len(), before);
    }
}
