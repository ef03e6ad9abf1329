//! POSIX AIO tracking.
//!
//! Every outstanding operation, for every connection, lives in one arena
//! owned by the acceptor (`AioArena`). The kernel's completion notification
//! (`SIGEV_SIGNAL` with `sigev_value` set to the record's arena index) hands
//! back that index, so the acceptor can look up both the record and its
//! owning connection id in O(1) without trusting a raw pointer that might
//! outlive the connection — the arena entry, not the connection, is what
//! the kernel points at. If the connection is GC'd while the operation is
//! still outstanding, the arena entry (and thus the completion path) stays
//! valid; only the `conn_id` it carries might now refer to a parked
//! aio-wait connection, which `Acceptor` handles explicitly.

use std::os::unix::io::RawFd;

use libc::{aiocb, off_t};
use slab::Slab;

/// Kind of outstanding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioKind {
    Read,
    Write,
}

/// An outstanding (or just-completed) AIO operation.
pub struct AioRecord {
    pub id: usize,
    pub fd: RawFd,
    pub offset: i64,
    pub kind: AioKind,
    pub nbytes: usize,
    /// Boxed so the control block's address is stable even if the owning
    /// `AioRecord` moves (it doesn't, once inserted in the slab, but boxing
    /// keeps `aiocb`'s self-referential kernel bookkeeping honest).
    pub(crate) cb: Box<aiocb>,
    /// Buffer the operation reads into / writes from. Kept alive here so it
    /// isn't dropped while the kernel still holds a pointer into it.
    pub buffer: Vec<u8>,
    pub error: i32,
    pub bytes_done: usize,
}

impl AioRecord {
    pub fn is_complete(&self) -> bool {
        // SAFETY: cb was submitted via aio_read/aio_write and is only ever
        // inspected here, never concurrently written to by anything but the
        // kernel.
        unsafe { libc::aio_error(&*self.cb as *const aiocb) != libc::EINPROGRESS }
    }

    /// Finalize a completed operation: records the error code and the
    /// number of bytes transferred (or 0 on error).
    pub fn finish(&mut self) {
        unsafe {
            let err = libc::aio_error(&*self.cb as *const aiocb);
            self.error = err;
            if err == 0 {
                let ret = libc::aio_return(&mut *self.cb as *mut aiocb);
                self.bytes_done = if ret < 0 { 0 } else { ret as usize };
            } else {
                self.bytes_done = 0;
            }
        }
    }
}

/// One entry in the global arena: the record plus the id of the connection
/// that submitted it. The connection only remembers the index; this is
/// where the reverse lookup lives.
pub struct AioEntry {
    pub conn_id: usize,
    pub record: AioRecord,
}

/// Arena owning every outstanding `AioRecord`, for every connection,
/// keyed by a stable `usize` index. Lives on `Acceptor`. Replaces a
/// per-connection slab, which would leave the signalfd's single opaque
/// `sigev_value` integer ambiguous about which connection's slab to index
/// into — one arena, one namespace, no ambiguity.
#[derive(Default)]
pub struct AioArena {
    entries: Slab<AioEntry>,
}

impl AioArena {
    pub fn new() -> Self {
        Self { entries: Slab::new() }
    }

    /// Insert a record, stamping its `id` and `sigev_value` to match the
    /// assigned arena index, then return that index. Does not submit the
    /// operation to the kernel; call `arm_and_submit` next.
    pub fn insert(&mut self, conn_id: usize, mut record: AioRecord) -> usize {
        let id = self.entries.vacant_key();
        record.id = id;
        let entry = self.entries.insert(AioEntry { conn_id, record });
        debug_assert_eq!(entry, id);
        id
    }

    pub fn get(&self, id: usize) -> Option<&AioEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut AioEntry> {
        self.entries.get_mut(id)
    }

    /// Remove and return a completed entry, e.g. once drained into the
    /// owning connection's `aio_completed`.
    pub fn remove(&mut self, id: usize) -> Option<AioEntry> {
        if self.entries.contains(id) {
            Some(self.entries.remove(id))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Construct the `aiocb` control block. `sigev_value` is left unset here —
/// it's stamped in once the record has an arena index, by
/// `AioArena::insert` + `arm_and_submit`.
fn build_cb(fd: RawFd, offset: i64, buf: *mut u8, nbytes: usize, signo: i32) -> Box<aiocb> {
    let mut cb: Box<aiocb> = Box::new(unsafe { std::mem::zeroed() });
    cb.aio_fildes = fd;
    cb.aio_offset = offset as off_t;
    cb.aio_buf = buf as *mut libc::c_void;
    cb.aio_nbytes = nbytes;
    cb.aio_sigevent.sigev_notify = libc::SIGEV_SIGNAL;
    cb.aio_sigevent.sigev_signo = signo;
    cb
}

/// Build an `aio_read` record. The `id` field is left at `usize::MAX` until
/// `AioArena::insert` assigns the real arena index; the kernel isn't told
/// about the operation until `arm_and_submit` runs afterward.
pub fn submit_read(fd: RawFd, offset: i64, nbytes: usize, signo: i32) -> std::io::Result<AioRecord> {
    let mut buffer = vec![0u8; nbytes];
    let cb = build_cb(fd, offset, buffer.as_mut_ptr(), nbytes, signo);
    Ok(AioRecord {
        id: usize::MAX,
        fd,
        offset,
        kind: AioKind::Read,
        nbytes,
        cb,
        buffer,
        error: libc::EINPROGRESS,
        bytes_done: 0,
    })
}

pub fn submit_write(
    fd: RawFd,
    offset: i64,
    data: Vec<u8>,
    signo: i32,
) -> std::io::Result<AioRecord> {
    let nbytes = data.len();
    let mut buffer = data;
    let cb = build_cb(fd, offset, buffer.as_mut_ptr(), nbytes, signo);
    Ok(AioRecord {
        id: usize::MAX,
        fd,
        offset,
        kind: AioKind::Write,
        nbytes,
        cb,
        buffer,
        error: libc::EINPROGRESS,
        bytes_done: 0,
    })
}

/// Arm `sigev_value` with the record's arena index and hand the control
/// block to the kernel. Must be called exactly once, after the record has
/// been inserted into the global `AioArena` (so `record.id` is real).
pub fn arm_and_submit(record: &mut AioRecord) -> std::io::Result<()> {
    record.cb.aio_sigevent.sigev_value.sival_ptr = record.id as *mut libc::c_void;

    let rc = unsafe {
        match record.kind {
            AioKind::Read => libc::aio_read(&mut *record.cb as *mut aiocb),
            AioKind::Write => libc::aio_write(&mut *record.cb as *mut aiocb),
        }
    };

    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Cancel all outstanding requests on `fd`.
pub fn cancel(fd: RawFd) -> std::io::Result<()> {
    let rc = unsafe { libc::aio_cancel(fd, std::ptr::null_mut()) };
    if rc == libc::AIO_NOTCANCELED {
        // Some requests could not be canceled; not an error, they'll
        // complete normally and be drained like any other completion.
        return Ok(());
    }
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cb_sets_fields() {
        let mut buf = vec![0u8; 16];
        let cb = build_cb(3, 10, buf.as_mut_ptr(), 16, 40);
        assert_eq!(cb.aio_fildes, 3);
        assert_eq!(cb.aio_offset, 10);
        assert_eq!(cb.aio_nbytes, 16);
        assert_eq!(cb.aio_sigevent.sigev_notify, libc::SIGEV_SIGNAL);
        assert_eq!(cb.aio_sigevent.sigev_signo, 40);
    }

    #[test]
    fn submit_read_starts_in_progress() {
        let record = submit_read(0, 0, 8, 40).unwrap();
        assert_eq!(record.error, libc::EINPROGRESS);
        assert_eq!(record.kind, AioKind::Read);
        assert_eq!(record.nbytes, 8);
    }

    #[test]
    fn arena_insert_stamps_id_and_tracks_owner() {
        let mut arena = AioArena::new();
        let record = submit_read(0, 0, 8, 40).unwrap();
        let id = arena.insert(7, record);
        let entry = arena.get(id).unwrap();
        assert_eq!(entry.conn_id, 7);
        assert_eq!(entry.record.id, id);
    }

    #[test]
    fn arena_remove_frees_the_slot() {
        let mut arena = AioArena::new();
        let id = arena.insert(1, submit_read(0, 0, 8, 40).unwrap());
        assert_eq!(arena.len(), 1);
        let removed = arena.remove(id).unwrap();
        assert_eq!(removed.conn_id, 1);
        assert!(arena.is_empty());
        assert!(arena.remove(id).is_none());
    }
}
