//! Per-peer connection state.

use std::any::Any;

use mio::net::TcpStream;
use mio::Token;

use crate::net::aio::AioRecord;
use crate::net::buffer::Buffer;
use crate::net::handler::Session;

/// Bits set by handler return values, consumed by the acceptor loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const NONE: EventFlags = EventFlags(0);
    pub const DISCONNECT_AFTER_DRAIN: EventFlags = EventFlags(1 << 0);
    pub const MORE_DATA: EventFlags = EventFlags(1 << 1);

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 | other.0)
    }
}

/// Which of the three membership sets a connection currently belongs to.
///
/// This replaces the source's intrusive doubly-linked-list node: a
/// connection lives in a `slab::Slab` arena keyed by a stable index, and membership
/// is a single tag rather than pointer splicing, which makes "a connection
/// is in at most one list" a structural invariant instead of a bookkeeping
/// discipline. `Free` connections don't occupy a slab slot at all — see
/// `Acceptor`'s buffer pool — so only `Used` and `AioWait` are stored here;
/// the tag still exists for parity with the spec's three-list model and for
/// connections caught mid-transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnList {
    Used,
    Free,
    AioWait,
}

/// A single client connection.
///
/// `stream` is `None` only while a connection is parked in the aio-wait
/// list (GC case 3): the socket is closed but the slab slot, buffers, and
/// outstanding AIO ids must survive until the last operation drains, since
/// the AIO arena's completion payload references this slot by index.
pub struct Connection {
    pub stream: Option<TcpStream>,
    pub token: Token,
    pub peer_ip: String,
    pub peer_port: u16,
    pub ipv6: bool,

    pub recv_buf: Buffer,
    pub send_buf: Buffer,
    /// Bytes `[0, send_cursor)` of `send_buf` have been transmitted.
    pub send_cursor: usize,

    pub last_event_flags: EventFlags,

    /// Opaque per-connection application state, reset (not freed) on
    /// recycle.
    pub user_context: Option<Box<dyn Any + Send>>,

    /// Ids (indices into the acceptor's global AIO arena, see
    /// `net::aio::AioArena`) of operations this connection has submitted
    /// and that haven't completed yet. The records themselves live in the
    /// arena, not here — see Design Notes on avoiding a conn↔record cycle.
    pub aio_running_ids: Vec<usize>,
    pub aio_completed: Vec<AioRecord>,
    pub aio_wait_flag: bool,

    pub list: ConnList,
}

impl Connection {
    /// `recv_buf`/`send_buf` are taken by the caller, which may hand in
    /// buffers scavenged from the free list to skip a reallocation.
    pub fn new(
        stream: TcpStream,
        peer_ip: String,
        peer_port: u16,
        ipv6: bool,
        recv_buf: Buffer,
        send_buf: Buffer,
    ) -> Self {
        Self {
            stream: Some(stream),
            token: Token(0),
            peer_ip,
            peer_port,
            ipv6,
            recv_buf,
            send_buf,
            send_cursor: 0,
            last_event_flags: EventFlags::NONE,
            user_context: None,
            aio_running_ids: Vec::new(),
            aio_completed: Vec::new(),
            aio_wait_flag: false,
            list: ConnList::Used,
        }
    }

    /// Close the socket without discarding the connection object. Used by
    /// the acceptor's GC path: case 3 parks a connection with outstanding
    /// AIO, which still needs `recv_buf`/`send_buf`/`aio_running_ids` alive.
    pub fn close_stream(&mut self) {
        self.stream = None;
    }

    pub fn aio_running_count(&self) -> usize {
        self.aio_running_ids.len()
    }

    pub fn has_pending_send(&self) -> bool {
        self.send_cursor < self.send_buf.len()
    }

    /// Drain `send_buf` once fully transmitted, resetting it and the cursor.
    pub fn reset_send_if_drained(&mut self) {
        if self.send_cursor == self.send_buf.len() {
            self.send_buf.clear();
            self.send_cursor = 0;
        }
    }
}

/// A borrowed view over exactly the fields `Session` needs, constructed by
/// destructuring a `&mut Connection` at the call site. Kept disjoint from
/// `send_buf`/`recv_buf` so callers can pass `&mut dyn Session` and
/// `&mut Buffer` into the same handler call without a double-borrow.
pub struct ConnSession<'a> {
    peer_ip: &'a str,
    peer_port: u16,
    user_context: &'a mut Option<Box<dyn Any + Send>>,
}

impl<'a> ConnSession<'a> {
    pub fn new(
        peer_ip: &'a str,
        peer_port: u16,
        user_context: &'a mut Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            peer_ip,
            peer_port,
            user_context,
        }
    }
}

impl<'a> Session for ConnSession<'a> {
    fn user_context(&self) -> Option<&(dyn Any + Send)> {
        self.user_context.as_deref()
    }

    fn user_context_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.user_context.as_deref_mut()
    }

    fn set_user_context(&mut self, ctx: Box<dyn Any + Send>) {
        *self.user_context = Some(ctx);
    }

    fn peer_ip(&self) -> &str {
        self.peer_ip
    }

    fn peer_port(&self) -> u16 {
        self.peer_port
    }
}
