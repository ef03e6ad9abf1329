//! The readiness-driven event loop.
//!
//! Owns the listening sockets, the connection arena, the AIO arena, the
//! signal bridge, and (optionally) a forked worker-process pool. Dispatches
//! exactly the callbacks on `ConnectionHandler`, in the ordering spec'd on
//! that trait, and applies the GC policy that keeps a connection a member
//! of at most one of {used, free, aio-wait} at a time.

use std::io;

use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::aio::{AioArena, AioRecord};
use crate::net::buffer::Buffer;
use crate::net::connection::{ConnList, ConnSession, Connection, EventFlags};
use crate::net::handler::ConnectionHandler;
use crate::net::signal::{ignore_sigpipe, reap_zombies, SignalBridge, SignalRecord};
use crate::net::socket::{bind_all, ListenEndpoint};
use crate::net::worker_pool::WorkerPool;

/// Reserved for the signal bridge. Listener tokens occupy the range just
/// below it; connection tokens are slab indices, which never reach this
/// high in practice.
const SIGNAL_TOKEN: Token = Token(usize::MAX);

fn listener_token(index: usize) -> Token {
    Token(usize::MAX - 1 - index)
}

/// Binds the configured listener(s), optionally forks the worker pool, and
/// runs the event loop to completion (SIGINT/SIGTERM or a fatal error).
///
/// `make_handler` is called once per process — the initial workers and any
/// respawned replacement each get their own handler instance, since
/// `ConnectionHandler` implementations generally aren't `Clone` (they may
/// hold OS resources opened after fork, e.g. per-worker log files).
pub fn run_tcp<H, F>(make_handler: F, config: Config) -> Result<()>
where
    H: ConnectionHandler,
    F: Fn() -> H,
{
    ignore_sigpipe();
    let specs = [(config.ip.clone(), config.port)];
    let listeners = bind_all(&specs, config.backlog)?;

    if config.worker_processes == 0 {
        let mut acceptor = Acceptor::new(make_handler(), config, listeners, WorkerPool::new())?;
        return acceptor.run();
    }

    let mut pool = WorkerPool::new();
    pool.create(config.worker_processes)?;

    if !pool.is_main() {
        ignore_sigpipe();
        let mut acceptor = Acceptor::new(make_handler(), config, listeners, pool)?;
        return acceptor.run();
    }

    run_supervisor(pool, listeners, config, &make_handler)
}

/// The main process when `worker_processes > 0`: never accepts a
/// connection itself (testable property 9), only reaps and respawns.
fn run_supervisor<H, F>(
    mut pool: WorkerPool,
    listeners: Vec<ListenEndpoint>,
    config: Config,
    make_handler: &F,
) -> Result<()>
where
    H: ConnectionHandler,
    F: Fn() -> H,
{
    let mut bridge = SignalBridge::new().map_err(Error::Readiness)?;
    let poll = Poll::new().map_err(Error::Readiness)?;
    bridge
        .register(poll.registry(), SIGNAL_TOKEN)
        .map_err(Error::Readiness)?;
    let mut events = Events::with_capacity(16);

    info!(workers = pool.len(), "supervisor running");

    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Readiness(e)),
        }

        let mut terminate = false;
        let mut reaped = Vec::new();

        for event in events.iter() {
            if event.token() != SIGNAL_TOKEN {
                continue;
            }
            for record in bridge.drain().map_err(Error::Readiness)? {
                match record {
                    SignalRecord::Terminate => terminate = true,
                    SignalRecord::ChildReaped => reap_zombies(|pid| reaped.push(pid)),
                    SignalRecord::AioCompleted { .. } => {}
                }
            }
        }

        if terminate {
            pool.kill_all();
            return Ok(());
        }

        let dead = reaped
            .into_iter()
            .filter(|&pid| pool.on_terminated(pid))
            .count();

        if dead > 0 {
            if let Err(e) = pool.respawn(dead) {
                warn!(error = %e, "respawn failed; continuing with fewer workers");
            }

            if !pool.is_main() {
                // This is the freshly-forked child, resuming inside the
                // supervisor's own call stack (fork() duplicated it).
                // `bridge` and `poll` above get dropped as this function
                // unwinds, just like they eventually would in the parent.
                ignore_sigpipe();
                let handler = make_handler();
                let mut acceptor = Acceptor::new(handler, config.clone(), listeners, pool)?;
                return acceptor.run();
            }
        }
    }
}

fn dispatch_connected<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection) -> EventFlags {
    let Connection {
        ref peer_ip,
        peer_port,
        ref mut user_context,
        ref mut send_buf,
        ..
    } = *conn;
    let mut session = ConnSession::new(peer_ip, peer_port, user_context);
    handler.on_connected(&mut session, send_buf)
}

fn dispatch_received<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection) -> EventFlags {
    let Connection {
        ref peer_ip,
        peer_port,
        ref mut user_context,
        ref mut recv_buf,
        ref mut send_buf,
        ..
    } = *conn;
    let mut session = ConnSession::new(peer_ip, peer_port, user_context);
    handler.on_received(&mut session, recv_buf, send_buf)
}

fn dispatch_more_data<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection) -> EventFlags {
    let Connection {
        ref peer_ip,
        peer_port,
        ref mut user_context,
        ref mut send_buf,
        ..
    } = *conn;
    let mut session = ConnSession::new(peer_ip, peer_port, user_context);
    handler.get_more_data(&mut session, send_buf)
}

fn dispatch_disconnected<H: ConnectionHandler>(handler: &mut H, conn: &mut Connection) {
    let Connection {
        ref peer_ip,
        peer_port,
        ref mut user_context,
        ..
    } = *conn;
    let mut session = ConnSession::new(peer_ip, peer_port, user_context);
    handler.on_disconnected(&mut session);
}

fn dispatch_aio_completed<H: ConnectionHandler>(
    handler: &mut H,
    conn: &mut Connection,
    completed: &[AioRecord],
) -> EventFlags {
    let Connection {
        ref peer_ip,
        peer_port,
        ref mut user_context,
        ref mut send_buf,
        ..
    } = *conn;
    let mut session = ConnSession::new(peer_ip, peer_port, user_context);
    handler.on_aio_completed(&mut session, send_buf, completed)
}

/// The single-threaded, cooperative, edge-triggered event loop.
pub struct Acceptor<H: ConnectionHandler> {
    poll: Poll,
    events_capacity: usize,
    listeners: Vec<ListenEndpoint>,
    conns: Slab<Connection>,
    /// Buffers scavenged from fully-retired connections, reused by new
    /// accepts to skip a reallocation. Bounded by `max_free_connection`;
    /// this crate's realization of the spec's "free list" (see
    /// `ConnList` doc comment).
    free_buffers: Vec<(Buffer, Buffer)>,
    /// Connections parked by GC case 3: socket closed, slab slot and
    /// `aio_running_ids` kept alive until their last AIO operation drains.
    aio_wait: Vec<usize>,
    aio_arena: AioArena,
    worker_pool: WorkerPool,
    signal_bridge: SignalBridge,
    handler: H,
    config: Config,
    exit: bool,
}

impl<H: ConnectionHandler> Acceptor<H> {
    pub fn new(
        handler: H,
        config: Config,
        mut listeners: Vec<ListenEndpoint>,
        worker_pool: WorkerPool,
    ) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Readiness)?;

        for (i, endpoint) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(&mut endpoint.listener, listener_token(i), Interest::READABLE)
                .map_err(Error::Readiness)?;
        }

        let mut signal_bridge = SignalBridge::new().map_err(Error::Readiness)?;
        signal_bridge
            .register(poll.registry(), SIGNAL_TOKEN)
            .map_err(Error::Readiness)?;

        Ok(Self {
            poll,
            events_capacity: config.max_epoll_events,
            listeners,
            conns: Slab::new(),
            free_buffers: Vec::new(),
            aio_wait: Vec::new(),
            aio_arena: AioArena::new(),
            worker_pool,
            signal_bridge,
            handler,
            config,
            exit: false,
        })
    }

    /// Listener tokens live at the very top of the `usize` range (see
    /// `listener_token`); connection tokens are slab indices, which never
    /// reach anywhere near there. `token.0` above this threshold is
    /// unambiguously a listener.
    fn listener_index(&self, token: Token) -> Option<usize> {
        if token == SIGNAL_TOKEN || token.0 <= usize::MAX / 2 {
            return None;
        }
        let candidate = usize::MAX - 1 - token.0;
        (candidate < self.listeners.len()).then_some(candidate)
    }

    /// Run until SIGINT/SIGTERM sets the exit flag or a fatal readiness
    /// error occurs, then tear down.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        while !self.exit {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Readiness(e)),
            }

            for event in events.iter() {
                let token = event.token();

                if token == SIGNAL_TOKEN {
                    self.handle_signal()?;
                    if self.exit {
                        break;
                    }
                    continue;
                }

                if let Some(idx) = self.listener_index(token) {
                    self.accept_all(idx)?;
                    continue;
                }

                let conn_id = token.0;
                if !self.conns.contains(conn_id) {
                    continue;
                }

                self.handle_connection_event(
                    conn_id,
                    event.is_readable(),
                    event.is_writable(),
                );
            }
        }

        self.teardown();
        Ok(())
    }

    fn alloc_buffers(&mut self) -> (Buffer, Buffer) {
        self.free_buffers
            .pop()
            .unwrap_or_else(|| (Buffer::new(), Buffer::new()))
    }

    fn accept_all(&mut self, listener_idx: usize) -> Result<()> {
        loop {
            let accepted = self.listeners[listener_idx].listener.accept();
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Readiness(e)),
            };

            let ipv6 = self.listeners[listener_idx].is_ipv6;
            let (recv_buf, send_buf) = self.alloc_buffers();
            let conn = Connection::new(
                stream,
                addr.ip().to_string(),
                addr.port(),
                ipv6,
                recv_buf,
                send_buf,
            );
            let conn_id = self.conns.insert(conn);

            let flags = dispatch_connected(&mut self.handler, &mut self.conns[conn_id]);
            self.conns[conn_id].last_event_flags = flags;

            if flags.contains(EventFlags::DISCONNECT_AFTER_DRAIN)
                && !self.conns[conn_id].has_pending_send()
            {
                // GC case 1: never reached the used list.
                dispatch_disconnected(&mut self.handler, &mut self.conns[conn_id]);
                self.discard(conn_id);
                continue;
            }

            if self.conns[conn_id].has_pending_send() {
                if self.loop_send(conn_id).is_err() {
                    dispatch_disconnected(&mut self.handler, &mut self.conns[conn_id]);
                    self.discard(conn_id);
                    continue;
                }
                if !self.conns.contains(conn_id) {
                    // loop_send already drove this to disconnect+GC.
                    continue;
                }
            }

            let interest = if self.conns[conn_id].has_pending_send() {
                Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            let register_result = match &mut self.conns[conn_id].stream {
                Some(stream) => self
                    .poll
                    .registry()
                    .register(stream, Token(conn_id), interest),
                None => unreachable!("freshly accepted connection always has a stream"),
            };

            if let Err(e) = register_result {
                warn!(conn_id, error = %e, "failed to register accepted connection");
                dispatch_disconnected(&mut self.handler, &mut self.conns[conn_id]);
                self.discard(conn_id);
                continue;
            }

            self.conns[conn_id].token = Token(conn_id);
            self.conns[conn_id].list = ConnList::Used;
            debug!(conn_id, peer = %self.conns[conn_id].peer_ip, "accepted connection");
        }

        Ok(())
    }

    fn handle_connection_event(&mut self, conn_id: usize, readable: bool, writable: bool) {
        if readable {
            self.handle_readable(conn_id);
            if !self.conns.contains(conn_id) {
                return;
            }
        }
        if writable {
            self.handle_writable(conn_id);
        }
    }

    fn handle_readable(&mut self, conn_id: usize) {
        let mut peer_closed = false;
        let mut io_error = false;

        loop {
            let mut chunk = [0u8; 1024];
            let read_result = match &mut self.conns[conn_id].stream {
                Some(stream) => {
                    use std::io::Read;
                    stream.read(&mut chunk)
                }
                None => break,
            };

            match read_result {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.conns[conn_id].recv_buf.append(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    io_error = true;
                    break;
                }
            }
        }

        if io_error {
            self.gc(conn_id);
            return;
        }

        if !self.conns[conn_id].recv_buf.is_empty() {
            let flags = dispatch_received(&mut self.handler, &mut self.conns[conn_id]);
            self.conns[conn_id].last_event_flags = flags;
        }

        if peer_closed {
            self.gc(conn_id);
            return;
        }

        if self.conns[conn_id].has_pending_send() {
            self.set_interest(conn_id, Interest::WRITABLE);
        } else if self.conns[conn_id]
            .last_event_flags
            .contains(EventFlags::DISCONNECT_AFTER_DRAIN)
        {
            self.gc(conn_id);
        }
    }

    fn handle_writable(&mut self, conn_id: usize) {
        if self.loop_send(conn_id).is_err() {
            self.gc(conn_id);
            return;
        }

        if !self.conns.contains(conn_id) {
            return;
        }

        if !self.conns[conn_id].has_pending_send() {
            if self.conns[conn_id]
                .last_event_flags
                .contains(EventFlags::DISCONNECT_AFTER_DRAIN)
            {
                self.gc(conn_id);
            } else {
                self.set_interest(conn_id, Interest::READABLE);
            }
        }
    }

    /// Repeatedly `send()`; refills via `get_more_data` while the last
    /// handler result carried `MORE_DATA`. Stops on would-block, drained
    /// send buffer with no `MORE_DATA`, or a socket error.
    fn loop_send(&mut self, conn_id: usize) -> io::Result<()> {
        loop {
            if !self.conns[conn_id].has_pending_send() {
                self.conns[conn_id].reset_send_if_drained();

                if self.conns[conn_id]
                    .last_event_flags
                    .contains(EventFlags::MORE_DATA)
                {
                    let flags = dispatch_more_data(&mut self.handler, &mut self.conns[conn_id]);
                    self.conns[conn_id].last_event_flags = flags;
                    if !self.conns[conn_id].has_pending_send() {
                        break;
                    }
                    continue;
                }
                break;
            }

            let (start, end) = {
                let conn = &self.conns[conn_id];
                (conn.send_cursor, conn.send_buf.len())
            };

            let write_result = {
                let conn = &mut self.conns[conn_id];
                match conn.stream.as_mut() {
                    Some(stream) => {
                        use std::io::Write;
                        stream.write(&conn.send_buf[start..end])
                    }
                    None => return Ok(()),
                }
            };

            match write_result {
                Ok(0) => break,
                Ok(n) => {
                    self.conns[conn_id].send_cursor += n;
                    self.conns[conn_id].reset_send_if_drained();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn set_interest(&mut self, conn_id: usize, interest: Interest) {
        let result = match &mut self.conns[conn_id].stream {
            Some(stream) => self
                .poll
                .registry()
                .reregister(stream, Token(conn_id), interest),
            None => return,
        };
        if let Err(e) = result {
            warn!(conn_id, error = %e, "failed to reregister interest");
        }
    }

    fn handle_signal(&mut self) -> Result<()> {
        let records = self.signal_bridge.drain().map_err(Error::Readiness)?;
        let mut aio_conns: Vec<usize> = Vec::new();

        for record in records {
            match record {
                SignalRecord::Terminate => self.exit = true,
                SignalRecord::ChildReaped => {
                    let mut reaped = Vec::new();
                    reap_zombies(|pid| reaped.push(pid));
                    let dead = reaped
                        .into_iter()
                        .filter(|&pid| self.worker_pool.on_terminated(pid))
                        .count();
                    if dead > 0 {
                        if let Err(e) = self.worker_pool.respawn(dead) {
                            warn!(error = %e, "failed to respawn workers");
                        }
                    }
                }
                SignalRecord::AioCompleted { record_id } => {
                    if let Some(entry) = self.aio_arena.get_mut(record_id) {
                        entry.record.finish();
                        if !aio_conns.contains(&entry.conn_id) {
                            aio_conns.push(entry.conn_id);
                        }
                    }
                }
            }
        }

        if self.exit {
            return Ok(());
        }

        for conn_id in aio_conns {
            self.deliver_aio_completions(conn_id);
        }

        Ok(())
    }

    /// Move every arena entry owned by `conn_id` that has finished out of
    /// the arena and into the connection's own `aio_completed`.
    fn collect_completed(&mut self, conn_id: usize) -> Vec<AioRecord> {
        let running = std::mem::take(&mut self.conns[conn_id].aio_running_ids);
        let mut still_running = Vec::with_capacity(running.len());
        let mut completed = Vec::new();

        for id in running {
            let done = self
                .aio_arena
                .get(id)
                .map(|e| e.record.error != libc::EINPROGRESS)
                .unwrap_or(false);

            if done {
                if let Some(entry) = self.aio_arena.remove(id) {
                    completed.push(entry.record);
                }
            } else {
                still_running.push(id);
            }
        }

        self.conns[conn_id].aio_running_ids = still_running;
        completed
    }

    fn deliver_aio_completions(&mut self, conn_id: usize) {
        if !self.conns.contains(conn_id) {
            return;
        }

        let completed = self.collect_completed(conn_id);
        if completed.is_empty() {
            return;
        }

        if self.conns[conn_id].list == ConnList::AioWait {
            // Already disconnected (GC case 3); just bookkeep and finish
            // tearing down once nothing is outstanding.
            self.conns[conn_id].aio_completed.extend(completed);
            if self.conns[conn_id].aio_running_count() == 0 {
                self.gc(conn_id);
            }
            return;
        }

        let flags =
            dispatch_aio_completed(&mut self.handler, &mut self.conns[conn_id], &completed);
        self.conns[conn_id].aio_completed.extend(completed);
        self.conns[conn_id].last_event_flags = flags;

        if self.conns[conn_id].has_pending_send() {
            self.set_interest(conn_id, Interest::WRITABLE);
        } else if flags.contains(EventFlags::DISCONNECT_AFTER_DRAIN) {
            self.gc(conn_id);
        }
    }

    /// Submit an AIO operation on behalf of `conn_id`, registering it in
    /// the global arena and stamping its `sigev_value`.
    pub fn submit_aio(&mut self, conn_id: usize, record: AioRecord) -> Result<()> {
        let id = self.aio_arena.insert(conn_id, record);
        let entry = self.aio_arena.get_mut(id).expect("just inserted");
        crate::net::aio::arm_and_submit(&mut entry.record).map_err(Error::AioSubmit)?;
        self.conns[conn_id].aio_running_ids.push(id);
        Ok(())
    }

    /// GC policy, four cases keyed on (ever registered into the used list,
    /// outstanding AIO count, already aio-waiting).
    fn gc(&mut self, conn_id: usize) {
        if !self.conns.contains(conn_id) {
            return;
        }

        let in_used = self.conns[conn_id].list == ConnList::Used;
        let running = self.conns[conn_id].aio_running_count();

        if in_used && running > 0 {
            // Case 3: park it.
            dispatch_disconnected(&mut self.handler, &mut self.conns[conn_id]);
            self.unregister(conn_id);
            self.conns[conn_id].close_stream();
            self.conns[conn_id].aio_wait_flag = true;
            self.conns[conn_id].list = ConnList::AioWait;
            self.aio_wait.push(conn_id);
            return;
        }

        if in_used {
            // Case 4: used, nothing outstanding.
            dispatch_disconnected(&mut self.handler, &mut self.conns[conn_id]);
        }
        // Case 2 (aio-wait, drained) falls through with no callback: this
        // connection's on_disconnected already ran when it was parked.

        self.unregister(conn_id);
        self.discard(conn_id);
    }

    fn unregister(&mut self, conn_id: usize) {
        if let Some(stream) = &mut self.conns[conn_id].stream {
            let _ = self.poll.registry().deregister(stream);
        }
    }

    /// Remove a connection from the slab, scavenging its buffers into the
    /// free list if there's room.
    fn discard(&mut self, conn_id: usize) {
        if let ConnList::AioWait = self.conns[conn_id].list {
            self.aio_wait.retain(|&id| id != conn_id);
        }

        let conn = self.conns.remove(conn_id);

        if self.free_buffers.len() < self.config.max_free_connection {
            let mut recv_buf = conn.recv_buf;
            let mut send_buf = conn.send_buf;
            recv_buf.clear();
            send_buf.clear();
            self.free_buffers.push((recv_buf, send_buf));
        }
    }

    fn teardown(&mut self) {
        let used: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| c.list == ConnList::Used)
            .map(|(id, _)| id)
            .collect();

        for conn_id in used {
            dispatch_disconnected(&mut self.handler, &mut self.conns[conn_id]);
            self.unregister(conn_id);
        }

        self.conns.clear();
        self.free_buffers.clear();
        self.aio_wait.clear();

        self.worker_pool.kill_all();
        info!("acceptor loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_token_is_unambiguous_and_distinct_from_signal() {
        assert_ne!(listener_token(0), SIGNAL_TOKEN);
        assert_ne!(listener_token(0), listener_token(1));
    }
}
