//! Application-facing capability object dispatched by the acceptor.
//!
//! User code never touches sockets or the readiness handle directly — the
//! acceptor calls exactly these five methods, in the ordering guarantees
//! documented on `Acceptor`.

use crate::net::aio::AioRecord;
use crate::net::buffer::Buffer;
use crate::net::connection::EventFlags;

/// Per-connection session handle passed to every callback. Lets the handler
/// stash/retrieve its own `user_context` without reaching into `Connection`
/// internals.
pub trait Session {
    fn user_context(&self) -> Option<&(dyn std::any::Any + Send)>;
    fn user_context_mut(&mut self) -> Option<&mut (dyn std::any::Any + Send)>;
    fn set_user_context(&mut self, ctx: Box<dyn std::any::Any + Send>);
    fn peer_ip(&self) -> &str;
    fn peer_port(&self) -> u16;
}

/// Capability object the acceptor drives. A convenience adapter building one
/// from a single closure is not part of the core — callers implement this
/// trait directly or layer `http::processor::HttpProcessor` (which itself
/// implements it) on top.
pub trait ConnectionHandler {
    /// Called exactly once when a connection is accepted, before it is
    /// registered with the readiness handle. Anything appended to
    /// `send_buf` here is flushed before the connection is put on the used
    /// list.
    fn on_connected(&mut self, session: &mut dyn Session, send_buf: &mut Buffer) -> EventFlags;

    /// Called when new bytes have arrived in `recv_buf`. The handler is
    /// responsible for consuming what it understood (typically via
    /// `recv_buf.erase_front`) and may append a response to `send_buf`.
    fn on_received(
        &mut self,
        session: &mut dyn Session,
        recv_buf: &mut Buffer,
        send_buf: &mut Buffer,
    ) -> EventFlags;

    /// Called by the acceptor's drain loop while the handler's last result
    /// carried `MORE_DATA`, to refill `send_buf`. Returning flags without
    /// `MORE_DATA` stops the drain.
    fn get_more_data(&mut self, session: &mut dyn Session, send_buf: &mut Buffer) -> EventFlags {
        let _ = (session, send_buf);
        EventFlags::NONE
    }

    /// Called exactly once per successful `on_connected`, in matched pairs.
    fn on_disconnected(&mut self, session: &mut dyn Session);

    /// Called when one or more AIO operations submitted by this connection
    /// have completed.
    fn on_aio_completed(
        &mut self,
        session: &mut dyn Session,
        send_buf: &mut Buffer,
        completed: &[AioRecord],
    ) -> EventFlags {
        let _ = (session, send_buf, completed);
        EventFlags::NONE
    }
}
