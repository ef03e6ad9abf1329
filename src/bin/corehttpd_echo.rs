//! Demo binary: a line-oriented echo server exercising the bare `net` layer
//! with no HTTP awareness.
//!
//! A plain line is echoed back prefixed with `[Echo] `. A line of the form
//! `<n> <text>` (a leading count, a space, then the phrase) sends `(<k>@<text>)`
//! back once per `k` in `1..=n`, using `MORE_DATA` to drive the repeats
//! through `get_more_data` instead of writing them all at once.

use corehttpd::net::connection::EventFlags;
use corehttpd::net::handler::{ConnectionHandler, Session};
use corehttpd::net::{run_tcp, Buffer};
use corehttpd::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct EchoHandler;

struct RepeatState {
    next: usize,
    remaining: usize,
    phrase: Vec<u8>,
}

impl ConnectionHandler for EchoHandler {
    fn on_connected(&mut self, session: &mut dyn Session, _send_buf: &mut Buffer) -> EventFlags {
        info!(peer = %session.peer_ip(), port = session.peer_port(), "echo connection opened");
        EventFlags::NONE
    }

    fn on_received(
        &mut self,
        session: &mut dyn Session,
        recv_buf: &mut Buffer,
        send_buf: &mut Buffer,
    ) -> EventFlags {
        let mut flags = EventFlags::NONE;

        loop {
            let newline = match recv_buf.as_slice().iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => break,
            };
            let line = recv_buf.as_slice()[..newline].to_vec();
            recv_buf.erase_front(newline + 1);

            if let Some((count, phrase)) = parse_repeat(&line) {
                write_repeat_line(send_buf, 1, &phrase);
                if count > 1 {
                    session.set_user_context(Box::new(RepeatState {
                        next: 2,
                        remaining: count - 1,
                        phrase,
                    }));
                    flags = flags.union(EventFlags::MORE_DATA);
                }
            } else {
                send_buf.append_str("[Echo] ");
                send_buf.append(&line);
                send_buf.append(b"\n");
            }
        }

        flags
    }

    fn get_more_data(&mut self, session: &mut dyn Session, send_buf: &mut Buffer) -> EventFlags {
        let Some(state) = session
            .user_context_mut()
            .and_then(|c| c.downcast_mut::<RepeatState>())
        else {
            return EventFlags::NONE;
        };

        write_repeat_line(send_buf, state.next, &state.phrase);
        state.next += 1;
        state.remaining -= 1;

        if state.remaining > 0 {
            EventFlags::MORE_DATA
        } else {
            EventFlags::NONE
        }
    }

    fn on_disconnected(&mut self, session: &mut dyn Session) {
        info!(peer = %session.peer_ip(), port = session.peer_port(), "echo connection closed");
    }
}

/// Parses a `<n> <phrase>` line: a positive decimal count, a single space,
/// then the phrase to repeat. Anything else is treated as a plain echo line.
fn parse_repeat(line: &[u8]) -> Option<(usize, Vec<u8>)> {
    let space = line.iter().position(|&b| b == b' ')?;
    let count: usize = std::str::from_utf8(&line[..space]).ok()?.parse().ok()?;
    if count == 0 {
        return None;
    }
    Some((count, line[space + 1..].to_vec()))
}

fn write_repeat_line(send_buf: &mut Buffer, index: usize, phrase: &[u8]) {
    send_buf.append_str("(");
    send_buf.append_integer(index);
    send_buf.append_str("@");
    send_buf.append(phrase);
    send_buf.append_str(")\r\n");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(ip = %config.ip, port = config.port, "starting corehttpd echo demo");
    run_tcp(|| EchoHandler, config)?;
    Ok(())
}
