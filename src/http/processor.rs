//! Glues the HTTP request parser, route registry, and response writer into a
//! `ConnectionHandler` the generic acceptor can drive directly.
//!
//! Per-connection parse state (the in-progress `HttpRequest`) is stashed in
//! `Session::user_context` between `on_received` calls, since the acceptor
//! gives handlers no other place to keep it — one `HttpProcessor` instance
//! serves every connection on its process.

use crate::config::Config;
use crate::http::request::{HttpRequest, ParseOutcome};
use crate::http::response::{reason_phrase, HttpResponse};
use crate::http::route::{RouteResponse, Router};
use crate::net::buffer::Buffer;
use crate::net::connection::EventFlags;
use crate::net::handler::{ConnectionHandler, Session};

pub struct HttpProcessor {
    router: Router,
    keep_alive: bool,
    response_date: bool,
}

impl HttpProcessor {
    pub fn new(router: Router, config: &Config) -> Self {
        Self {
            router,
            keep_alive: config.keep_alive,
            response_date: config.response_date,
        }
    }

    /// Runs the matched route (or a 404) and serializes its response into
    /// `send_buf`. Returns whether the connection should stay open.
    fn dispatch(&self, request: &HttpRequest, recv_buf: &[u8], send_buf: &mut Buffer) -> bool {
        let path = String::from_utf8_lossy(request.path()).into_owned();
        let method = match request.method() {
            Some(m) => m,
            None => {
                self.write_status_only(send_buf, 400);
                return false;
            }
        };
        let wants_close = request
            .header_value(recv_buf, "Connection")
            .map(|v| v.eq_ignore_ascii_case(b"close"))
            .unwrap_or(false);

        let route_response = match self.router.find(&path, method) {
            Some(route) => route.call(request, recv_buf),
            None => RouteResponse::new(404, "text/plain", b"not found".to_vec()),
        };

        let keep_alive = self.keep_alive && !wants_close;
        let mut resp = HttpResponse::begin(send_buf, route_response.status);
        resp.finish_headers(
            send_buf,
            keep_alive,
            self.response_date,
            &route_response.content_type,
        );
        resp.write_body(send_buf, &route_response.body);
        if let Err(err) = resp.finish(send_buf) {
            tracing::error!(error = %err, "dropping response body that exceeds the size limit");
            resp.set_status(send_buf, 500);
        }

        keep_alive
    }

    fn write_status_only(&self, send_buf: &mut Buffer, status: u16) {
        let mut resp = HttpResponse::begin(send_buf, status);
        resp.finish_headers(send_buf, false, self.response_date, "text/plain");
        resp.write_body(send_buf, reason_phrase(status).as_bytes());
        let _ = resp.finish(send_buf);
    }
}

impl ConnectionHandler for HttpProcessor {
    fn on_connected(&mut self, session: &mut dyn Session, _send_buf: &mut Buffer) -> EventFlags {
        session.set_user_context(Box::new(HttpRequest::new()));
        EventFlags::NONE
    }

    fn on_received(
        &mut self,
        session: &mut dyn Session,
        recv_buf: &mut Buffer,
        send_buf: &mut Buffer,
    ) -> EventFlags {
        loop {
            if session
                .user_context()
                .and_then(|c| c.downcast_ref::<HttpRequest>())
                .is_none()
            {
                session.set_user_context(Box::new(HttpRequest::new()));
            }

            let parse_result = {
                let request = session
                    .user_context_mut()
                    .and_then(|c| c.downcast_mut::<HttpRequest>())
                    .expect("HttpProcessor's user_context is always an HttpRequest");
                request.continue_to_parse(recv_buf.as_slice())
            };

            let consumed = match parse_result {
                Ok(ParseOutcome::NeedMore) => return EventFlags::NONE,
                Ok(ParseOutcome::Complete { consumed }) => consumed,
                Err(err) => {
                    tracing::warn!(error = %err, "closing connection on malformed request");
                    return EventFlags::DISCONNECT_AFTER_DRAIN;
                }
            };

            let keep_alive = {
                let request = session
                    .user_context()
                    .and_then(|c| c.downcast_ref::<HttpRequest>())
                    .expect("HttpProcessor's user_context is always an HttpRequest");
                self.dispatch(request, recv_buf.as_slice(), send_buf)
            };

            recv_buf.erase_front(consumed);
            session.set_user_context(Box::new(HttpRequest::new()));

            if !keep_alive {
                return EventFlags::DISCONNECT_AFTER_DRAIN;
            }
            if recv_buf.is_empty() {
                return EventFlags::NONE;
            }
            // Another pipelined request is already buffered; loop around.
        }
    }

    fn on_disconnected(&mut self, session: &mut dyn Session) {
        tracing::debug!(peer = %session.peer_ip(), port = session.peer_port(), "http connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct TestSession {
        peer_ip: String,
        peer_port: u16,
        user_context: Option<Box<dyn Any + Send>>,
    }

    impl TestSession {
        fn new() -> Self {
            Self {
                peer_ip: "127.0.0.1".to_string(),
                peer_port: 4242,
                user_context: None,
            }
        }
    }

    impl Session for TestSession {
        fn user_context(&self) -> Option<&(dyn Any + Send)> {
            self.user_context.as_deref()
        }
        fn user_context_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
            self.user_context.as_deref_mut()
        }
        fn set_user_context(&mut self, ctx: Box<dyn Any + Send>) {
            self.user_context = Some(ctx);
        }
        fn peer_ip(&self) -> &str {
            &self.peer_ip
        }
        fn peer_port(&self) -> u16 {
            self.peer_port
        }
    }

    fn processor_with_echo_route() -> HttpProcessor {
        let mut router = Router::new();
        router.register(
            "/hello",
            crate::http::method::MethodMask::ANY,
            "text/plain",
            Box::new(|_req, _buf| RouteResponse::new(200, "text/plain", b"hi".to_vec())),
        );
        let config = Config::default();
        HttpProcessor::new(router, &config)
    }

    #[test]
    fn routes_to_matching_controller() {
        let mut processor = processor_with_echo_route();
        let mut session = TestSession::new();
        let mut recv_buf = Buffer::new();
        let mut send_buf = Buffer::new();

        processor.on_connected(&mut session, &mut send_buf);
        recv_buf.append(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let flags = processor.on_received(&mut session, &mut recv_buf, &mut send_buf);
        assert_eq!(flags, EventFlags::NONE);

        let text = String::from_utf8(send_buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hi"));
        assert!(recv_buf.is_empty());
    }

    #[test]
    fn unmatched_route_returns_404() {
        let mut processor = processor_with_echo_route();
        let mut session = TestSession::new();
        let mut recv_buf = Buffer::new();
        let mut send_buf = Buffer::new();

        processor.on_connected(&mut session, &mut send_buf);
        recv_buf.append(b"GET /nope HTTP/1.1\r\n\r\n");
        processor.on_received(&mut session, &mut recv_buf, &mut send_buf);

        let text = String::from_utf8(send_buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 ER\r\n"));
    }

    #[test]
    fn connection_close_header_disconnects_after_drain() {
        let mut processor = processor_with_echo_route();
        let mut session = TestSession::new();
        let mut recv_buf = Buffer::new();
        let mut send_buf = Buffer::new();

        processor.on_connected(&mut session, &mut send_buf);
        recv_buf.append(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n");
        let flags = processor.on_received(&mut session, &mut recv_buf, &mut send_buf);
        assert_eq!(flags, EventFlags::DISCONNECT_AFTER_DRAIN);
    }

    #[test]
    fn pipelined_requests_are_both_answered() {
        let mut processor = processor_with_echo_route();
        let mut session = TestSession::new();
        let mut recv_buf = Buffer::new();
        let mut send_buf = Buffer::new();

        processor.on_connected(&mut session, &mut send_buf);
        recv_buf.append(b"GET /hello HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n");
        let flags = processor.on_received(&mut session, &mut recv_buf, &mut send_buf);
        assert_eq!(flags, EventFlags::NONE);
        assert!(recv_buf.is_empty());

        let text = String::from_utf8(send_buf.as_slice().to_vec()).unwrap();
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[test]
    fn malformed_request_closes_connection_with_no_response_bytes() {
        let mut processor = processor_with_echo_route();
        let mut session = TestSession::new();
        let mut recv_buf = Buffer::new();
        let mut send_buf = Buffer::new();

        processor.on_connected(&mut session, &mut send_buf);
        recv_buf.append(b"NOPE /hello HTTP/1.1\r\n\r\n");
        let flags = processor.on_received(&mut session, &mut recv_buf, &mut send_buf);
        assert_eq!(flags, EventFlags::DISCONNECT_AFTER_DRAIN);
        assert!(send_buf.is_empty());
    }
}
