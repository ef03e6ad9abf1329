//! Crate-wide error type.

use std::io;

use crate::http::request::ParseError;

/// Errors surfaced by the public API.
///
/// I/O errors that originate on a single connection never reach here — the
/// acceptor GCs the connection and continues (see `net::acceptor`). This
/// type is for errors that are fatal to a whole loop, a bind attempt, a
/// fork, or a single AIO submission.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("failed to bind {spec}: {source}")]
    Bind { spec: String, source: io::Error },

    #[error("fork failed: {0}")]
    Fork(io::Error),

    #[error("AIO submission failed: {0}")]
    AioSubmit(io::Error),

    #[error("HTTP parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("response body of {0} bytes exceeds the 99,999,999 byte Content-Length field")]
    ResponseTooLarge(usize),

    #[error("readiness registration failed: {0}")]
    Readiness(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
