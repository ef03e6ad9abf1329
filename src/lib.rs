//! `corehttpd`: an embeddable HTTP/1.1 server core.
//!
//! Two layers: `net` is a generic, readiness-based TCP acceptor (connection
//! pool, optional forked worker-process fan-out, POSIX signal bridge, POSIX
//! AIO tracking) with no HTTP awareness. `http` layers an incremental
//! request parser, route registry, and response writer on top via
//! `net::ConnectionHandler`.

pub mod config;
pub mod error;
pub mod http;
pub mod net;

pub use config::Config;
pub use error::{Error, Result};
pub use net::stop;
