//! The generic TCP acceptor: readiness loop, connection pool, worker-process
//! fan-out, signal bridge, and per-connection POSIX AIO tracking.
//!
//! This layer has no HTTP awareness; `corehttpd::http` is built on top of it
//! via `ConnectionHandler`.

pub mod acceptor;
pub mod aio;
pub mod buffer;
pub mod connection;
pub mod handler;
pub mod signal;
pub mod socket;
pub mod worker_pool;

pub use acceptor::{run_tcp, Acceptor};
pub use buffer::Buffer;
pub use connection::{ConnList, ConnSession, Connection, EventFlags};
pub use handler::{ConnectionHandler, Session};
pub use signal::stop;
pub use socket::ListenEndpoint;
pub use worker_pool::WorkerPool;
