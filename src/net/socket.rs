//! Listening socket creation and the dual-stack bind policy.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A bound, listening socket plus address metadata. Immutable after
/// construction.
pub struct ListenEndpoint {
    pub listener: TcpListener,
    pub ip: String,
    pub port: u16,
    pub is_ipv6: bool,
}

impl ListenEndpoint {
    pub fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.listener.as_raw_fd()
    }
}

fn new_listener(addr: SocketAddr, backlog: i32, ipv6_only: bool) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(ipv6_only)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket)
}

/// Bind policy from the spec:
///
/// - Empty IP binds both `0.0.0.0` and `::` on the same port; if the v6
///   bind fails after v4 succeeded, the v4 binding is kept and this still
///   returns `Ok`.
/// - An IP containing `:` binds v6 only; anything else binds v4 only.
/// - v6 sockets are always `IPV6_V6ONLY` to avoid double-binding the port.
///
/// Binding a whole list either succeeds for all entries or rolls every
/// successful bind in this call back before returning the error.
pub fn bind_all(specs: &[(String, u16)], backlog: i32) -> Result<Vec<ListenEndpoint>> {
    let mut endpoints = Vec::new();

    for (ip, port) in specs {
        match bind_one(ip, *port, backlog) {
            Ok(mut new_endpoints) => endpoints.append(&mut new_endpoints),
            Err(e) => {
                // Roll back everything bound during this call.
                drop(endpoints);
                return Err(e);
            }
        }
    }

    Ok(endpoints)
}

fn bind_one(ip: &str, port: u16, backlog: i32) -> Result<Vec<ListenEndpoint>> {
    if ip.is_empty() {
        return bind_dual_stack(port, backlog);
    }

    if ip.contains(':') {
        let endpoint = bind_single(ip, port, backlog, true)?;
        Ok(vec![endpoint])
    } else {
        let endpoint = bind_single(ip, port, backlog, false)?;
        Ok(vec![endpoint])
    }
}

fn bind_dual_stack(port: u16, backlog: i32) -> Result<Vec<ListenEndpoint>> {
    let v4 = bind_single("0.0.0.0", port, backlog, false)?;
    let mut endpoints = vec![v4];

    match bind_single("::", port, backlog, true) {
        Ok(v6) => endpoints.push(v6),
        Err(e) => {
            warn!(port, error = %e, "IPv6 dual-stack bind failed, keeping IPv4 only");
        }
    }

    Ok(endpoints)
}

fn bind_single(ip: &str, port: u16, backlog: i32, is_ipv6: bool) -> Result<ListenEndpoint> {
    let host = IpAddr::from_str(ip).map_err(|_| Error::Bind {
        spec: format!("{ip}:{port}"),
        source: io::Error::new(io::ErrorKind::InvalidInput, "unparsable address"),
    })?;
    let addr = SocketAddr::new(host, port);

    let socket = new_listener(addr, backlog, is_ipv6).map_err(|source| Error::Bind {
        spec: format!("{ip}:{port}"),
        source,
    })?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener);

    debug!(ip, port, ipv6 = is_ipv6, "bound listener");

    Ok(ListenEndpoint {
        listener,
        ip: ip.to_string(),
        port,
        is_ipv6,
    })
}
