//! TCP socket construction for servers and clients.
//!
//! Sockets are built with `socket2` so the listen backlog, address reuse,
//! receive buffer size and the IPv6 dual-stack flag can be set before the
//! socket is handed to tokio.

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};

/// Default IPv4 bind host
pub const DEFAULT_IPV4_HOST: &str = "0.0.0.0";

/// Default IPv6 bind host
pub const DEFAULT_IPV6_HOST: &str = "::";

/// Socket address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 socket
    #[default]
    Ipv4,
    /// IPv6 socket; with dual stack enabled it also carries IPv4-mapped traffic
    Ipv6,
}

impl AddressFamily {
    fn domain(self) -> Domain {
        match self {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        }
    }
}

/// Options applied to a listening socket
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Socket family
    pub family: AddressFamily,
    /// Clear `IPV6_V6ONLY` on IPv6 sockets
    pub dual_stack: bool,
    /// Pending-connection backlog
    pub backlog: i32,
    /// `SO_RCVBUF` in bytes; 0 leaves the system default
    pub receive_buffer_size: usize,
}

/// Pick the host to bind: an IPv6 listener left on the IPv4 default binds `::` instead
pub fn effective_host(family: AddressFamily, host: &str) -> &str {
    if family == AddressFamily::Ipv6 && host == DEFAULT_IPV4_HOST {
        info!(
            "Change host from '{}' to '{}', so ipv6 is adapted",
            DEFAULT_IPV4_HOST, DEFAULT_IPV6_HOST
        );
        DEFAULT_IPV6_HOST
    } else {
        host
    }
}

/// Create a listener bound to `addr`. Must be called inside a tokio runtime.
pub fn listen_tcp(addr: SocketAddr, options: &ListenOptions) -> io::Result<TcpListener> {
    let socket = Socket::new(options.family.domain(), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if options.family == AddressFamily::Ipv6 {
        socket.set_only_v6(!options.dual_stack)?;
        if options.dual_stack {
            info!("Ipv4 socket is treated as ipv6 socket");
        }
    }
    if options.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(options.receive_buffer_size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(options.backlog)?;

    TcpListener::from_std(socket.into())
}

/// Map `addr` to the form an IPv6 socket can reach
pub fn target_for(family: AddressFamily, addr: SocketAddr) -> SocketAddr {
    match (family, addr.ip()) {
        (AddressFamily::Ipv6, IpAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port())
        }
        _ => addr,
    }
}

/// Connect to `addr` from a socket of the given family
pub async fn connect_tcp(family: AddressFamily, addr: SocketAddr) -> io::Result<TcpStream> {
    let target = target_for(family, addr);
    let socket = match family {
        AddressFamily::Ipv4 => TcpSocket::new_v4()?,
        AddressFamily::Ipv6 => {
            let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
            // Reach IPv4 peers through mapped addresses
            socket.set_only_v6(false)?;
            socket.set_nonblocking(true)?;
            TcpSocket::from_std_stream(socket.into())
        }
    };
    debug!("Connecting to {}", target);
    socket.connect(target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn options(family: AddressFamily) -> ListenOptions {
        ListenOptions {
            family,
            dual_stack: false,
            backlog: 16,
            receive_buffer_size: 64 * 1024,
        }
    }

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr, &options(AddressFamily::Ipv4)).unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp(AddressFamily::Ipv4, bound_addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), bound_addr);

        let (_accepted, remote) = listener.accept().await.unwrap();
        assert_eq!(remote, stream.local_addr().unwrap());
    }

    #[test]
    fn test_effective_host() {
        assert_eq!(effective_host(AddressFamily::Ipv6, "0.0.0.0"), "::");
        assert_eq!(effective_host(AddressFamily::Ipv6, "::1"), "::1");
        assert_eq!(effective_host(AddressFamily::Ipv4, "0.0.0.0"), "0.0.0.0");
    }

    #[test]
    fn test_ipv6_target_maps_ipv4() {
        let v4: SocketAddr = "127.0.0.1:8710".parse().unwrap();
        let mapped = target_for(AddressFamily::Ipv6, v4);
        assert_eq!(mapped.to_string(), "[::ffff:127.0.0.1]:8710");
        assert_eq!(target_for(AddressFamily::Ipv4, v4), v4);
    }
}
