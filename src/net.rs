use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Create an ephemeral UDP socket for talking to `peer`.
///
/// Bound to the unspecified address of the peer's family on a random port,
/// with both read and write bounded by `timeout`.
pub fn create_client_socket(peer: &SocketAddr, timeout: Duration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(*peer), Type::DGRAM, Some(Protocol::UDP))?;

    let local: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    socket.bind(&SockAddr::from(local))?;

    // A zero Duration is rejected by the OS; treat it as the shortest wait.
    let timeout = timeout.max(Duration::from_millis(1));
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;

    Ok(socket.into())
}
