use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};

/// Bind a non-blocking UDP socket on `port` and join `group` on `interface`.
///
/// Address reuse is enabled so several listeners on one host (the daemon and
/// a local announcer, say) can share the group port. Loopback stays on so
/// same-host peers hear each other, and the TTL keeps traffic on the local
/// segment.
pub fn bind_multicast(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> io::Result<UdpSocket> {
    if !group.is_multicast() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a multicast address", group),
        ));
    }

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;

    socket.join_multicast_v4(&group, &interface)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unicast_group() {
        let err = bind_multicast(Ipv4Addr::new(10, 0, 0, 1), 0, Ipv4Addr::UNSPECIFIED).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
