//! UDP socket constructor that marks datagrams low delay.
//!
//! TOS is best effort; plenty of networks strip it, some kernels refuse it,
//! and the stream still works either way.
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::common::box_error::BoxError;

pub fn new(port: u16) -> Result<UdpSocket, BoxError> {
    let raw_sock = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    let _ = raw_sock.set_tos(0x10); // IPTOS_LOWDELAY
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    raw_sock.bind(&SockAddr::from(addr))?;
    Ok(UdpSocket::from(raw_sock))
}

#[cfg(test)]
mod test_sock_with_tos {
    use super::*;

    #[test]
    fn build_socket() {
        // port 0 lets the OS pick, which always succeeds
        let sock = new(0).unwrap();
        assert!(sock.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn port_in_use_is_an_error() {
        let first = new(0).unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(new(port).is_err());
    }
}
