use std::{
    io,
    net::{IpAddr, SocketAddr},
};

/// Anything that can tell which remote IP address it is talking to.
///
/// Connections are matched against subnet limits by this address. Failing to produce
/// one makes registration fail with
/// [`AddressResolutionFailed`](crate::ShaperError::AddressResolutionFailed).
pub trait PeerAddress {
    fn peer_ip(&self) -> io::Result<IpAddr>;
}

impl PeerAddress for IpAddr {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        Ok(*self)
    }
}

impl PeerAddress for SocketAddr {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        Ok(self.ip())
    }
}

/// Accepts either `ip:port` or a bare IP address.
impl PeerAddress for str {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        self.parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .or_else(|_| self.parse::<IpAddr>())
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{self:?} is not an IP address"),
                )
            })
    }
}

impl PeerAddress for tokio::net::TcpStream {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        self.peer_addr().map(|addr| addr.ip())
    }
}

impl PeerAddress for std::net::TcpStream {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        self.peer_addr().map(|addr| addr.ip())
    }
}

#[cfg(unix)]
impl PeerAddress for tokio::net::UnixStream {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "unix socket peers have no IP address"))
    }
}

impl<T: PeerAddress + ?Sized> PeerAddress for &T {
    fn peer_ip(&self) -> io::Result<IpAddr> {
        (**self).peer_ip()
    }
}
