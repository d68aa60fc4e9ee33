use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// An IPv4 or IPv6 address; v6 carries its scope id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6 { addr: Ipv6Addr, scope_id: u32 },
}

impl IpAddress {
    #[inline]
    pub fn is_v4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    #[inline]
    pub fn is_v6(&self) -> bool {
        matches!(self, IpAddress::V6 { .. })
    }

    /// Address family filter used by resolver options and connect options.
    pub fn matches(&self, ty: IpAddressType) -> bool {
        match ty {
            IpAddressType::Any => true,
            IpAddressType::V4 => self.is_v4(),
            IpAddressType::V6 => self.is_v6(),
        }
    }
}

impl From<std::net::IpAddr> for IpAddress {
    fn from(value: std::net::IpAddr) -> Self {
        match value {
            std::net::IpAddr::V4(addr) => IpAddress::V4(addr),
            std::net::IpAddr::V6(addr) => IpAddress::V6 { addr, scope_id: 0 },
        }
    }
}

impl From<IpAddress> for std::net::IpAddr {
    fn from(value: IpAddress) -> Self {
        match value {
            IpAddress::V4(addr) => std::net::IpAddr::V4(addr),
            IpAddress::V6 { addr, .. } => std::net::IpAddr::V6(addr),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6 { addr, scope_id: 0 } => addr.fmt(f),
            IpAddress::V6 { addr, scope_id } => write!(f, "{addr}%{scope_id}"),
        }
    }
}

/// Requested address family for resolution and connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpAddressType {
    #[default]
    Any,
    V4,
    V6,
}

/// An IP address / port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpEndpoint {
    pub address: IpAddress,
    pub port: u16,
}

impl IpEndpoint {
    pub fn new(address: IpAddress, port: u16) -> Self {
        Self { address, port }
    }
}

impl From<SocketAddr> for IpEndpoint {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(v4) => {
                IpEndpoint { address: IpAddress::V4(*v4.ip()), port: v4.port() }
            }
            SocketAddr::V6(v6) => IpEndpoint {
                address: IpAddress::V6 { addr: *v6.ip(), scope_id: v6.scope_id() },
                port: v6.port(),
            },
        }
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddress::V4(_) => write!(f, "{}:{}", self.address, self.port),
            IpAddress::V6 { .. } => write!(f, "[{}]:{}", self.address, self.port),
        }
    }
}

/// A local-domain (Unix) socket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalName(pub PathBuf);

impl LocalName {
    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

/// Where a socket is bound or connected: an IP endpoint or a local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Ip(IpEndpoint),
    Local(LocalName),
}

impl Endpoint {
    pub fn ip(address: IpAddress, port: u16) -> Self {
        Endpoint::Ip(IpEndpoint::new(address, port))
    }

    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Endpoint::Local(LocalName(path.into()))
    }

    pub fn as_ip(&self) -> Option<&IpEndpoint> {
        match self {
            Endpoint::Ip(ep) => Some(ep),
            Endpoint::Local(_) => None,
        }
    }

    /// The transport domain this endpoint belongs to.
    pub fn domain(&self) -> TransportDomain {
        match self {
            Endpoint::Ip(ep) => match ep.address {
                IpAddress::V4(_) => TransportDomain::Ipv4,
                IpAddress::V6 { .. } => TransportDomain::Ipv6,
            },
            Endpoint::Local(_) => TransportDomain::Local,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(ep) => ep.fmt(f),
            Endpoint::Local(name) => write!(f, "{}", name.0.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddr =
            s.parse().map_err(|_| Error::new(ErrorKind::InvalidArgument))?;
        Ok(Endpoint::Ip(addr.into()))
    }
}

/// Address family of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportDomain {
    Ipv4,
    Ipv6,
    Local,
}

/// Stream or datagram semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportMode {
    Stream,
    Datagram,
}

/// Wire protocol of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Local,
}

/// The six meaningful protocol/domain/mode combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    TcpIpv4Stream,
    TcpIpv6Stream,
    UdpIpv4Datagram,
    UdpIpv6Datagram,
    LocalStream,
    LocalDatagram,
}

impl Transport {
    pub fn domain(&self) -> TransportDomain {
        match self {
            Transport::TcpIpv4Stream | Transport::UdpIpv4Datagram => TransportDomain::Ipv4,
            Transport::TcpIpv6Stream | Transport::UdpIpv6Datagram => TransportDomain::Ipv6,
            Transport::LocalStream | Transport::LocalDatagram => TransportDomain::Local,
        }
    }

    pub fn mode(&self) -> TransportMode {
        match self {
            Transport::TcpIpv4Stream | Transport::TcpIpv6Stream | Transport::LocalStream => {
                TransportMode::Stream
            }
            Transport::UdpIpv4Datagram
            | Transport::UdpIpv6Datagram
            | Transport::LocalDatagram => TransportMode::Datagram,
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        match self {
            Transport::TcpIpv4Stream | Transport::TcpIpv6Stream => TransportProtocol::Tcp,
            Transport::UdpIpv4Datagram | Transport::UdpIpv6Datagram => TransportProtocol::Udp,
            Transport::LocalStream | Transport::LocalDatagram => TransportProtocol::Local,
        }
    }

    /// The transport for `protocol` in `domain`, if the combination is
    /// meaningful.
    pub fn resolve(protocol: TransportProtocol, domain: TransportDomain) -> Result<Self> {
        match (protocol, domain) {
            (TransportProtocol::Tcp, TransportDomain::Ipv4) => Ok(Transport::TcpIpv4Stream),
            (TransportProtocol::Tcp, TransportDomain::Ipv6) => Ok(Transport::TcpIpv6Stream),
            (TransportProtocol::Udp, TransportDomain::Ipv4) => Ok(Transport::UdpIpv4Datagram),
            (TransportProtocol::Udp, TransportDomain::Ipv6) => Ok(Transport::UdpIpv6Datagram),
            (TransportProtocol::Local, TransportDomain::Local) => Ok(Transport::LocalStream),
            _ => Err(Error::new(ErrorKind::InvalidArgument)),
        }
    }

    /// Picks the stream transport that can reach `endpoint`.
    pub fn stream_for(endpoint: &Endpoint) -> Self {
        match endpoint.domain() {
            TransportDomain::Ipv4 => Transport::TcpIpv4Stream,
            TransportDomain::Ipv6 => Transport::TcpIpv6Stream,
            TransportDomain::Local => Transport::LocalStream,
        }
    }

    /// Picks the datagram transport that can reach `endpoint`.
    pub fn datagram_for(endpoint: &Endpoint) -> Self {
        match endpoint.domain() {
            TransportDomain::Ipv4 => Transport::UdpIpv4Datagram,
            TransportDomain::Ipv6 => Transport::UdpIpv6Datagram,
            TransportDomain::Local => Transport::LocalDatagram,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::TcpIpv4Stream => "tcp/ipv4/stream",
            Transport::TcpIpv6Stream => "tcp/ipv6/stream",
            Transport::UdpIpv4Datagram => "udp/ipv4/datagram",
            Transport::UdpIpv6Datagram => "udp/ipv6/datagram",
            Transport::LocalStream => "local/stream",
            Transport::LocalDatagram => "local/datagram",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_axes() {
        assert_eq!(Transport::TcpIpv6Stream.domain(), TransportDomain::Ipv6);
        assert_eq!(Transport::TcpIpv6Stream.mode(), TransportMode::Stream);
        assert_eq!(Transport::UdpIpv4Datagram.protocol(), TransportProtocol::Udp);
        assert_eq!(Transport::LocalDatagram.mode(), TransportMode::Datagram);
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        assert!(Transport::resolve(TransportProtocol::Tcp, TransportDomain::Local).is_err());
        assert!(Transport::resolve(TransportProtocol::Local, TransportDomain::Ipv4).is_err());
    }

    #[test]
    fn endpoint_parse_and_display() {
        let ep: Endpoint = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(ep.to_string(), "127.0.0.1:8080");
        assert_eq!(ep.domain(), TransportDomain::Ipv4);

        let ep: Endpoint = "[::1]:53".parse().unwrap();
        assert_eq!(ep.to_string(), "[::1]:53");
    }

    #[test]
    fn address_type_filter() {
        let v4 = IpAddress::V4(Ipv4Addr::LOCALHOST);
        assert!(v4.matches(IpAddressType::Any));
        assert!(v4.matches(IpAddressType::V4));
        assert!(!v4.matches(IpAddressType::V6));
    }
}
