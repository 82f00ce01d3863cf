//! Socket layer: TCP (plain + TLS) and UDP (unicast + broadcast) byte-level
//! transport, all reuse-address, all blocking.
//!
//! The source this crate is modeled on composes a secured/unsecured TCP
//! connection through a tagged union over three socket variants (plain,
//! TLS 1.2, TLS 1.3). Here that's a single [TcpSocket] trait with three
//! concrete implementers; the channel layer is generic over the trait object
//! rather than over a concrete type, since a conversation picks its transport
//! once at connect time and never switches.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::SocketError;

/// Which TLS protocol version to restrict the handshake to. Certificate
/// provisioning (trust roots, client certs) is the caller's responsibility;
/// this crate only selects the transport.
#[cfg(feature = "tls")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2
    V1_2,
    /// TLS 1.3
    V1_3,
}

/// A byte-level TCP transport: either a plain socket or one secured with TLS.
/// Every implementer is blocking and reuse-address.
pub trait TcpSocket: Read + Write + Send {
    /// Shuts down both halves of the underlying connection.
    fn shutdown(&self) -> io::Result<()>;
    /// Sets the read timeout used by [Read::read] (a zero read with no data
    /// available returns [io::ErrorKind::WouldBlock]).
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
}

/// Opens a plain (unsecured) TCP connection with `SO_REUSEADDR` set.
pub struct PlainTcpSocket {
    stream: TcpStream,
}

impl PlainTcpSocket {
    /// Connects to `addr`, binding the local side with reuse-address enabled.
    pub fn connect(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.connect(&SockAddr::from(addr))?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Read for PlainTcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for PlainTcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl TcpSocket for PlainTcpSocket {
    fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(dur)
    }
}

/// A TCP connection secured with TLS 1.2 or 1.3, used when routing activation
/// comes back with `TLSRequired` (response code `0x07`).
#[cfg(feature = "tls")]
pub struct TlsTcpSocket {
    conn: rustls::StreamOwned<rustls::ClientConnection, TcpStream>,
}

#[cfg(feature = "tls")]
impl TlsTcpSocket {
    /// Connects to `addr` and performs a TLS handshake restricted to
    /// `version`, using `config` for trust roots/client auth (provisioning
    /// those is explicitly out of this crate's scope).
    pub fn connect(
        addr: SocketAddr,
        server_name: rustls_pki_types::ServerName<'static>,
        version: TlsVersion,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.connect(&SockAddr::from(addr))?;
        let stream: TcpStream = socket.into();
        stream.set_nodelay(true)?;

        // `config` is expected to already be restricted to the requested
        // version range by the caller; `version` is recorded for logging.
        log::debug!("establishing TLS ({:?}) connection to {}", version, addr);

        let client = rustls::ClientConnection::new(config, server_name)
            .map_err(|e| SocketError::GenericError(format!("TLS setup failed: {}", e)))?;
        Ok(Self {
            conn: rustls::StreamOwned::new(client, stream),
        })
    }
}

#[cfg(feature = "tls")]
impl Read for TlsTcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf)
    }
}

#[cfg(feature = "tls")]
impl Write for TlsTcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

#[cfg(feature = "tls")]
impl TcpSocket for TlsTcpSocket {
    fn shutdown(&self) -> io::Result<()> {
        self.conn.sock.shutdown(std::net::Shutdown::Both)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.conn.sock.set_read_timeout(dur)
    }
}

/// The UDP transport pair a `VdConversation` owns: a broadcast-listening
/// socket for passive vehicle announcements, and a unicast socket for active
/// vehicle-identification transactions.
pub struct UdpChannelSockets {
    /// Bound to the local interface, `SO_BROADCAST` set, receives
    /// unsolicited vehicle announcements.
    pub broadcast: StdUdpSocket,
    /// Used to send `VehicleIdentificationRequest*` and collect responses.
    pub unicast: StdUdpSocket,
}

impl UdpChannelSockets {
    /// Binds both sockets to `local_ip:DOIP_PORT` with reuse-address; the
    /// broadcast socket additionally enables `SO_BROADCAST`.
    pub fn bind(local_ip: IpAddr) -> Result<Self, SocketError> {
        let addr = SocketAddr::new(local_ip, crate::codec::DOIP_PORT);
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

        let broadcast_sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        broadcast_sock.set_reuse_address(true)?;
        broadcast_sock.set_broadcast(true)?;
        broadcast_sock.bind(&SockAddr::from(addr))?;

        let unicast_sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        unicast_sock.set_reuse_address(true)?;
        // The unicast socket still needs to be able to *send* to a broadcast
        // destination address, so it also gets SO_BROADCAST.
        unicast_sock.set_broadcast(true)?;
        unicast_sock.bind(&SockAddr::from(SocketAddr::new(local_ip, 0)))?;

        Ok(Self {
            broadcast: broadcast_sock.into(),
            unicast: unicast_sock.into(),
        })
    }
}
