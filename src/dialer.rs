//! Outbound connections made on behalf of the engine.
//!
//! The engine asks for sockets by host and port. A [`Dialer`] returns either
//! a plain socket, whose descriptor can be handed over directly, or any
//! async byte stream, which gets bridged through a socket pair.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};

/// Bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Connected datagram transport that has no socket of its own.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Result of a stream dial.
pub enum Connection {
    Tcp(TcpStream),
    Stream(Box<dyn AsyncStream>),
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        Connection::Tcp(stream)
    }
}

/// Result of a datagram dial.
pub enum PacketConnection {
    Udp(UdpSocket),
    Packet(Box<dyn PacketConn>),
}

impl From<UdpSocket> for PacketConnection {
    fn from(socket: UdpSocket) -> Self {
        PacketConnection::Udp(socket)
    }
}

/// Duplicates a socket descriptor and puts the copy in blocking mode, which
/// is what the engine expects of sockets it is handed.
pub(crate) fn dup_blocking(socket: &impl AsFd) -> io::Result<OwnedFd> {
    let fd = socket.as_fd().try_clone_to_owned()?;
    set_blocking(&fd)?;
    Ok(fd)
}

/// Clears `O_NONBLOCK`. Duplicates share the flag with the original.
pub(crate) fn set_blocking(fd: &impl AsRawFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` stays open for the duration of both calls.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Connection {
    /// Hands out a descriptor for the connection, if it has one.
    pub fn try_into_fd(self) -> std::result::Result<OwnedFd, (Self, io::Error)> {
        match self {
            Connection::Tcp(stream) => match dup_blocking(&stream) {
                Ok(fd) => Ok(fd),
                Err(e) => Err((Connection::Tcp(stream), e)),
            },
            other => Err((other, io::ErrorKind::Unsupported.into())),
        }
    }

    pub fn into_stream(self) -> Box<dyn AsyncStream> {
        match self {
            Connection::Tcp(stream) => Box::new(stream),
            Connection::Stream(stream) => stream,
        }
    }
}

/// Makes outbound connections for the engine.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<Connection>;
    async fn dial_udp(&self, host: &str, port: u16) -> io::Result<PacketConnection>;
}

/// Dials with the operating system's sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial_tcp(&self, host: &str, port: u16) -> io::Result<Connection> {
        let stream = TcpStream::connect(host_port(host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Connection::Tcp(stream))
    }

    async fn dial_udp(&self, host: &str, port: u16) -> io::Result<PacketConnection> {
        let remote = tokio::net::lookup_host(host_port(host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", host)))?;
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        Ok(PacketConnection::Udp(socket))
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Splits `host:port`. IPv6 hosts must be bracketed and are returned
/// without brackets.
pub fn split_host_port(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}
