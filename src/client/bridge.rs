//! Dialer callbacks handed to the engine.
//!
//! The engine asks for sockets from its own threads and waits for the
//! answer, so every callback here blocks on the client's runtime. Three
//! outcomes are possible for a dial:
//!
//! - the internal DNS address gets one end of a socket pair whose other end
//!   is served by the client's resolver,
//! - a connection backed by a real socket has its descriptor duplicated,
//! - anything else is spliced through a socket pair by a background task.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::net::{UnixDatagram, UnixStream};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::dialer::{dup_blocking, Connection, Dialer, PacketConn, PacketConnection};
use crate::dns::{self, Resolver, INTERNAL_DNS_ADDRESS};
use crate::engine::{TcpDialer, UdpDialer};
use crate::net_error::NetError;

const PACKET_BUFFER_SIZE: usize = 65535;

pub(crate) struct Bridge {
    dialer: Arc<dyn Dialer>,
    resolver: Arc<dyn Resolver>,
    runtime: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

fn is_internal_dns(host: &str, port: u16) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    port == INTERNAL_DNS_ADDRESS.port()
        && host.parse::<std::net::IpAddr>().ok() == Some(INTERNAL_DNS_ADDRESS.ip())
}

fn pair_failed(e: io::Error) -> NetError {
    debug!(error = %e, "failed to create socket pair");
    NetError::CONNECTION_FAILED
}

impl Bridge {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        resolver: Arc<dyn Resolver>,
        runtime: Handle,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dialer,
            resolver,
            runtime,
            tracker,
            cancel,
        }
    }

    pub fn tcp_dialer(self: &Arc<Self>) -> TcpDialer {
        let bridge = self.clone();
        Arc::new(move |host: &str, port: u16| bridge.dial_tcp(host, port))
    }

    pub fn udp_dialer(self: &Arc<Self>) -> UdpDialer {
        let bridge = self.clone();
        Arc::new(move |host: &str, port: u16| bridge.dial_udp(host, port))
    }

    /// Connects a stream socket for the engine. Must not be called from a
    /// runtime worker thread.
    pub fn dial_tcp(&self, host: &str, port: u16) -> Result<OwnedFd, NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::ABORTED);
        }
        if is_internal_dns(host, port) {
            return self.serve_dns_stream();
        }

        let conn = self.runtime.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(NetError::ABORTED),
                result = self.dialer.dial_tcp(host, port) => result.map_err(|e| {
                    debug!(host, port, error = %e, "tcp dial failed");
                    NetError::from_io_error(&e)
                }),
            }
        })?;

        match conn.try_into_fd() {
            Ok(fd) => {
                trace!(host, port, "handing over dialed socket");
                Ok(fd)
            }
            Err((conn, e)) => {
                trace!(host, port, reason = %e, "splicing dialed connection");
                self.splice_stream(conn)
            }
        }
    }

    /// Connects a datagram socket for the engine and reports its local
    /// address. Must not be called from a runtime worker thread.
    pub fn dial_udp(&self, host: &str, port: u16) -> Result<(OwnedFd, SocketAddr), NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::ABORTED);
        }
        if is_internal_dns(host, port) {
            return self.serve_dns_packet();
        }

        let conn = self.runtime.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(NetError::ABORTED),
                result = self.dialer.dial_udp(host, port) => result.map_err(|e| {
                    debug!(host, port, error = %e, "udp dial failed");
                    NetError::from_io_error(&e)
                }),
            }
        })?;

        match conn {
            PacketConnection::Udp(socket) => {
                let local = socket.local_addr().map_err(|e| NetError::from_io_error(&e))?;
                let fd = dup_blocking(&socket).map_err(|e| NetError::from_io_error(&e))?;
                Ok((fd, local))
            }
            PacketConnection::Packet(conn) => {
                let local = conn
                    .local_addr()
                    .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
                let fd = self.splice_packets(conn)?;
                Ok((fd, local))
            }
        }
    }

    fn serve_dns_stream(&self) -> Result<OwnedFd, NetError> {
        let (engine_end, local_end) = std::os::unix::net::UnixStream::pair().map_err(pair_failed)?;
        local_end.set_nonblocking(true).map_err(pair_failed)?;
        let local = {
            let _enter = self.runtime.enter();
            UnixStream::from_std(local_end).map_err(pair_failed)?
        };

        let resolver = self.resolver.clone();
        let cancel = self.cancel.child_token();
        self.tracker.spawn_on(
            async move {
                if let Err(e) = dns::serve_stream(local, &resolver, cancel).await {
                    debug!(error = %e, "dns stream server stopped");
                }
            },
            &self.runtime,
        );
        Ok(OwnedFd::from(engine_end))
    }

    fn serve_dns_packet(&self) -> Result<(OwnedFd, SocketAddr), NetError> {
        let (engine_end, local_end) = std::os::unix::net::UnixDatagram::pair().map_err(pair_failed)?;
        local_end.set_nonblocking(true).map_err(pair_failed)?;
        let local = {
            let _enter = self.runtime.enter();
            UnixDatagram::from_std(local_end).map_err(pair_failed)?
        };

        let resolver = self.resolver.clone();
        let cancel = self.cancel.child_token();
        self.tracker.spawn_on(
            async move {
                if let Err(e) = dns::serve_packet(local, &resolver, cancel).await {
                    debug!(error = %e, "dns packet server stopped");
                }
            },
            &self.runtime,
        );
        Ok((OwnedFd::from(engine_end), SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))))
    }

    fn splice_stream(&self, conn: Connection) -> Result<OwnedFd, NetError> {
        let (engine_end, local_end) = std::os::unix::net::UnixStream::pair().map_err(pair_failed)?;
        local_end.set_nonblocking(true).map_err(pair_failed)?;
        let mut local = {
            let _enter = self.runtime.enter();
            UnixStream::from_std(local_end).map_err(pair_failed)?
        };

        let mut remote = conn.into_stream();
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => trace!("splice canceled"),
                    result = tokio::io::copy_bidirectional(&mut remote, &mut local) => match result {
                        Ok((up, down)) => trace!(up, down, "splice finished"),
                        Err(e) => debug!(error = %e, "splice ended"),
                    },
                }
            },
            &self.runtime,
        );
        Ok(OwnedFd::from(engine_end))
    }

    fn splice_packets(&self, conn: Box<dyn PacketConn>) -> Result<OwnedFd, NetError> {
        let (engine_end, local_end) = std::os::unix::net::UnixDatagram::pair().map_err(pair_failed)?;
        local_end.set_nonblocking(true).map_err(pair_failed)?;
        let local = {
            let _enter = self.runtime.enter();
            UnixDatagram::from_std(local_end).map_err(pair_failed)?
        };

        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => trace!("packet splice canceled"),
                    result = relay_packets(&local, conn.as_ref()) => {
                        if let Err(e) = result {
                            debug!(error = %e, "packet splice ended");
                        }
                    }
                }
            },
            &self.runtime,
        );
        Ok(OwnedFd::from(engine_end))
    }
}

async fn relay_packets(local: &UnixDatagram, remote: &dyn PacketConn) -> io::Result<()> {
    let mut up = vec![0u8; PACKET_BUFFER_SIZE];
    let mut down = vec![0u8; PACKET_BUFFER_SIZE];
    loop {
        tokio::select! {
            n = local.recv(&mut up) => {
                let n = n?;
                remote.send(&up[..n]).await?;
            }
            n = remote.recv(&mut down) => {
                let n = n?;
                local.send(&down[..n]).await?;
            }
        }
    }
}
