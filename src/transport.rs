//! Socket setup for the built-in methods.
//!
//! Everything here hands out non-blocking handles registered with the tokio
//! reactor. Setup failures are [`Error`]s and abort `init()`; failures of an
//! individual write or read are left to the caller to record.
use async_trait::async_trait;
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, UdpSocket},
};

use crate::{Error, Result};

/// Resolves `target` (`host:port`) to its first socket address.
pub async fn resolve(target: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(target)
        .await
        .map_err(|source| Error::Resolve {
            target: target.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| Error::Resolve {
        target: target.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    })
}

/// A connected datagram socket shared by every worker of a method.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Writes one datagram to the connected peer.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Opens a second handle on the same underlying socket, with a readiness
    /// registration of its own. The handle is closed when dropped.
    fn duplicate(&self) -> io::Result<Box<dyn DatagramSocket>>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    fn duplicate(&self) -> io::Result<Box<dyn DatagramSocket>> {
        Ok(Box::new(dup_udp(self)?))
    }
}

/// Creates a datagram socket of the target's family and connects it.
///
/// Connecting a datagram socket only fixes the default peer: nothing is sent,
/// so an unreachable target shows up later, on write.
pub async fn connect_datagram(addr: SocketAddr) -> Result<UdpSocket> {
    let local: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await.map_err(Error::Socket)?;
    socket
        .connect(addr)
        .await
        .map_err(|source| Error::Connect { addr, source })?;
    Ok(socket)
}

#[cfg(unix)]
fn dup_std(socket: &UdpSocket) -> io::Result<std::net::UdpSocket> {
    use std::os::fd::AsFd;
    let fd = socket.as_fd().try_clone_to_owned()?;
    Ok(std::net::UdpSocket::from(fd))
}

#[cfg(windows)]
fn dup_std(socket: &UdpSocket) -> io::Result<std::net::UdpSocket> {
    use std::os::windows::io::AsSocket;
    let sock = socket.as_socket().try_clone_to_owned()?;
    Ok(std::net::UdpSocket::from(sock))
}

/// Duplicates the descriptor behind `socket` and registers the copy with the
/// reactor. Must be called from within a tokio runtime.
pub fn dup_udp(socket: &UdpSocket) -> io::Result<UdpSocket> {
    let dup = dup_std(socket)?;
    dup.set_nonblocking(true)?;
    UdpSocket::from_std(dup)
}

/// Opens stream connections for a stream method, one per worker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Stream>;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}
