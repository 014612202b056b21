//! Datagram transport shim.
//!
//! Thin façade over a connectionless packet socket: send one datagram to a
//! peer, receive the next inbound datagram, close.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::config::DEFAULT_MAX_DATAGRAM_SIZE;

/// An unreliable, unordered datagram transport.
///
/// The adapter owns its transport exclusively and calls it from one task.
#[async_trait]
pub trait Transport: Send {
    /// Send one datagram. Resolves when the send completed or failed.
    async fn send_to(&mut self, datagram: &[u8], target: SocketAddr) -> io::Result<()>;

    /// Receive the next inbound datagram.
    ///
    /// `Ok(None)` means the transport closed and nothing more will arrive.
    /// `Err` is a transport failure. Must be cancel safe.
    async fn recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;

    /// Release the transport. Closing twice is a no-op.
    async fn close(&mut self) -> io::Result<()>;

    /// Local address the transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// UDP transport over a tokio socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind a new UDP socket.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket)
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);
        Ok(Self {
            socket: Some(socket),
            local_addr,
            buf: vec![0; DEFAULT_MAX_DATAGRAM_SIZE],
        })
    }

    /// Wrap an already bound std socket. The socket is switched to
    /// non-blocking mode.
    pub fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Self::from_socket(UdpSocket::from_std(socket)?)
    }

    /// Set the largest datagram [`Transport::recv`] can return whole.
    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.buf.resize(size, 0);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&mut self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        let n = self.socket()?.send_to(datagram, target).await?;
        if n != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram send {} of {}", n, datagram.len()),
            ));
        }
        trace!("Sent {} bytes to {}", n, target);
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        let (n, from) = socket.recv_from(&mut self.buf).await?;
        trace!("Received {} bytes from {}", n, from);
        Ok(Some((self.buf[..n].to_vec(), from)))
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.socket.take().is_some() {
            debug!("UDP transport {} closed", self.local_addr);
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?;
        Ok(self.local_addr)
    }
}
