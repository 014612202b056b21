use std::net::SocketAddr;

use crate::keys::KeyMaterial;
use crate::Error;

/// Largest datagram the UDP transport will receive by default.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_535;

/// Writes a socket accepts before the earliest of them has completed.
pub const DEFAULT_WRITE_QUEUE_LIMIT: usize = 64;

/// Session configuration.
///
/// One config describes one peer session: where to send, which key material
/// to hand to the DTLS engine and how the owned transport is bound.
#[derive(Debug, Clone)]
pub struct Config {
    host: String,
    port: u16,
    key: KeyMaterial,
    peer_public_key: KeyMaterial,
    debug: bool,
    bind_addr: Option<SocketAddr>,
    max_datagram_size: usize,
    write_queue_limit: usize,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            host: None,
            port: None,
            key: None,
            peer_public_key: None,
            debug: false,
            bind_addr: None,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            write_queue_limit: DEFAULT_WRITE_QUEUE_LIMIT,
        }
    }

    /// Remote host, a name or a literal address.
    #[inline(always)]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port.
    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Our private key.
    #[inline(always)]
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    /// The peer's public key.
    #[inline(always)]
    pub fn peer_public_key(&self) -> &KeyMaterial {
        &self.peer_public_key
    }

    /// Whether the engine should emit debug output.
    ///
    /// Also raises the adapter's own state transition logging to `info`.
    #[inline(always)]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Local address for the socket created by [`crate::connect`].
    ///
    /// `None` binds the wildcard address of the peer's family on an
    /// ephemeral port.
    #[inline(always)]
    pub fn bind_addr(&self) -> Option<SocketAddr> {
        self.bind_addr
    }

    /// Receive buffer size of the owned UDP transport.
    #[inline(always)]
    pub fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }

    /// Writes accepted but not yet completed, the in-flight one included.
    #[inline(always)]
    pub fn write_queue_limit(&self) -> usize {
        self.write_queue_limit
    }
}

/// Builder for session configuration.
pub struct ConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    key: Option<KeyMaterial>,
    peer_public_key: Option<KeyMaterial>,
    debug: bool,
    bind_addr: Option<SocketAddr>,
    max_datagram_size: usize,
    write_queue_limit: usize,
}

impl ConfigBuilder {
    /// Set the remote host. Required.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the remote port. Required.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set our private key, as raw bytes or a path. Required.
    pub fn key(mut self, key: impl Into<KeyMaterial>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the peer's public key, as raw bytes or a path. Required.
    pub fn peer_public_key(mut self, key: impl Into<KeyMaterial>) -> Self {
        self.peer_public_key = Some(key.into());
        self
    }

    /// Enable engine debug output.
    ///
    /// Defaults to false.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the local bind address for the owned socket.
    ///
    /// Defaults to the wildcard address of the peer's family, port 0.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set the receive buffer size of the owned UDP transport.
    ///
    /// Defaults to 65535.
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    /// Set how many writes may be outstanding at once.
    ///
    /// Further writes fail with `Error::WouldBlock` until one completes. A
    /// limit of 1 makes the socket not ready for as long as a write is in
    /// flight.
    ///
    /// Defaults to 64.
    pub fn write_queue_limit(mut self, limit: usize) -> Self {
        self.write_queue_limit = limit;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::Config` when a required field is missing. Key material
    /// is not touched here; it is loaded once when the socket is created.
    pub fn build(self) -> Result<Config, Error> {
        let host = self
            .host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config("host is required".into()))?;
        let port = self
            .port
            .ok_or_else(|| Error::Config("port is required".into()))?;
        let key = self
            .key
            .ok_or_else(|| Error::Config("key is required".into()))?;
        let peer_public_key = self
            .peer_public_key
            .ok_or_else(|| Error::Config("peer public key is required".into()))?;

        if self.max_datagram_size == 0 {
            return Err(Error::Config("max datagram size must be non-zero".into()));
        }
        if self.write_queue_limit == 0 {
            return Err(Error::Config("write queue limit must be non-zero".into()));
        }

        Ok(Config {
            host,
            port,
            key,
            peer_public_key,
            debug: self.debug,
            bind_addr: self.bind_addr,
            max_datagram_size: self.max_datagram_size,
            write_queue_limit: self.write_queue_limit,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn builder() -> ConfigBuilder {
        Config::builder()
            .host("127.0.0.1")
            .port(5684)
            .key(vec![1, 2, 3])
            .peer_public_key("/etc/peer.der")
    }

    #[test]
    fn defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.host(), "127.0.0.1");
        assert_eq!(config.port(), 5684);
        assert!(!config.debug());
        assert_eq!(config.bind_addr(), None);
        assert_eq!(config.max_datagram_size(), DEFAULT_MAX_DATAGRAM_SIZE);
        assert_eq!(config.write_queue_limit(), DEFAULT_WRITE_QUEUE_LIMIT);
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = Config::builder()
            .port(1)
            .key(vec![1])
            .peer_public_key(vec![2])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_host_is_rejected() {
        let err = builder().host("").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_peer_key_is_rejected() {
        let err = Config::builder()
            .host("localhost")
            .port(1)
            .key(vec![1])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(m) if m.contains("peer")));
    }

    #[test]
    fn zero_datagram_size_is_rejected() {
        let err = builder().max_datagram_size(0).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_write_queue_limit_is_rejected() {
        let err = builder().write_queue_limit(0).build().unwrap_err();
        assert!(matches!(err, Error::Config(m) if m.contains("write queue")));
    }
}
