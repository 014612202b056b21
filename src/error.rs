use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the secure stream adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// The datagram transport failed. Always fatal for the session.
    #[error("Transport error: {0}")]
    Io(#[from] io::Error),

    /// The DTLS engine reported an error other than the peer's close-notify.
    #[error("Engine error {code}: {message}")]
    Engine { code: i32, message: String },

    /// A datagram had to be sent after the transport was released.
    #[error("No underlying transport")]
    NoTransport,

    /// The session has ended (or is ending) and accepts no more writes.
    #[error("Session closed")]
    Closed,

    /// The write queue is full. Wait for [`crate::DtlsSocket::ready`].
    #[error("Write queue full")]
    WouldBlock,

    /// Key material could not be read from disk.
    #[error("Failed to read key material from {path}: {source}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Key material was read but could not be decoded.
    #[error("Invalid {0}")]
    KeyMaterial(&'static str),

    /// The configuration is incomplete or inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    /// The peer host did not resolve to any socket address.
    #[error("Failed to resolve {0}")]
    Resolve(String),
}

impl Error {
    /// Build an engine error from a raw engine code.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Error::Engine {
            code,
            message: message.into(),
        }
    }

    /// The raw engine code, if this is an engine error.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            Error::Engine { code, .. } => Some(*code),
            _ => None,
        }
    }
}
