//! Ordered duplex byte stream over a DTLS session on UDP.
//!
//! `dtls-duplex` turns an unreliable datagram transport and a DTLS engine
//! into a byte stream: writes are encrypted and sent one at a time, decrypted
//! data arrives in order as events, and shutdown (local end, peer
//! close-notify, transport failure) converges on one close sequence.
//!
//! The DTLS protocol itself is not implemented here. Plug one in through the
//! [`Engine`] trait.
//!
//! ```no_run
//! # use dtls_duplex::*;
//! # async fn run(make_engine: impl EngineBuilder) -> Result<(), Error> {
//! let config = Config::builder()
//!     .host("device.example.com")
//!     .port(5684)
//!     .key("keys/device.der")
//!     .peer_public_key("keys/server_pub.der")
//!     .build()?;
//!
//! let mut socket = connect(config, make_engine).await?;
//!
//! while let Some(event) = socket.next_event().await {
//!     match event {
//!         Event::Connected => socket.write(b"hello".to_vec()).await?,
//!         Event::Data(data) => println!("{} bytes", data.len()),
//!         Event::Closed { had_error } => println!("closed, error: {}", had_error),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod config;
pub use config::{Config, ConfigBuilder, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_WRITE_QUEUE_LIMIT};

mod engine;
pub use engine::{Engine, EngineBuilder, EngineOutput, EngineOutputs, Session};
pub use engine::PEER_CLOSE_NOTIFY;

mod error;
pub use error::Error;

mod event;
pub use event::Event;

pub mod keys;
pub use keys::{Credentials, KeyMaterial};

mod socket;
pub use socket::{DtlsSocket, WriteCompletion};

mod state;
pub use state::State;

pub mod transport;
pub use transport::{Transport, UdpTransport};

/// Open a session to the configured peer over a new UDP socket.
///
/// Watch for [`Event::Connected`] on the returned socket to know when the
/// handshake completed.
pub async fn connect<B: EngineBuilder>(config: Config, builder: B) -> Result<DtlsSocket, Error> {
    DtlsSocket::connect(config, builder).await
}
