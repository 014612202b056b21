//! The DTLS engine capability.
//!
//! The adapter never speaks DTLS itself. It drives an [`Engine`] that owns
//! the handshake, the record layer and the alerts, and moves whatever the
//! engine produces between the application and the transport.
//!
//! Engines are sans-IO: every call gets an [`EngineOutputs`] sink and pushes
//! the datagrams it wants sent, the handshake-complete signal and errors into
//! it before returning. The adapter drains the sink after each call.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use zeroize::Zeroizing;

use crate::keys::Credentials;
use crate::Error;

/// Engine error code for a graceful close-notify alert from the peer.
///
/// Not an error: it ends the session cleanly.
pub const PEER_CLOSE_NOTIFY: i32 = -0x7880;

/// Something the engine wants the adapter to act on.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineOutput {
    /// A ciphertext datagram to send to the peer.
    Datagram(Vec<u8>),
    /// The handshake completed.
    HandshakeComplete,
    /// The engine hit an error. `code == PEER_CLOSE_NOTIFY` is the peer
    /// closing the session.
    Error { code: i32, message: String },
}

/// Queue of outputs produced during one engine call.
#[derive(Debug, Default)]
pub struct EngineOutputs {
    queue: VecDeque<EngineOutput>,
}

impl EngineOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a ciphertext datagram.
    pub fn datagram(&mut self, datagram: impl Into<Vec<u8>>) {
        self.queue.push_back(EngineOutput::Datagram(datagram.into()));
    }

    /// Signal that the handshake completed.
    pub fn handshake_complete(&mut self) {
        self.queue.push_back(EngineOutput::HandshakeComplete);
    }

    /// Report an engine error.
    pub fn error(&mut self, code: i32, message: impl Into<String>) {
        self.queue.push_back(EngineOutput::Error {
            code,
            message: message.into(),
        });
    }

    pub fn pop(&mut self) -> Option<EngineOutput> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Iterator for EngineOutputs {
    type Item = EngineOutput;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}

/// Negotiated session parameters, for diagnostics and resumption.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Session identifier assigned by the server.
    pub id: Vec<u8>,
    /// IANA cipher suite number.
    pub cipher_suite: u16,
    /// Master secret.
    pub master_secret: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cipher_suite", &format_args!("0x{:04x}", self.cipher_suite))
            .finish_non_exhaustive()
    }
}

/// A DTLS engine driven by the adapter.
///
/// Calls never block. Ciphertext, handshake completion and errors are
/// reported through `out`.
pub trait Engine: Send {
    /// Start the handshake.
    fn connect(&mut self, out: &mut EngineOutputs);

    /// Encrypt application data. May produce several datagrams if the
    /// record is fragmented, or none.
    fn send(&mut self, plaintext: &[u8], out: &mut EngineOutputs);

    /// Feed one inbound datagram. Returns decrypted application data, or
    /// `None` when the datagram carried none (handshake or control traffic).
    fn receive_data(&mut self, datagram: &[u8], out: &mut EngineOutputs) -> Option<Vec<u8>>;

    /// Release engine resources.
    ///
    /// Returns `true` when nothing further needs sending, `false` when a
    /// close-notify datagram was pushed to `out` and must still go out.
    fn close(&mut self, out: &mut EngineOutputs) -> bool;

    /// Negotiated session, once there is one.
    fn session(&self) -> Option<Session>;

    /// Number of records sent so far.
    fn out_counter(&self) -> u64;

    /// Next instant the engine wants [`Engine::handle_timeout`] called.
    ///
    /// Engines that arm their own timers return `None`.
    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    /// Drive retransmission and handshake timers.
    fn handle_timeout(&mut self, now: Instant, out: &mut EngineOutputs) {
        let _ = (now, out);
    }
}

/// Creates the engine for a session once the key material is decoded.
pub trait EngineBuilder {
    type Engine: Engine + 'static;

    fn build(self, credentials: Credentials, debug: bool) -> Result<Self::Engine, Error>;
}

impl<F, E> EngineBuilder for F
where
    F: FnOnce(Credentials, bool) -> Result<E, Error>,
    E: Engine + 'static,
{
    type Engine = E;

    fn build(self, credentials: Credentials, debug: bool) -> Result<E, Error> {
        self(credentials, debug)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outputs_drain_in_order() {
        let mut out = EngineOutputs::new();
        out.datagram(vec![1]);
        out.handshake_complete();
        out.error(PEER_CLOSE_NOTIFY, "close notify");
        assert_eq!(out.len(), 3);

        let drained: Vec<_> = out.by_ref().collect();
        assert_eq!(
            drained,
            vec![
                EngineOutput::Datagram(vec![1]),
                EngineOutput::HandshakeComplete,
                EngineOutput::Error {
                    code: PEER_CLOSE_NOTIFY,
                    message: "close notify".into()
                },
            ]
        );
        assert!(out.is_empty());
    }

    #[test]
    fn close_notify_code() {
        assert_eq!(PEER_CLOSE_NOTIFY, -30848);
    }

    #[test]
    fn session_debug_hides_secret() {
        let session = Session {
            id: vec![0xde, 0xad],
            cipher_suite: 0xc0ae,
            master_secret: Zeroizing::new(vec![0x42; 48]),
        };
        let s = format!("{:?}", session);
        assert!(s.contains("0xc0ae"));
        assert!(!s.contains("66"));
    }
}
