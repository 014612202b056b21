//! Notifications delivered to the owner of a [`crate::DtlsSocket`].

use crate::Error;

/// Something that happened on the session.
///
/// Per session: `Connected` at most once and before any `Data`; `End` once;
/// `Closed` exactly once and always last.
#[derive(Debug)]
pub enum Event {
    /// The secure connection is established.
    Connected,
    /// Decrypted application data.
    Data(Vec<u8>),
    /// An error not tied to a pending write.
    Error(Error),
    /// No more data will be read.
    End,
    /// Engine and transport are released. `had_error` tells a clean
    /// shutdown from an error-driven one.
    Closed { had_error: bool },
}

impl Event {
    pub fn is_closed(&self) -> bool {
        matches!(self, Event::Closed { .. })
    }
}
