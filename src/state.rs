//! Adapter lifecycle.

use std::fmt;

/// Lifecycle state of one peer session.
///
/// ```text
/// Connecting -> Handshaking -> Connected
///                    |             |
///                    +-> Ending <--+
///                          |
///                          v
///                        Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, handshake kick-off not run yet.
    Connecting,
    /// Engine `connect()` called, waiting for handshake completion.
    Handshaking,
    /// Handshake done, application data flows.
    Connected,
    /// Teardown started. No more input, engine released.
    Ending,
    /// Engine and transport both released. Terminal.
    Closed,
}

impl State {
    /// Whether teardown has started.
    pub fn is_ending(&self) -> bool {
        matches!(self, State::Ending | State::Closed)
    }

    /// Whether a shutdown trigger may move this state to `Ending`.
    pub fn can_end(&self) -> bool {
        !self.is_ending()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Connecting => "connecting",
            State::Handshaking => "handshaking",
            State::Connected => "connected",
            State::Ending => "ending",
            State::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ending_states() {
        assert!(State::Connecting.can_end());
        assert!(State::Handshaking.can_end());
        assert!(State::Connected.can_end());
        assert!(!State::Ending.can_end());
        assert!(State::Closed.is_ending());
    }

    #[test]
    fn display() {
        assert_eq!(State::Handshaking.to_string(), "handshaking");
    }
}
