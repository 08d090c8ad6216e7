//! Transport state of a pooled connection

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Built, no addresses resolved yet
    Idle,
    /// Resolver is rebuilding after losing its watch
    Connecting,
    /// At least one address is known
    Ready,
    /// No addresses, or the transport stopped accepting updates
    TransientFailure,
    /// Closed
    Shutdown,
}

impl ConnectionState {
    /// Idle and Connecting count as usable: the resolver may still be
    /// populating addresses.
    pub fn is_usable(self) -> bool {
        !matches!(self, ConnectionState::TransientFailure | ConnectionState::Shutdown)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Ready => "READY",
            ConnectionState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectionState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}
