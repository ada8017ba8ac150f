use thiserror::Error;

use crate::connection::ConnectionState;

/// Errors surfaced to users of a [Connection](crate::connection::Connection).
///
/// Loss, corruption, duplication and reordering of individual datagrams are
///  recovered inside the engine and never show up here; what does show up is
///  either a protocol-level failure or a failure of the local transport itself.
#[derive(Debug, Error)]
pub enum ConfundoError {
    /// No valid SYN-ACK arrived within the response window. The caller may
    ///  retry `connect()` a bounded number of times or give up.
    #[error("no valid SYN-ACK within the response window")]
    HandshakeTimeout,

    /// `send()` or `close()` was called in a state where it makes no sense.
    #[error("connection is not established (state {state:?})")]
    ConnectionNotEstablished { state: ConnectionState },

    /// A segment exhausted its retransmission budget. The connection is moved
    ///  to CLOSED without a regular teardown.
    #[error("connection lost: segment {sequence_number} still unacknowledged after {retries} retransmissions")]
    ConnectionLost { sequence_number: u32, retries: u32 },

    /// The underlying datagram transport failed locally. Never retried by the
    ///  engine - an unreliable network is expected, a broken socket is not.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}

impl From<anyhow::Error> for ConfundoError {
    fn from(e: anyhow::Error) -> Self {
        ConfundoError::Transport(e)
    }
}
