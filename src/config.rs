use std::time::Duration;

use anyhow::bail;

/// Upper bound for a datagram on the wire, header included. Datagrams above
///  this size are never produced, and inbound ones are discarded unparsed.
pub const MAX_PACKET_SIZE: usize = 424;

/// Serialized header length: seq (4) + ack (4) + connection id (2) +
///  reserved (1) + flags (1).
pub const HEADER_SIZE: usize = 12;

/// Maximum payload bytes per segment.
pub const MTU_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Congestion window at the start of a connection, in bytes.
pub const INITIAL_CWND: u32 = 412;

/// Slow start threshold at the start of a connection, in bytes.
pub const INITIAL_SSTHRESH: u32 = 12000;

/// A segment is re-sent when it stays unacknowledged for this long. The same
///  bound limits the wait for the peer's SYN-ACK during the handshake.
pub const RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound for the FIN exchange: after this, the connection is torn down
///  locally no matter what the peer does. Teardown never blocks forever.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection knobs. The protocol constants above are fixed; this struct
///  only carries the two values that are legitimately per-process: the choice
///  of initial sequence number and the retry budget.
pub struct ConnectionConfig {
    /// The 32-bit starting point of the sequence space. `None` picks a random
    ///  value per connection, which is what production use wants; tests pin it
    ///  for determinism.
    pub initial_sequence_number: Option<u32>,

    /// How often a single segment may be re-sent before the connection is
    ///  given up as lost.
    pub max_retransmissions: u32,
}

impl ConnectionConfig {
    pub fn new() -> ConnectionConfig {
        ConnectionConfig {
            initial_sequence_number: None,
            max_retransmissions: 10,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retransmissions == 0 {
            bail!("a retry budget of 0 would make every lost datagram fatal");
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
