//! Confundo is a reliable byte-stream transport tunneled through unreliable,
//!  unordered datagrams (UDP or anything shaped like it). It gives the sending
//!  application the illusion of a connection: ordered delivery, loss recovery
//!  and congestion-aware pacing, in the spirit of TCP but far simpler.
//!
//! ## Design goals
//!
//! * One logical byte stream per connection, sender-driven: the typical use is
//!   pushing a finite sequence of chunks (e.g. a file) to a peer.
//! * Loss, duplication and reordering of individual datagrams are handled
//!   inside the engine and never surface to the caller.
//! * Loss detection is timeout-only: the oldest unacknowledged segment is
//!   re-sent when its timer expires. There is no fast retransmit and no
//!   selective acknowledgement - acks are strictly cumulative.
//! * The congestion window follows classic slow start / congestion avoidance,
//!   collapsing to a single MTU on timeout.
//! * The engine is transport-agnostic: it only needs "send a datagram" and
//!   "wait for a datagram with a time bound" (see [transport::Transport]).
//!   That seam is also where tests plug in an in-memory link and a fault
//!   injector.
//!
//! ## Header
//!
//! Every datagram carries one segment - all numbers in network byte order (BE):
//! ```ascii
//!  0: sequence number (u32) - offset of the first payload byte, or the
//!      handshake sequence value for control segments
//!  4: ack number (u32) - the next byte offset the sender of this segment
//!      expects to receive
//!  8: connection id (u16) - assigned by the peer during the handshake
//! 10: reserved (u8) - must be sent as 0, ignored on receive
//! 11: flags (u8) - bit 0 SYN, bit 1 ACK, bit 2 FIN; remaining bits are
//!      reserved and ignored on receive
//! ```
//!
//! The header is followed directly by up to 412 payload bytes, for a maximum
//!  datagram size of 424 bytes.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod fault;
pub mod retransmit;
pub mod segment;
pub mod source;
pub mod test_util;
pub mod transport;
