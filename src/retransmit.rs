//! Bookkeeping for sent-but-unacknowledged segments.
//!
//! The queue is ordered by stream offset, and the retransmission timer always
//!  tracks the *oldest* outstanding segment - standard cumulative-ack timeout
//!  semantics. Offsets are absolute (unwrapped to u64) so ordering survives
//!  wrap-around of the 32-bit wire sequence numbers; the connection maps
//!  between the two representations.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{trace, warn};

/// A transmitted chunk waiting for its cumulative ack.
pub struct InFlightSegment {
    /// absolute stream offset of the first payload byte
    pub offset: u64,
    pub payload: Bytes,
    /// refreshed on every retransmission
    pub sent_at: Instant,
    pub retry_count: u32,
}

/// Returned when a segment exceeded its retransmission budget - the connection
///  is beyond saving at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudgetExhausted {
    pub offset: u64,
    pub retries: u32,
}

pub struct RetransmitQueue {
    segments: BTreeMap<u64, InFlightSegment>,
    bytes_in_flight: u32,
    retransmission_timeout: Duration,
    max_retransmissions: u32,
    total_retransmissions: u64,
}

impl RetransmitQueue {
    pub fn new(retransmission_timeout: Duration, max_retransmissions: u32) -> RetransmitQueue {
        RetransmitQueue {
            segments: BTreeMap::default(),
            bytes_in_flight: 0,
            retransmission_timeout,
            max_retransmissions,
            total_retransmissions: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    pub fn total_retransmissions(&self) -> u64 {
        self.total_retransmissions
    }

    /// Registers a freshly transmitted chunk, arming the timer for it if it is
    ///  the only one outstanding.
    pub fn register(&mut self, offset: u64, payload: Bytes) {
        self.bytes_in_flight += payload.len() as u32;
        self.segments.insert(offset, InFlightSegment {
            offset,
            payload,
            sent_at: Instant::now(),
            retry_count: 0,
        });
    }

    /// The moment at which the oldest outstanding segment must be re-sent, or
    ///  `None` while nothing is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.segments.values().next()
            .map(|segment| segment.sent_at + self.retransmission_timeout)
    }

    /// Called when the timer expired: refreshes the oldest outstanding segment
    ///  for resending and charges its retry budget. Only this one segment is
    ///  re-sent per expiry.
    pub fn on_timer_expiry(&mut self) -> Result<(u64, Bytes), RetryBudgetExhausted> {
        let segment = self.segments.values_mut().next()
            .expect("retransmission timer fired without outstanding segments");

        if segment.retry_count >= self.max_retransmissions {
            warn!("segment at offset {} exhausted its budget of {} retransmissions", segment.offset, segment.retry_count);
            return Err(RetryBudgetExhausted {
                offset: segment.offset,
                retries: segment.retry_count,
            });
        }

        segment.retry_count += 1;
        segment.sent_at = Instant::now();
        self.total_retransmissions += 1;
        trace!("retransmitting segment at offset {} (attempt {})", segment.offset, segment.retry_count);
        Ok((segment.offset, segment.payload.clone()))
    }

    /// Retires every segment whose range is fully covered by `ack_offset` and
    ///  returns the newly acknowledged byte count. The timer implicitly
    ///  re-arms against the new oldest segment (or disarms if none remain).
    pub fn on_cumulative_ack(&mut self, ack_offset: u64) -> u32 {
        let mut newly_acked = 0u32;
        loop {
            let Some((&offset, segment)) = self.segments.first_key_value() else {
                break;
            };
            if offset + segment.payload.len() as u64 > ack_offset {
                break;
            }
            let len = segment.payload.len() as u32;
            self.segments.remove(&offset);
            newly_acked += len;
        }

        self.bytes_in_flight -= newly_acked;
        if newly_acked > 0 {
            trace!("ack up to offset {} retired {} bytes, {} still in flight", ack_offset, newly_acked, self.bytes_in_flight);
        }
        newly_acked
    }
}
