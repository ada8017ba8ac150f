//! Congestion control for the send path: classic slow start plus linear
//!  congestion avoidance, with a collapse to a single MTU on timeout.
//!
//! The controller never sends anything itself. It decides how many bytes may
//!  be outstanding ([CongestionController::admit]), and it is told about the
//!  two events that are allowed to move the window: a cumulative ack covering
//!  new bytes, and a retransmission timeout. Duplicate acks are deliberately
//!  not a signal - timeout is the only loss detector in this protocol.

use std::cmp::max;

use tracing::{debug, trace};

use crate::config::{INITIAL_CWND, INITIAL_SSTHRESH, MTU_SIZE};

const MTU: u32 = MTU_SIZE as u32;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CongestionPhase {
    SlowStart,
    CongestionAvoidance,
}

#[derive(Debug)]
pub struct CongestionController {
    /// congestion window: upper bound for unacknowledged bytes in flight
    cwnd: u32,
    /// cwnd value at which growth switches from slow start to linear
    ssthresh: u32,
}

impl CongestionController {
    pub fn new() -> CongestionController {
        CongestionController {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn phase(&self) -> CongestionPhase {
        if self.cwnd < self.ssthresh {
            CongestionPhase::SlowStart
        } else {
            CongestionPhase::CongestionAvoidance
        }
    }

    /// true iff `additional` more bytes fit into the window next to what is
    ///  already in flight.
    pub fn admit(&self, bytes_in_flight: u32, additional: u32) -> bool {
        bytes_in_flight.saturating_add(additional) <= self.cwnd
    }

    /// Called once per cumulative ack that covers new bytes. In slow start the
    ///  window grows by the acked byte count; in congestion avoidance by
    ///  roughly one MTU per round trip.
    pub fn on_ack(&mut self, newly_acked: u32) {
        if newly_acked == 0 {
            return;
        }

        match self.phase() {
            CongestionPhase::SlowStart => {
                self.cwnd = self.cwnd.saturating_add(newly_acked);
            }
            CongestionPhase::CongestionAvoidance => {
                self.cwnd = self.cwnd.saturating_add(MTU * MTU / self.cwnd);
            }
        }
        trace!("{} newly acked bytes -> cwnd {} ({:?})", newly_acked, self.cwnd, self.phase());
    }

    /// Called once per retransmission timeout event, regardless of how many
    ///  segments are outstanding at that moment.
    pub fn on_timeout(&mut self) {
        self.ssthresh = max(self.cwnd / 2, 2 * MTU);
        self.cwnd = MTU;
        debug!("retransmission timeout -> cwnd {}, ssthresh {}", self.cwnd, self.ssthresh);
    }

    #[cfg(test)]
    fn set_internals(&mut self, cwnd: u32, ssthresh: u32) {
        self.cwnd = cwnd;
        self.ssthresh = ssthresh;
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}
