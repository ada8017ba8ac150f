//! The connection engine: this is where codec, congestion control and
//!  retransmission bookkeeping come together. It drives the handshake, the
//!  windowed data transfer and the teardown over a [Transport].
//!
//! Concurrency model: a single-threaded event loop. `connect()`, `send()` and
//!  `close()` are driven by one caller in sequence; whenever the engine has to
//!  wait (window full, handshake pending, teardown), it multiplexes socket
//!  readiness against the retransmission deadline in [Connection::pump]. That
//!  keeps all protocol state owned by one task - there is no shared mutable
//!  state and nothing to lock. `send()` suspends only while the congestion
//!  window is full; `connect()` and `close()` suspend for at most one bounded
//!  timeout each.
//!
//! Sequence numbers: the wire carries 32-bit values that wrap; internally the
//!  engine counts absolute stream offsets as u64, with offset 0 being the SYN
//!  and application data starting at offset 1. Cumulative acks from the peer
//!  are unwrapped against the highest acknowledged offset, which makes
//!  stale/duplicate acks cheap to detect and keeps ack handling monotonic.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{ConnectionConfig, MTU_SIZE, RETRANSMISSION_TIMEOUT, TEARDOWN_TIMEOUT};
use crate::congestion::CongestionController;
use crate::error::ConfundoError;
use crate::retransmit::RetransmitQueue;
use crate::segment::{Segment, SegmentFlags, SegmentHeader};
use crate::source::ChunkSource;
use crate::transport::Transport;

/// Lifecycle of a connection. CLOSE_WAIT is reached when the peer's FIN
///  arrives while we are still ESTABLISHED; during an ordinary teardown the
///  peer's FIN flips FIN_WAIT straight to CLOSED.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    SynSent,
    Established,
    FinWait,
    CloseWait,
}

pub struct Connection {
    transport: Box<dyn Transport>,
    config: ConnectionConfig,
    state: ConnectionState,

    /// wire value of stream offset 0 (the SYN)
    initial_seq: u32,
    /// next stream offset to assign; data starts at 1, the SYN having used 0
    send_offset: u64,
    /// highest cumulatively acknowledged stream offset
    acked_offset: u64,
    /// next in-order sequence number expected from the peer (wire value)
    recv_ack: u32,
    /// assigned by the peer's SYN-ACK; 0 while unassigned
    connection_id: u16,

    congestion: CongestionController,
    retransmit: RetransmitQueue,
}

impl Connection {
    pub fn new(transport: impl Transport + 'static, config: ConnectionConfig) -> anyhow::Result<Connection> {
        config.validate()?;
        let initial_seq = config.initial_sequence_number.unwrap_or_else(rand::random);

        Ok(Connection {
            transport: Box::new(transport),
            state: ConnectionState::Closed,
            initial_seq,
            send_offset: 0,
            acked_offset: 0,
            recv_ack: 0,
            connection_id: 0,
            congestion: CongestionController::new(),
            retransmit: RetransmitQueue::new(RETRANSMISSION_TIMEOUT, config.max_retransmissions),
            config,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The next sequence number to be sent, as it would appear on the wire.
    pub fn send_seq(&self) -> u32 {
        self.wire_seq(self.send_offset)
    }

    pub fn recv_ack(&self) -> u32 {
        self.recv_ack
    }

    pub fn connection_id(&self) -> u16 {
        self.connection_id
    }

    pub fn cwnd(&self) -> u32 {
        self.congestion.cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.congestion.ssthresh()
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.retransmit.bytes_in_flight()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmit.total_retransmissions()
    }

    /// Three-way handshake: SYN out, SYN-ACK in, ACK out. Fails with
    ///  [ConfundoError::HandshakeTimeout] if no valid SYN-ACK arrives within
    ///  the response window; the caller may retry or give up.
    pub async fn connect(&mut self) -> Result<(), ConfundoError> {
        if self.state != ConnectionState::Closed {
            return Err(ConfundoError::ConnectionNotEstablished { state: self.state });
        }

        let syn = SegmentHeader {
            sequence_number: self.initial_seq,
            ack_number: 0,
            connection_id: 0,
            flags: SegmentFlags::SYN,
        };
        self.send_control(syn).await?;
        self.state = ConnectionState::SynSent;
        self.send_offset = 1;
        debug!("sent SYN with initial sequence number {}", self.initial_seq);

        let deadline = Instant::now() + RETRANSMISSION_TIMEOUT;
        loop {
            match self.recv_segment(deadline).await? {
                None => {
                    self.state = ConnectionState::Closed;
                    return Err(ConfundoError::HandshakeTimeout);
                }
                Some(segment) if self.is_valid_syn_ack(&segment.header) => {
                    self.connection_id = segment.header.connection_id;
                    self.recv_ack = segment.header.sequence_number.wrapping_add(1);
                    self.acked_offset = 1;

                    let ack = SegmentHeader {
                        sequence_number: self.wire_seq(1),
                        ack_number: self.recv_ack,
                        connection_id: self.connection_id,
                        flags: SegmentFlags::ACK,
                    };
                    self.send_control(ack).await?;
                    self.state = ConnectionState::Established;
                    info!("connection {} established (peer sequence number {})", self.connection_id, segment.header.sequence_number);
                    return Ok(());
                }
                Some(segment) => {
                    debug!("ignoring {:?} while waiting for SYN-ACK", segment.header);
                }
            }
        }
    }

    /// Queues `data` for transmission in MTU-sized chunks, suspending while
    ///  the congestion window is full. Returns once every chunk has been
    ///  transmitted at least once - not necessarily acknowledged; see
    ///  [Connection::flush].
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConfundoError> {
        if self.state != ConnectionState::Established {
            return Err(ConfundoError::ConnectionNotEstablished { state: self.state });
        }

        for chunk in data.chunks(MTU_SIZE) {
            while !self.congestion.admit(self.retransmit.bytes_in_flight(), chunk.len() as u32) {
                self.pump().await?;
                if self.state != ConnectionState::Established {
                    return Err(ConfundoError::ConnectionNotEstablished { state: self.state });
                }
            }
            self.transmit_chunk(Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(())
    }

    /// Suspends until every transmitted byte is acknowledged.
    pub async fn flush(&mut self) -> Result<(), ConfundoError> {
        while !self.retransmit.is_empty() {
            self.pump().await?;
        }
        Ok(())
    }

    /// Drives an entire [ChunkSource] through the send path and flushes.
    pub async fn send_source(&mut self, source: &mut dyn ChunkSource) -> anyhow::Result<()> {
        while let Some(chunk) = source.next_chunk().await? {
            self.send(&chunk).await?;
        }
        self.flush().await?;
        Ok(())
    }

    /// Flushes outstanding data, then runs the FIN exchange. Bounded: even a
    ///  silent peer cannot keep this from returning once the teardown window
    ///  has elapsed - the connection is then torn down locally.
    pub async fn close(&mut self) -> Result<(), ConfundoError> {
        match self.state {
            ConnectionState::Established | ConnectionState::CloseWait => {}
            state => return Err(ConfundoError::ConnectionNotEstablished { state }),
        }
        self.flush().await?;

        let fin_offset = self.send_offset;
        self.send_offset += 1; // the FIN occupies one sequence number
        let fin = SegmentHeader {
            sequence_number: self.wire_seq(fin_offset),
            ack_number: self.recv_ack,
            connection_id: self.connection_id,
            flags: SegmentFlags::FIN,
        };
        self.send_control(fin.clone()).await?;
        if self.state == ConnectionState::Established {
            self.state = ConnectionState::FinWait;
        }
        debug!("sent FIN at sequence number {}", fin.sequence_number);

        let teardown_deadline = Instant::now() + TEARDOWN_TIMEOUT;
        let mut fin_sent_at = Instant::now();
        loop {
            let teardown_complete = match self.state {
                ConnectionState::Closed => true,
                // the peer closed first; all that is left is the ack of our FIN
                ConnectionState::CloseWait => self.acked_offset >= self.send_offset,
                _ => false,
            };
            if teardown_complete {
                break;
            }
            if Instant::now() >= teardown_deadline {
                debug!("teardown window elapsed - closing locally");
                break;
            }

            let deadline = (fin_sent_at + RETRANSMISSION_TIMEOUT).min(teardown_deadline);
            match self.recv_segment(deadline).await? {
                Some(segment) => self.on_segment(segment).await?,
                None => {
                    if self.acked_offset < self.send_offset && Instant::now() < teardown_deadline {
                        trace!("re-sending FIN");
                        self.send_control(fin.clone()).await?;
                    }
                    fin_sent_at = Instant::now();
                }
            }
        }

        self.state = ConnectionState::Closed;
        info!("connection {} closed", self.connection_id);
        Ok(())
    }

    fn wire_seq(&self, offset: u64) -> u32 {
        self.initial_seq.wrapping_add(offset as u32)
    }

    fn is_valid_syn_ack(&self, header: &SegmentHeader) -> bool {
        header.flags.contains(SegmentFlags::SYN | SegmentFlags::ACK)
            && header.ack_number == self.initial_seq.wrapping_add(1)
    }

    /// Unwraps a 32-bit cumulative ack into absolute stream offsets. `None`
    ///  for duplicates, acks more than half the sequence space behind, and
    ///  acks for data that was never sent - none of those may change state.
    fn unwrap_ack(&self, wire_ack: u32) -> Option<u64> {
        let base = self.wire_seq(self.acked_offset);
        let delta = wire_ack.wrapping_sub(base);
        if delta == 0 || delta >= 0x8000_0000 {
            return None;
        }

        let abs = self.acked_offset + delta as u64;
        if abs > self.send_offset {
            warn!("peer acknowledged {} which is beyond everything sent - ignoring", wire_ack);
            return None;
        }
        Some(abs)
    }

    /// One step of the event loop: waits for inbound traffic or the
    ///  retransmission deadline, whichever comes first. Callers guarantee that
    ///  at least one segment is in flight.
    async fn pump(&mut self) -> Result<(), ConfundoError> {
        let deadline = self.retransmit.next_deadline()
            .expect("pump requires outstanding segments");

        match self.recv_segment(deadline).await? {
            Some(segment) => self.on_segment(segment).await,
            None => self.on_retransmission_timeout().await,
        }
    }

    /// Receives and decodes the next well-formed segment, discarding
    ///  malformed datagrams, until `deadline`. `Ok(None)` = window elapsed.
    async fn recv_segment(&mut self, deadline: Instant) -> Result<Option<Segment>, ConfundoError> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            match self.transport.recv_datagram(deadline - now).await.map_err(ConfundoError::Transport)? {
                None => return Ok(None),
                Some(buf) => match Segment::decode(&buf) {
                    Ok(segment) => {
                        trace!("received {:?} with {} payload bytes", segment.header, segment.payload.len());
                        return Ok(Some(segment));
                    }
                    Err(e) => {
                        warn!("received a malformed datagram - discarding: {}", e);
                    }
                },
            }
        }
    }

    async fn on_segment(&mut self, segment: Segment) -> Result<(), ConfundoError> {
        if self.connection_id != 0 && segment.header.connection_id != self.connection_id {
            warn!("received segment for connection {} on connection {} - ignoring", segment.header.connection_id, self.connection_id);
            return Ok(());
        }

        if segment.header.flags.contains(SegmentFlags::ACK) {
            self.on_ack(segment.header.ack_number);
        }
        if segment.header.flags.contains(SegmentFlags::FIN) {
            self.on_peer_fin(&segment.header).await?;
        }
        Ok(())
    }

    fn on_ack(&mut self, wire_ack: u32) {
        match self.unwrap_ack(wire_ack) {
            Some(abs) => {
                let newly_acked = self.retransmit.on_cumulative_ack(abs);
                self.acked_offset = abs;
                if newly_acked > 0 {
                    self.congestion.on_ack(newly_acked);
                }
                trace!("cumulative ack up to offset {} ({} new bytes, cwnd {})", abs, newly_acked, self.congestion.cwnd());
            }
            None => {
                trace!("duplicate or stale ack {} - no change", wire_ack);
            }
        }
    }

    async fn on_peer_fin(&mut self, header: &SegmentHeader) -> Result<(), ConfundoError> {
        self.recv_ack = header.sequence_number.wrapping_add(1);
        debug!("peer FIN at sequence number {} in state {:?}", header.sequence_number, self.state);

        let ack = SegmentHeader {
            sequence_number: self.send_seq(),
            ack_number: self.recv_ack,
            connection_id: self.connection_id,
            flags: SegmentFlags::ACK,
        };
        self.send_control(ack).await?;

        self.state = match self.state {
            ConnectionState::FinWait => {
                info!("peer FIN acknowledged, teardown complete");
                ConnectionState::Closed
            }
            _ => ConnectionState::CloseWait,
        };
        Ok(())
    }

    async fn on_retransmission_timeout(&mut self) -> Result<(), ConfundoError> {
        match self.retransmit.on_timer_expiry() {
            Ok((offset, payload)) => {
                debug!("retransmission timeout - resending {} bytes at offset {}", payload.len(), offset);
                let header = SegmentHeader {
                    sequence_number: self.wire_seq(offset),
                    ack_number: self.recv_ack,
                    connection_id: self.connection_id,
                    flags: SegmentFlags::empty(),
                };
                self.send_segment(&Segment { header, payload }).await?;
                self.congestion.on_timeout();
                Ok(())
            }
            Err(exhausted) => {
                warn!("segment at offset {} exceeded {} retransmissions - connection lost", exhausted.offset, exhausted.retries);
                self.state = ConnectionState::Closed;
                Err(ConfundoError::ConnectionLost {
                    sequence_number: self.wire_seq(exhausted.offset),
                    retries: exhausted.retries,
                })
            }
        }
    }

    async fn transmit_chunk(&mut self, payload: Bytes) -> Result<(), ConfundoError> {
        let offset = self.send_offset;
        let len = payload.len() as u64;
        let header = SegmentHeader {
            sequence_number: self.wire_seq(offset),
            ack_number: self.recv_ack,
            connection_id: self.connection_id,
            flags: SegmentFlags::empty(),
        };
        trace!("transmitting {} bytes at sequence number {}", len, header.sequence_number);

        self.send_segment(&Segment { header, payload: payload.clone() }).await?;
        self.retransmit.register(offset, payload);
        self.send_offset += len;
        Ok(())
    }

    async fn send_control(&mut self, header: SegmentHeader) -> Result<(), ConfundoError> {
        self.send_segment(&Segment::control(header)).await
    }

    async fn send_segment(&mut self, segment: &Segment) -> Result<(), ConfundoError> {
        let encoded = segment.encode()
            .map_err(|e| ConfundoError::Transport(anyhow::anyhow!(e)))?;
        self.transport.send_datagram(&encoded).await.map_err(ConfundoError::Transport)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Mutex;
    use tokio::time::advance;

    use crate::config::{INITIAL_CWND, INITIAL_SSTHRESH};
    use crate::fault::{FaultInjector, FaultPlan};
    use crate::test_util::{datagram_pair, spawn_scripted_peer, ChannelTransport, PeerLog, PeerScript};
    use crate::transport::MockTransport;

    use super::*;

    const TEST_ISN: u32 = 50_000;
    const PEER_ISN: u32 = 1_000;

    fn test_config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new();
        config.initial_sequence_number = Some(TEST_ISN);
        config
    }

    async fn established_pair(script: PeerScript) -> (Connection, Arc<Mutex<PeerLog>>) {
        let (local, remote) = datagram_pair();
        let (log, _peer) = spawn_scripted_peer(remote, script);
        let mut connection = Connection::new(local, test_config()).unwrap();
        connection.connect().await.unwrap();
        (connection, log)
    }

    /// lets the peer task catch up on everything already in its channel
    async fn settle() {
        advance(Duration::from_millis(1)).await;
    }

    fn data_segments(log: &PeerLog) -> Vec<(u32, usize)> {
        log.segments.iter()
            .filter(|(_, len)| *len > 0)
            .map(|(header, len)| (header.sequence_number, *len))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_establishes_connection() {
        let (connection, _log) = established_pair(PeerScript::accepting()).await;

        assert_eq!(connection.state(), ConnectionState::Established);
        assert_eq!(connection.send_seq(), TEST_ISN + 1);
        assert_eq!(connection.recv_ack(), PEER_ISN + 1);
        assert_eq!(connection.connection_id(), 4242);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out_without_syn_ack() {
        let (local, remote) = datagram_pair();
        let script = PeerScript {
            respond_to_syn: false,
            ..PeerScript::accepting()
        };
        let (_log, _peer) = spawn_scripted_peer(remote, script);
        let mut connection = Connection::new(local, test_config()).unwrap();

        let before = Instant::now();
        let result = connection.connect().await;

        assert!(matches!(result, Err(ConfundoError::HandshakeTimeout)));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(Instant::now() - before >= RETRANSMISSION_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_chunks_at_mtu_boundaries() {
        let (mut connection, log) = established_pair(PeerScript::accepting()).await;

        connection.send(&[0x5a; 1000]).await.unwrap();
        connection.flush().await.unwrap();

        assert_eq!(connection.bytes_in_flight(), 0);
        assert_eq!(connection.send_seq(), TEST_ISN + 1 + 1000);

        let log = log.lock().await;
        assert_eq!(
            data_segments(&log),
            vec![
                (TEST_ISN + 1, 412),
                (TEST_ISN + 413, 412),
                (TEST_ISN + 825, 176),
            ]
        );
        assert_eq!(log.assembled, vec![0x5a; 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retransmits_and_collapses_window() {
        let (local, remote) = datagram_pair();
        let (log, _peer) = spawn_scripted_peer(remote, PeerScript::accepting());
        // send #0 is the SYN, #1 the handshake ack, #2 the first data chunk
        let faulty = FaultInjector::new(local, FaultPlan::drop_sends([2u64]));
        let mut connection = Connection::new(faulty, test_config()).unwrap();
        connection.connect().await.unwrap();

        connection.send(&[0x17; 412]).await.unwrap();
        connection.flush().await.unwrap();

        assert_eq!(connection.retransmissions(), 1);
        // timeout halved ssthresh with the 2-MTU floor and reset cwnd to one
        //  MTU; the subsequent ack grew it back by the acked bytes
        assert_eq!(connection.ssthresh(), 2 * MTU_SIZE as u32);
        assert_eq!(connection.cwnd(), 2 * MTU_SIZE as u32);

        let log = log.lock().await;
        // the first transmission was dropped before the wire, so the peer saw
        //  the chunk exactly once
        assert_eq!(data_segments(&log), vec![(TEST_ISN + 1, 412)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_completes_fin_exchange() {
        let (mut connection, log) = established_pair(PeerScript::accepting()).await;
        connection.send(b"farewell").await.unwrap();

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        // the peer's FIN consumed one sequence number
        assert_eq!(connection.recv_ack(), PEER_ISN + 2);

        settle().await;
        let log = log.lock().await;
        assert!(log.segments.iter().any(|(header, _)| header.flags.contains(SegmentFlags::FIN)));
        // the peer's FIN was acknowledged
        assert!(log.segments.iter().any(|(header, _)| {
            header.flags.contains(SegmentFlags::ACK) && header.ack_number == PEER_ISN + 2
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_after_teardown_window() {
        let script = PeerScript {
            fin_reply: false,
            ..PeerScript::accepting()
        };
        let (mut connection, _log) = established_pair(script).await;

        let before = Instant::now();
        connection.close().await.unwrap();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(Instant::now() - before >= TEARDOWN_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_acks_change_nothing() {
        let script = PeerScript {
            double_acks: true,
            ..PeerScript::accepting()
        };
        let (mut connection, log) = established_pair(script).await;

        connection.send(&[0x33; 1000]).await.unwrap();
        connection.flush().await.unwrap();

        // the window grew once per distinct cumulative ack; the duplicates
        //  were ignored
        assert_eq!(connection.cwnd(), INITIAL_CWND + 1000);
        assert_eq!(connection.ssthresh(), INITIAL_SSTHRESH);
        assert_eq!(connection.retransmissions(), 0);

        let log = log.lock().await;
        assert_eq!(log.assembled.len(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_survives_lossy_link() {
        let (local, remote) = datagram_pair();
        // 20% loss in both directions once the handshake is through
        let peer_side = FaultInjector::new(remote, FaultPlan::lossy(0.2, 0xbad5eed).starting_at(1));
        let (log, _peer) = spawn_scripted_peer(peer_side, PeerScript::accepting());
        let local_side = FaultInjector::new(local, FaultPlan::lossy(0.2, 0x5eed).starting_at(2));
        let mut connection = Connection::new(local_side, test_config()).unwrap();
        connection.connect().await.unwrap();

        let data: Vec<u8> = (0..8_000u32).map(|i| (i % 241) as u8).collect();
        connection.send(&data).await.unwrap();
        connection.flush().await.unwrap();
        connection.close().await.unwrap();

        let log = log.lock().await;
        assert_eq!(log.assembled, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_loses_connection() {
        let script = PeerScript {
            ack_data: false,
            ..PeerScript::accepting()
        };
        let (mut connection, _log) = established_pair(script).await;

        connection.send(&[0x01; 100]).await.unwrap();
        let result = connection.flush().await;

        match result {
            Err(ConfundoError::ConnectionLost { sequence_number, retries }) => {
                assert_eq!(sequence_number, TEST_ISN + 1);
                assert_eq!(retries, connection.config().max_retransmissions);
            }
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.retransmissions(), connection.config().max_retransmissions as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_established() {
        let (local, _remote) = datagram_pair();
        let mut connection = Connection::new(local, test_config()).unwrap();

        let result = connection.send(b"too early").await;
        assert!(matches!(result, Err(ConfundoError::ConnectionNotEstablished { state: ConnectionState::Closed })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_requires_established() {
        let (local, _remote) = datagram_pair();
        let mut connection = Connection::new(local, test_config()).unwrap();

        let result = connection.close().await;
        assert!(matches!(result, Err(ConfundoError::ConnectionNotEstablished { .. })));
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal() {
        let mut transport = MockTransport::new();
        transport.expect_send_datagram()
            .returning(|_| Err(anyhow::anyhow!("socket closed underneath us")));
        let mut connection = Connection::new(transport, test_config()).unwrap();

        let result = connection.connect().await;
        assert!(matches!(result, Err(ConfundoError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagrams_are_skipped_during_handshake() {
        let (local, remote) = datagram_pair();
        let peer = tokio::spawn(async move {
            let buf = remote.recv_datagram(Duration::from_secs(10)).await.unwrap().unwrap();
            let syn = Segment::decode(&buf).unwrap();

            // garbage first: truncated, then oversized - both must be ignored
            remote.send_datagram(&[0xff; 5]).await.unwrap();
            remote.send_datagram(&[0x00; 500]).await.unwrap();

            let syn_ack = SegmentHeader {
                sequence_number: PEER_ISN,
                ack_number: syn.header.sequence_number.wrapping_add(1),
                connection_id: 77,
                flags: SegmentFlags::SYN | SegmentFlags::ACK,
            };
            remote.send_datagram(&Segment::control(syn_ack).encode().unwrap()).await.unwrap();
            remote
        });

        let mut connection = Connection::new(local, test_config()).unwrap();
        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Established);
        assert_eq!(connection.connection_id(), 77);
        let _remote = peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_for_other_connections_are_ignored() {
        let (local, remote) = datagram_pair();
        let peer = tokio::spawn(async move {
            let syn = raw_recv_segment(&remote, Duration::from_secs(10)).await;
            let client_next = syn.header.sequence_number.wrapping_add(1);
            send_raw_control(&remote, SegmentHeader {
                sequence_number: PEER_ISN,
                ack_number: client_next,
                connection_id: 7,
                flags: SegmentFlags::SYN | SegmentFlags::ACK,
            }).await;

            let _handshake_ack = raw_recv_segment(&remote, Duration::from_secs(10)).await;
            let data = raw_recv_segment(&remote, Duration::from_secs(10)).await;
            assert_eq!(data.payload.len(), 100);

            // an ack carrying the wrong connection id - must be ignored
            send_raw_control(&remote, SegmentHeader {
                sequence_number: PEER_ISN + 1,
                ack_number: client_next.wrapping_add(100),
                connection_id: 8,
                flags: SegmentFlags::ACK,
            }).await;

            // the client has to fall back to a timeout and re-send
            let retransmitted = raw_recv_segment(&remote, Duration::from_secs(10)).await;
            assert_eq!(retransmitted.header.sequence_number, data.header.sequence_number);
            send_raw_control(&remote, SegmentHeader {
                sequence_number: PEER_ISN + 1,
                ack_number: client_next.wrapping_add(100),
                connection_id: 7,
                flags: SegmentFlags::ACK,
            }).await;
            remote
        });

        let mut connection = Connection::new(local, test_config()).unwrap();
        connection.connect().await.unwrap();
        connection.send(&[0x44; 100]).await.unwrap();
        connection.flush().await.unwrap();

        assert_eq!(connection.retransmissions(), 1);
        let _remote = peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_numbers_wrap_around() {
        let (local, remote) = datagram_pair();
        let (log, _peer) = spawn_scripted_peer(remote, PeerScript::accepting());
        let mut config = test_config();
        config.initial_sequence_number = Some(u32::MAX - 100);
        let mut connection = Connection::new(local, config).unwrap();
        connection.connect().await.unwrap();

        let data: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
        connection.send(&data).await.unwrap();
        connection.flush().await.unwrap();

        // (2^32 - 101) + 1 + 1000 wraps to 900
        assert_eq!(connection.send_seq(), 900);
        assert_eq!(connection.bytes_in_flight(), 0);

        let log = log.lock().await;
        assert_eq!(log.assembled, data);
    }

    // real time here: file I/O runs on the blocking pool, which interacts
    //  badly with auto-advancing virtual time. Nothing in this test waits.
    #[tokio::test]
    async fn test_send_source_transfers_file_in_order() {
        let path = std::env::temp_dir().join(format!("confundo-transfer-test-{}.bin", std::process::id()));
        let data: Vec<u8> = (0..3_000u32).map(|i| (i % 197) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (mut connection, log) = established_pair(PeerScript::accepting()).await;
        let mut source = crate::source::FileSource::open(&path).await.unwrap();
        connection.send_source(&mut source).await.unwrap();
        connection.close().await.unwrap();
        std::fs::remove_file(&path).ok();

        let log = log.lock().await;
        assert_eq!(log.assembled, data);
    }

    async fn raw_recv_segment(transport: &ChannelTransport, timeout: Duration) -> Segment {
        let buf = transport.recv_datagram(timeout).await.unwrap().unwrap();
        Segment::decode(&buf).unwrap()
    }

    async fn send_raw_control(transport: &ChannelTransport, header: SegmentHeader) {
        let encoded = Segment::control(header).encode().unwrap();
        transport.send_datagram(&encoded).await.unwrap();
    }
}
