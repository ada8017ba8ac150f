//! Utilities for testing protocol behavior end to end: an in-memory datagram
//!  link and a scripted peer playing the server half of the conversation.
//!
//! These are part of the crate's regular (non-#[cfg(test)]) code so that
//!  applications building on the engine can drive their own tests against the
//!  same scripted peer instead of a live server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::segment::{Segment, SegmentFlags, SegmentHeader};
use crate::transport::Transport;

/// An in-memory datagram link: two [Transport] halves connected cross-wise.
///  Lossless and ordered by itself - wrap a half in a
///  [FaultInjector](crate::fault::FaultInjector) for anything nastier.
pub fn datagram_pair() -> (ChannelTransport, ChannelTransport) {
    let (left_tx, right_rx) = unbounded_channel();
    let (right_tx, left_rx) = unbounded_channel();

    (
        ChannelTransport { tx: left_tx, rx: Mutex::new(left_rx) },
        ChannelTransport { tx: right_tx, rx: Mutex::new(right_rx) },
    )
}

pub struct ChannelTransport {
    tx: UnboundedSender<Bytes>,
    rx: Mutex<UnboundedReceiver<Bytes>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.tx.send(Bytes::copy_from_slice(buf))
            .map_err(|_| anyhow::anyhow!("peer endpoint is gone"))
    }

    async fn recv_datagram(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(buf)) => Ok(Some(buf)),
            Ok(None) => anyhow::bail!("peer endpoint is gone"),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Behavior knobs for [spawn_scripted_peer].
pub struct PeerScript {
    /// the peer's own initial sequence number, sent in its SYN-ACK
    pub initial_sequence_number: u32,
    /// the connection id the peer assigns during the handshake
    pub connection_id: u16,
    /// when false, SYNs are swallowed and the handshake times out
    pub respond_to_syn: bool,
    /// when false, data segments are received but never acknowledged
    pub ack_data: bool,
    /// when true, every ack is sent twice (duplicate-ack tolerance)
    pub double_acks: bool,
    /// when true, the client's FIN is answered with FIN+ACK; when false the
    ///  peer stays silent during teardown
    pub fin_reply: bool,
}

impl PeerScript {
    /// A well-behaved server: accepts the handshake, acks everything in
    ///  order, and completes the FIN exchange.
    pub fn accepting() -> PeerScript {
        PeerScript {
            initial_sequence_number: 1000,
            connection_id: 4242,
            respond_to_syn: true,
            ack_data: true,
            double_acks: false,
            fin_reply: true,
        }
    }
}

/// Everything the peer observed, for assertions.
#[derive(Default)]
pub struct PeerLog {
    /// header and payload length of every segment received, in arrival order
    pub segments: Vec<(SegmentHeader, usize)>,
    /// application bytes assembled in order from in-sequence data segments
    pub assembled: Vec<u8>,
}

/// Spawns the server half of a connection on the given transport. The task
///  lives until the other endpoint is dropped.
pub fn spawn_scripted_peer(
    transport: impl Transport + 'static,
    script: PeerScript,
) -> (Arc<Mutex<PeerLog>>, JoinHandle<()>) {
    let log = Arc::new(Mutex::new(PeerLog::default()));
    let log_for_peer = log.clone();
    let handle = tokio::spawn(async move {
        run_peer(transport, script, log_for_peer).await;
    });
    (log, handle)
}

async fn run_peer(transport: impl Transport, script: PeerScript, log: Arc<Mutex<PeerLog>>) {
    // next in-order sequence number expected from the client, known once the
    //  SYN arrived
    let mut expected: Option<u32> = None;
    let peer_seq = script.initial_sequence_number.wrapping_add(1);

    loop {
        let buf = match transport.recv_datagram(Duration::from_secs(3600)).await {
            Ok(Some(buf)) => buf,
            Ok(None) => continue,
            Err(_) => break, // client endpoint dropped, test is over
        };

        let segment = match Segment::decode(&buf) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("peer received a malformed datagram - discarding: {}", e);
                continue;
            }
        };
        trace!("peer received {:?} with {} payload bytes", segment.header, segment.payload.len());
        log.lock().await.segments.push((segment.header.clone(), segment.payload.len()));

        if segment.header.flags.contains(SegmentFlags::SYN) {
            if !script.respond_to_syn {
                continue;
            }
            let client_next = segment.header.sequence_number.wrapping_add(1);
            expected = Some(client_next);
            let syn_ack = SegmentHeader {
                sequence_number: script.initial_sequence_number,
                ack_number: client_next,
                connection_id: script.connection_id,
                flags: SegmentFlags::SYN | SegmentFlags::ACK,
            };
            debug!("peer accepting handshake as connection {}", script.connection_id);
            send_control(&transport, &script, syn_ack).await;
            continue;
        }

        let Some(exp) = expected else {
            continue; // no handshake yet, nothing to relate this segment to
        };

        if segment.header.flags.contains(SegmentFlags::FIN) {
            let mut ack_number = exp;
            if segment.header.sequence_number == exp {
                ack_number = exp.wrapping_add(1); // the FIN occupies one sequence number
                expected = Some(ack_number);
            }
            if !script.fin_reply {
                continue;
            }
            let fin_ack = SegmentHeader {
                sequence_number: peer_seq,
                ack_number,
                connection_id: script.connection_id,
                flags: SegmentFlags::FIN | SegmentFlags::ACK,
            };
            debug!("peer answering FIN with its own FIN+ACK");
            send_control(&transport, &script, fin_ack).await;
            continue;
        }

        if !segment.payload.is_empty() {
            let mut log = log.lock().await;
            let ack_number = if segment.header.sequence_number == exp {
                let next = exp.wrapping_add(segment.payload.len() as u32);
                expected = Some(next);
                log.assembled.extend_from_slice(&segment.payload);
                next
            } else {
                // duplicate or out of order: re-assert the cumulative position
                exp
            };
            drop(log);

            if !script.ack_data {
                continue;
            }
            let ack = SegmentHeader {
                sequence_number: peer_seq,
                ack_number,
                connection_id: script.connection_id,
                flags: SegmentFlags::ACK,
            };
            send_control(&transport, &script, ack).await;
        }
        // pure acks from the client (e.g. the third handshake step) need no reply
    }
}

async fn send_control(transport: &impl Transport, script: &PeerScript, header: SegmentHeader) {
    let encoded = Segment::control(header).encode()
        .expect("control segments always fit a datagram");
    let repeats = if script.double_acks { 2 } else { 1 };
    for _ in 0..repeats {
        if let Err(e) = transport.send_datagram(&encoded).await {
            debug!("peer failed to send - client endpoint gone: {}", e);
            return;
        }
    }
}
