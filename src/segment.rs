//! Wire format for protocol segments: serialization of the fixed 12-byte
//!  header plus payload, and the inverse. No I/O happens here.
//!
//! Decoding is deliberately lenient about the flags byte: the upper five bits
//!  are reserved, and a peer setting them must not make the segment
//!  unparseable. Length violations, on the other hand, are hard errors - the
//!  datagram is discarded by the caller.

use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::config::{HEADER_SIZE, MAX_PACKET_SIZE, MTU_SIZE};

bitflags! {
    #[derive(Eq, PartialEq, Copy, Clone)]
    pub struct SegmentFlags: u8 {
        const SYN = 0b0000_0001;
        const ACK = 0b0000_0010;
        const FIN = 0b0000_0100;
    }
}

impl Debug for SegmentFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct SegmentHeader {
    /// Byte offset (modulo 2^32) of the first payload byte, or the handshake
    ///  sequence value for control segments.
    pub sequence_number: u32,
    /// The next byte offset the sender of this segment expects to receive.
    pub ack_number: u32,
    /// Identifies the logical connection; assigned by the peer in its SYN-ACK.
    pub connection_id: u16,
    pub flags: SegmentFlags,
}

impl Debug for SegmentHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SEG{{{}/{}@{}:{:?}}}", self.sequence_number, self.ack_number, self.connection_id, self.flags)
    }
}

impl SegmentHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.ack_number);
        buf.put_u16(self.connection_id);
        buf.put_u8(0); // reserved
        buf.put_u8(self.flags.bits());
    }

    /// NB: infallible - the caller has already checked that at least
    ///  [HEADER_SIZE] bytes are available.
    fn deser(buf: &mut impl Buf) -> SegmentHeader {
        let sequence_number = buf.get_u32();
        let ack_number = buf.get_u32();
        let connection_id = buf.get_u16();
        let _reserved = buf.get_u8();
        let flags = SegmentFlags::from_bits_truncate(buf.get_u8());

        SegmentHeader {
            sequence_number,
            ack_number,
            connection_id,
            flags,
        }
    }
}

/// One framed protocol message: header plus optional payload, carried in a
///  single datagram.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Segment {
    pub header: SegmentHeader,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the MTU of 412 bytes")]
    PayloadTooBig(usize),
    #[error("a segment cannot carry SYN and FIN at the same time")]
    SynAndFin,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram of {0} bytes is shorter than the 12 byte header")]
    TooShort(usize),
    #[error("datagram of {0} bytes exceeds the maximum packet size of 424 bytes")]
    TooBig(usize),
}

impl Segment {
    pub fn control(header: SegmentHeader) -> Segment {
        Segment {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        if self.payload.len() > MTU_SIZE {
            return Err(EncodeError::PayloadTooBig(self.payload.len()));
        }
        if self.header.flags.contains(SegmentFlags::SYN | SegmentFlags::FIN) {
            return Err(EncodeError::SynAndFin);
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.ser(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Segment, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort(buf.len()));
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::TooBig(buf.len()));
        }

        let header = SegmentHeader::deser(&mut buf);
        Ok(Segment {
            header,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
