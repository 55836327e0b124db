//! Message framing
//!
//! Outbound messages are built once as a scatter/gather [`Frame`] of up to
//! five segments (header, control, control tail, record, trailer) and
//! shared by reference count between every connection that sends them.
//! Each writer walks the shared frame with its own [`FrameCursor`].
//!
//! Inbound bytes go through [`InputState`], a two-phase parser: the fixed
//! size header first, then one allocation for control, record and trailer.
//! Partial reads leave the parser mid-phase; the next call picks up where
//! the previous one stopped.

use crate::protocol::{
    HandshakeParams, LogPosition, Message, MessageType, VersionAgreement, VersionProposal,
};
use crate::{Error, Result};
use bytes::Bytes;
use crc32fast::Hasher;
use std::io::IoSlice;

/// Header size: msg_type(1) + control_size(4) + rec_size(4)
pub const HEADER_LEN: usize = 9;

/// CRC32 trailer size
pub const TRAILER_LEN: usize = 4;

/// Most segments a frame is ever built from
pub const MAX_SEGMENTS: usize = 5;

/// Reject an outbound payload the receiving side would refuse. The
/// configured limit never exceeds `u32::MAX`, so a payload that passes
/// also fits the header's size fields.
pub fn check_payload_size(
    control_len: usize,
    record_len: usize,
    max_message_size: usize,
) -> Result<()> {
    let len = control_len as u64 + record_len as u64;
    if len > max_message_size as u64 {
        return Err(Error::malformed(format!(
            "message of {} bytes exceeds limit of {}",
            len, max_message_size
        )));
    }
    Ok(())
}

/// Decoded message header, not yet validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw message type byte
    pub msg_type: u8,
    /// Control blob length
    pub control_size: u32,
    /// Record blob length
    pub rec_size: u32,
}

impl FrameHeader {
    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.msg_type;
        buf[1..5].copy_from_slice(&self.control_size.to_be_bytes());
        buf[5..9].copy_from_slice(&self.rec_size.to_be_bytes());
        buf
    }

    /// Decode from wire bytes
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            msg_type: buf[0],
            control_size: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            rec_size: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        }
    }

    /// Payload size (control + record)
    pub fn payload_len(&self) -> u64 {
        self.control_size as u64 + self.rec_size as u64
    }

    /// Check the type and total size against `max_message_size`
    pub fn validate(&self, max_message_size: usize) -> Result<MessageType> {
        let msg_type = MessageType::try_from(self.msg_type)?;
        if self.payload_len() > max_message_size as u64 {
            return Err(Error::malformed(format!(
                "message of {} bytes exceeds limit of {}",
                self.payload_len(),
                max_message_size
            )));
        }
        Ok(msg_type)
    }
}

/// An outbound message, framed and ready to write
#[derive(Debug, Clone)]
pub struct Frame {
    msg_type: MessageType,
    segments: [Bytes; MAX_SEGMENTS],
    count: usize,
    total_bytes: usize,
}

impl Frame {
    /// Frame a message whose control blob may be split in two pieces.
    /// Application payloads go through [`check_payload_size`] first.
    pub fn new(msg_type: MessageType, control: Bytes, control_tail: Bytes, record: Bytes) -> Self {
        let control_size = (control.len() + control_tail.len()) as u32;
        let header = FrameHeader {
            msg_type: msg_type as u8,
            control_size,
            rec_size: record.len() as u32,
        };
        let header = Bytes::copy_from_slice(&header.encode());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&control);
        hasher.update(&control_tail);
        hasher.update(&record);
        let trailer = Bytes::copy_from_slice(&hasher.finalize().to_be_bytes());

        let mut segments: [Bytes; MAX_SEGMENTS] = Default::default();
        let mut count = 0;
        let mut total_bytes = 0;
        for segment in [header, control, control_tail, record, trailer] {
            if segment.is_empty() {
                continue;
            }
            total_bytes += segment.len();
            segments[count] = segment;
            count += 1;
        }

        Self {
            msg_type,
            segments,
            count,
            total_bytes,
        }
    }

    /// ACK of a log position; the record is empty
    pub fn ack(position: LogPosition) -> Self {
        Self::new(MessageType::Ack, position.encode(), Bytes::new(), Bytes::new())
    }

    /// Replication traffic from the log engine
    pub fn rep_message(control: Bytes, record: Bytes) -> Self {
        Self::new(MessageType::RepMessage, control, Bytes::new(), record)
    }

    /// Liveness signal
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, Bytes::new(), Bytes::new(), Bytes::new())
    }

    /// Version range proposal, first message on an outgoing connection
    pub fn version_proposal(proposal: VersionProposal) -> Self {
        Self::new(MessageType::Handshake, proposal.encode(), Bytes::new(), Bytes::new())
    }

    /// Version agreement, reply to a proposal
    pub fn version_agreement(agreement: VersionAgreement) -> Self {
        Self::new(MessageType::Handshake, agreement.encode(), Bytes::new(), Bytes::new())
    }

    /// Site parameters handshake; host name travels as the control tail
    pub fn handshake_params(params: &HandshakeParams) -> Self {
        Self::new(
            MessageType::Handshake,
            params.encode_fixed(),
            params.encode_host(),
            Bytes::new(),
        )
    }

    /// Message type
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Number of live segments
    pub fn count(&self) -> usize {
        self.count
    }

    /// Total bytes on the wire
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Live segments
    pub fn segments(&self) -> &[Bytes] {
        &self.segments[..self.count]
    }

    /// Contiguous copy of the wire bytes
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_bytes);
        for segment in self.segments() {
            buf.extend_from_slice(segment);
        }
        buf
    }
}

/// Write progress through one frame
#[derive(Debug)]
pub struct FrameCursor<'a> {
    frame: &'a Frame,
    offset: usize,
    pos: usize,
}

impl<'a> FrameCursor<'a> {
    /// Start at the first segment
    pub fn new(frame: &'a Frame) -> Self {
        Self {
            frame,
            offset: 0,
            pos: 0,
        }
    }

    /// First segment not yet fully written
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Every byte of every segment has been written
    pub fn is_complete(&self) -> bool {
        self.offset == self.frame.count
    }

    /// Bytes still to write
    pub fn remaining(&self) -> usize {
        self.frame.segments[self.offset..self.frame.count]
            .iter()
            .map(Bytes::len)
            .sum::<usize>()
            - self.pos
    }

    /// I/O slices for the unwritten bytes
    pub fn io_slices(&self) -> Vec<IoSlice<'a>> {
        let frame: &'a Frame = self.frame;
        let mut slices = Vec::with_capacity(MAX_SEGMENTS);
        for (i, segment) in frame.segments[self.offset..frame.count].iter().enumerate() {
            let start = if i == 0 { self.pos } else { 0 };
            slices.push(IoSlice::new(&segment[start..]));
        }
        slices
    }

    /// Record that `n` bytes were written
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 && self.offset < self.frame.count {
            let left = self.frame.segments[self.offset].len() - self.pos;
            if n < left {
                self.pos += n;
                return;
            }
            n -= left;
            self.offset += 1;
            self.pos = 0;
        }
    }
}

/// Which half of a message the parser is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    /// Reading the fixed-size header
    Sizes,
    /// Reading control, record and trailer
    Data,
}

#[derive(Debug)]
enum Phase {
    Sizes {
        buf: [u8; HEADER_LEN],
        filled: usize,
    },
    Data {
        header: FrameHeader,
        msg_type: MessageType,
        buf: Vec<u8>,
        filled: usize,
    },
}

/// Two-phase inbound parser
#[derive(Debug)]
pub struct InputState {
    max_message_size: usize,
    phase: Phase,
}

impl InputState {
    /// Create a parser accepting messages up to `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            phase: Phase::Sizes {
                buf: [0u8; HEADER_LEN],
                filled: 0,
            },
        }
    }

    /// Current phase
    pub fn phase(&self) -> ReadPhase {
        match self.phase {
            Phase::Sizes { .. } => ReadPhase::Sizes,
            Phase::Data { .. } => ReadPhase::Data,
        }
    }

    /// No partial message is buffered
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Sizes { filled: 0, .. })
    }

    /// Unfilled part of the current phase's buffer
    pub fn read_buf(&mut self) -> &mut [u8] {
        match &mut self.phase {
            Phase::Sizes { buf, filled } => &mut buf[*filled..],
            Phase::Data { buf, filled, .. } => &mut buf[*filled..],
        }
    }

    /// Record that `n` bytes were read into `read_buf()`; returns the
    /// message when the last byte of it arrives
    pub fn advance(&mut self, n: usize) -> Result<Option<Message>> {
        match &mut self.phase {
            Phase::Sizes { buf, filled } => {
                *filled += n;
                if *filled < HEADER_LEN {
                    return Ok(None);
                }
                let header = FrameHeader::decode(buf);
                let msg_type = header.validate(self.max_message_size)?;
                // One block for control + record + trailer.
                let len = header.payload_len() as usize + TRAILER_LEN;
                self.phase = Phase::Data {
                    header,
                    msg_type,
                    buf: vec![0u8; len],
                    filled: 0,
                };
                Ok(None)
            }
            Phase::Data { buf, filled, .. } => {
                *filled += n;
                if *filled < buf.len() {
                    return Ok(None);
                }
                let done = std::mem::replace(
                    &mut self.phase,
                    Phase::Sizes {
                        buf: [0u8; HEADER_LEN],
                        filled: 0,
                    },
                );
                let Phase::Data {
                    header,
                    msg_type,
                    buf,
                    ..
                } = done
                else {
                    unreachable!("phase checked above");
                };
                Self::finish(header, msg_type, buf).map(Some)
            }
        }
    }

    /// Copy bytes from `data` through the parser, collecting every message
    /// completed along the way
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while !data.is_empty() {
            let dst = self.read_buf();
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
            data = &data[n..];
            if let Some(msg) = self.advance(n)? {
                messages.push(msg);
            }
        }
        Ok(messages)
    }

    fn finish(header: FrameHeader, msg_type: MessageType, buf: Vec<u8>) -> Result<Message> {
        let payload_len = header.payload_len() as usize;
        let stored = <[u8; TRAILER_LEN]>::try_from(&buf[payload_len..])
            .map(u32::from_be_bytes)
            .map_err(|_| Error::malformed("trailer truncated"))?;

        let mut hasher = Hasher::new();
        hasher.update(&header.encode());
        hasher.update(&buf[..payload_len]);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(Error::malformed(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored, computed
            )));
        }

        let block = Bytes::from(buf);
        let control_size = header.control_size as usize;
        let control = block.slice(..control_size);
        let record = block.slice(control_size..payload_len);
        Message::from_parts(msg_type, control, record)
    }
}
