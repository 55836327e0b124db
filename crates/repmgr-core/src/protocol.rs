//! Replication wire protocol
//!
//! Every message is `[msg_type:1][control_size:4][rec_size:4]` followed by
//! `control`, `record` and a CRC32 trailer, all integers big endian. The
//! negotiated version applies to every message on a connection; messages
//! carry no version tag of their own.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Lowest protocol version this build speaks
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Highest protocol version this build speaks
pub const MAX_PROTOCOL_VERSION: u32 = 2;

/// First version that carries HEARTBEAT messages
pub const HEARTBEAT_MIN_VERSION: u32 = 2;

/// Default cap on control + record bytes for one inbound message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Wire message types. Values are stable and never reused.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Acknowledgement of a log position
    Ack = 1,
    /// Version negotiation and site parameters
    Handshake = 2,
    /// Opaque replication traffic (log records and control)
    RepMessage = 3,
    /// Liveness signal, version 2 and later
    Heartbeat = 4,
}

impl MessageType {
    /// Protocol version that introduced this type
    pub fn introduced_in(self) -> u32 {
        match self {
            Self::Ack | Self::Handshake | Self::RepMessage => 1,
            Self::Heartbeat => HEARTBEAT_MIN_VERSION,
        }
    }

    /// Whether a connection negotiated at `version` may carry this type
    pub fn valid_in(self, version: u32) -> bool {
        version >= self.introduced_in()
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Ack),
            2 => Ok(Self::Handshake),
            3 => Ok(Self::RepMessage),
            4 => Ok(Self::Heartbeat),
            _ => Err(Error::malformed(format!("unknown message type {}", value))),
        }
    }
}

/// Position in the replicated log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    /// Log file number
    pub file: u32,
    /// Byte offset within the file
    pub offset: u32,
}

impl LogPosition {
    /// Encoded size in bytes
    pub const ENCODED_LEN: usize = 8;

    /// Create a log position
    pub const fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// Encode as the ACK control blob
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u32(self.file);
        buf.put_u32(self.offset);
        buf.freeze()
    }

    /// Decode from an ACK control blob
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(Error::malformed(format!(
                "ack control must be {} bytes, got {}",
                Self::ENCODED_LEN,
                buf.len()
            )));
        }
        Ok(Self {
            file: read_u32(&buf[0..4]),
            offset: read_u32(&buf[4..8]),
        })
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.file, self.offset)
    }
}

/// Version range proposed by the connecting side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionProposal {
    /// Lowest acceptable version
    pub min: u32,
    /// Highest acceptable version
    pub max: u32,
}

impl VersionProposal {
    /// The range this build supports
    pub fn local() -> Self {
        Self {
            min: MIN_PROTOCOL_VERSION,
            max: MAX_PROTOCOL_VERSION,
        }
    }

    /// Pick the highest version both ranges contain
    pub fn agree(&self, local: VersionProposal) -> Result<u32> {
        let lo = self.min.max(local.min);
        let hi = self.max.min(local.max);
        if lo > hi {
            return Err(Error::ProtocolVersionMismatch {
                local_min: local.min,
                local_max: local.max,
                remote_min: self.min,
                remote_max: self.max,
            });
        }
        Ok(hi)
    }

    /// Encode as a HANDSHAKE control blob
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.min);
        buf.put_u32(self.max);
        buf.freeze()
    }

    /// Decode from a HANDSHAKE control blob
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 8 {
            return Err(Error::malformed("version proposal must be 8 bytes"));
        }
        let proposal = Self {
            min: read_u32(&buf[0..4]),
            max: read_u32(&buf[4..8]),
        };
        if proposal.min == 0 || proposal.min > proposal.max {
            return Err(Error::malformed(format!(
                "invalid version range {}..={}",
                proposal.min, proposal.max
            )));
        }
        Ok(proposal)
    }
}

/// Version chosen by the accepting side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionAgreement {
    /// Negotiated version
    pub version: u32,
}

impl VersionAgreement {
    /// Encode as a HANDSHAKE control blob
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.version.to_be_bytes())
    }

    /// Decode from a HANDSHAKE control blob
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 4 {
            return Err(Error::malformed("version agreement must be 4 bytes"));
        }
        Ok(Self {
            version: read_u32(buf),
        })
    }
}

/// Site parameters exchanged once the version is agreed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    /// Version the sender believes is in force
    pub version: u32,
    /// Sender's listening port
    pub port: u16,
    /// Sender's election priority
    pub priority: u32,
    /// Sender's advertised host name
    pub host: String,
}

impl HandshakeParams {
    /// Size of the fixed fields preceding the host name
    pub const FIXED_LEN: usize = 10;

    /// Fixed fields, sent as the control segment
    pub fn encode_fixed(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN);
        buf.put_u32(self.version);
        buf.put_u16(self.port);
        buf.put_u32(self.priority);
        buf.freeze()
    }

    /// NUL-terminated host name, sent as the control tail segment
    pub fn encode_host(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.host.len() + 1);
        buf.put_slice(self.host.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }

    /// Decode from the full control blob
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::FIXED_LEN + 1 {
            return Err(Error::malformed("handshake parameters truncated"));
        }
        let (fixed, host) = buf.split_at(Self::FIXED_LEN);
        let Some((&0, host)) = host.split_last() else {
            return Err(Error::malformed("handshake host name not NUL-terminated"));
        };
        if host.is_empty() || host.contains(&0) {
            return Err(Error::malformed("handshake host name invalid"));
        }
        let host = std::str::from_utf8(host)
            .map_err(|_| Error::malformed("handshake host name not UTF-8"))?
            .to_string();
        Ok(Self {
            version: read_u32(&fixed[0..4]),
            port: u16::from_be_bytes([fixed[4], fixed[5]]),
            priority: read_u32(&fixed[6..10]),
            host,
        })
    }
}

/// A fully received message, tagged by type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sender has the log up to this position
    Ack(LogPosition),
    /// Raw handshake control; which payload it holds depends on the
    /// connection state that receives it
    Handshake(Bytes),
    /// Replication traffic
    RepMessage {
        /// Control blob
        control: Bytes,
        /// Record blob, possibly empty
        record: Bytes,
    },
    /// Liveness signal
    Heartbeat,
}

impl Message {
    /// Wire type of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ack(_) => MessageType::Ack,
            Self::Handshake(_) => MessageType::Handshake,
            Self::RepMessage { .. } => MessageType::RepMessage,
            Self::Heartbeat => MessageType::Heartbeat,
        }
    }

    /// Build the typed message from raw frame parts
    pub fn from_parts(msg_type: MessageType, control: Bytes, record: Bytes) -> Result<Self> {
        match msg_type {
            MessageType::Ack => {
                if !record.is_empty() {
                    return Err(Error::malformed("ack carries a record"));
                }
                Ok(Self::Ack(LogPosition::decode(&control)?))
            }
            MessageType::Handshake => {
                if !record.is_empty() {
                    return Err(Error::malformed("handshake carries a record"));
                }
                Ok(Self::Handshake(control))
            }
            MessageType::RepMessage => Ok(Self::RepMessage { control, record }),
            MessageType::Heartbeat => {
                if !control.is_empty() || !record.is_empty() {
                    return Err(Error::malformed("heartbeat carries a payload"));
                }
                Ok(Self::Heartbeat)
            }
        }
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Ack as u8, 1);
        assert_eq!(MessageType::Handshake as u8, 2);
        assert_eq!(MessageType::RepMessage as u8, 3);
        assert_eq!(MessageType::Heartbeat as u8, 4);
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(5).is_err());
        assert_eq!(MessageType::try_from(4).unwrap(), MessageType::Heartbeat);
    }

    #[test]
    fn test_heartbeat_requires_v2() {
        assert!(!MessageType::Heartbeat.valid_in(1));
        assert!(MessageType::Heartbeat.valid_in(2));
        assert!(MessageType::Ack.valid_in(1));
    }

    #[test]
    fn test_log_position_ordering() {
        assert!(LogPosition::new(1, 500) < LogPosition::new(2, 0));
        assert!(LogPosition::new(2, 10) > LogPosition::new(2, 9));
        let pos = LogPosition::new(7, 1024);
        assert_eq!(LogPosition::decode(&pos.encode()).unwrap(), pos);
        assert!(LogPosition::decode(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_version_agreement_picks_highest_common() {
        let local = VersionProposal::local();
        let remote = VersionProposal { min: 1, max: 5 };
        assert_eq!(remote.agree(local).unwrap(), 2);

        let old = VersionProposal { min: 1, max: 1 };
        assert_eq!(old.agree(local).unwrap(), 1);

        let future = VersionProposal { min: 3, max: 4 };
        assert!(matches!(
            future.agree(local),
            Err(Error::ProtocolVersionMismatch { remote_min: 3, .. })
        ));
    }

    #[test]
    fn test_version_proposal_rejects_inverted_range() {
        let buf = VersionProposal { min: 2, max: 1 }.encode();
        assert!(VersionProposal::decode(&buf).is_err());
    }

    #[test]
    fn test_handshake_params_layout() {
        let params = HandshakeParams {
            version: 2,
            port: 5000,
            priority: 10,
            host: "db2.example.com".to_string(),
        };
        let mut control = params.encode_fixed().to_vec();
        assert_eq!(control.len(), HandshakeParams::FIXED_LEN);
        assert_eq!(&control[4..6], &5000u16.to_be_bytes());
        control.extend_from_slice(&params.encode_host());
        assert_eq!(*control.last().unwrap(), 0);
        assert_eq!(HandshakeParams::decode(&control).unwrap(), params);
    }

    #[test]
    fn test_handshake_params_requires_nul() {
        let params = HandshakeParams {
            version: 1,
            port: 1,
            priority: 0,
            host: "h".to_string(),
        };
        let mut control = params.encode_fixed().to_vec();
        control.extend_from_slice(b"h");
        assert!(HandshakeParams::decode(&control).is_err());
    }

    #[test]
    fn test_heartbeat_must_be_empty() {
        assert!(
            Message::from_parts(MessageType::Heartbeat, Bytes::from_static(b"x"), Bytes::new())
                .is_err()
        );
        assert_eq!(
            Message::from_parts(MessageType::Heartbeat, Bytes::new(), Bytes::new()).unwrap(),
            Message::Heartbeat
        );
    }
}
