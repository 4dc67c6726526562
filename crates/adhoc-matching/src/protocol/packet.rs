//! Binary framing of matching messages
//!
//! Every message shares a 4-byte header `{ 1, type, length:u16 be }` where
//! `length` counts the payload only. HELLO, HELLO_ACK and ACCEPT additionally
//! carry 16 bytes *after* the counted payload: a constant marker word on
//! HELLO, and the sender's session nonce on HELLO_ACK/ACCEPT. The console
//! stack emits the trailer words in its native byte order (little-endian for
//! the marker) and the nonce in network order; both are reproduced exactly so
//! `serialize(parse(bytes)) == bytes` holds for every valid message.

use std::net::Ipv4Addr;

use crate::types::{MAX_DATA_LEN, MAX_OPT_LEN};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Shared message header length
pub const HEADER_LEN: usize = 4;

/// Length of the extra bytes trailing HELLO / HELLO_ACK / ACCEPT
pub const TRAILER_LEN: usize = 16;

/// Every valid datagram starts with this byte
const LEAD_BYTE: u8 = 1;

// ----------------------------------------------------------------------------
// Packet Types
// ----------------------------------------------------------------------------

/// Wire discriminator of a matching message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Hello = 1,
    HelloAck = 2,
    Accept = 3,
    Confirm = 4,
    Cancel = 5,
    MemberList = 6,
    MemberListAck = 7,
    Bye = 8,
    Keepalive = 9,
    Data = 10,
    DataAck = 11,
}

impl PacketType {
    /// Convert from the raw wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Hello),
            2 => Some(PacketType::HelloAck),
            3 => Some(PacketType::Accept),
            4 => Some(PacketType::Confirm),
            5 => Some(PacketType::Cancel),
            6 => Some(PacketType::MemberList),
            7 => Some(PacketType::MemberListAck),
            8 => Some(PacketType::Bye),
            9 => Some(PacketType::Keepalive),
            10 => Some(PacketType::Data),
            11 => Some(PacketType::DataAck),
            _ => None,
        }
    }

    /// Get the raw wire value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ----------------------------------------------------------------------------
// Packet Errors
// ----------------------------------------------------------------------------

/// Reason a datagram failed to parse; malformed traffic is dropped silently
/// by the input side, so these mostly feed trace logs
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram shorter than the message header")]
    TooShort,
    #[error("bad lead byte {0}")]
    BadLeadByte(u8),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("declared length inconsistent with datagram size")]
    LengthMismatch,
    #[error("attached opt/data blob exceeds the protocol limit")]
    BlobTooLong,
}

// ----------------------------------------------------------------------------
// Header Peek
// ----------------------------------------------------------------------------

/// Raw header fields, cheap enough for the input loop's pre-checks
#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    pub packet_type: u8,
    pub payload_len: usize,
}

/// Read the shared header without touching the payload
pub fn peek_header(bytes: &[u8]) -> Result<RawHeader, PacketError> {
    if bytes.len() < HEADER_LEN {
        return Err(PacketError::TooShort);
    }
    if bytes[0] != LEAD_BYTE {
        return Err(PacketError::BadLeadByte(bytes[0]));
    }
    let payload_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    Ok(RawHeader {
        packet_type: bytes[1],
        payload_len,
    })
}

// ----------------------------------------------------------------------------
// Matching Packet
// ----------------------------------------------------------------------------

/// One parsed matching message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchingPacket {
    /// Discovery beacon: the sender's hello and retransmit intervals plus its
    /// advertised opt blob
    Hello {
        hello_interval: u32,
        rexmt_interval: u32,
        opt: Vec<u8>,
    },
    /// Selection request; `nonce` identifies the sender's session
    HelloAck { nonce: i32, opt: Vec<u8> },
    /// Selection acceptance; same trailer layout as HELLO_ACK
    Accept { nonce: i32, opt: Vec<u8> },
    /// Final step of the two-step acceptance
    Confirm,
    /// Handshake cancellation with an optional reason blob
    Cancel { opt: Vec<u8> },
    /// Authoritative roster: the sender first, then its members
    MemberList {
        parent: Ipv4Addr,
        members: Vec<Ipv4Addr>,
    },
    MemberListAck,
    /// Sender is shutting its context down
    Bye,
    /// Liveness probe during the handshake
    Keepalive,
    /// Acknowledged data payload with the sender's nonce and sequence
    Data {
        nonce: i32,
        seq: i32,
        payload: Vec<u8>,
    },
    /// Acknowledges the data payload numbered `seq`
    DataAck { nonce: i32, seq: i32 },
}

impl MatchingPacket {
    /// Wire discriminator of this message
    pub fn packet_type(&self) -> PacketType {
        match self {
            MatchingPacket::Hello { .. } => PacketType::Hello,
            MatchingPacket::HelloAck { .. } => PacketType::HelloAck,
            MatchingPacket::Accept { .. } => PacketType::Accept,
            MatchingPacket::Confirm => PacketType::Confirm,
            MatchingPacket::Cancel { .. } => PacketType::Cancel,
            MatchingPacket::MemberList { .. } => PacketType::MemberList,
            MatchingPacket::MemberListAck => PacketType::MemberListAck,
            MatchingPacket::Bye => PacketType::Bye,
            MatchingPacket::Keepalive => PacketType::Keepalive,
            MatchingPacket::Data { .. } => PacketType::Data,
            MatchingPacket::DataAck { .. } => PacketType::DataAck,
        }
    }

    /// Encode to one datagram
    pub fn serialize(&self) -> Vec<u8> {
        let (payload_len, trailer_len) = match self {
            MatchingPacket::Hello { opt, .. } => (8 + opt.len(), TRAILER_LEN),
            MatchingPacket::HelloAck { opt, .. } | MatchingPacket::Accept { opt, .. } => {
                (opt.len(), TRAILER_LEN)
            }
            MatchingPacket::Confirm
            | MatchingPacket::MemberListAck
            | MatchingPacket::Bye
            | MatchingPacket::Keepalive => (0, 0),
            MatchingPacket::Cancel { opt } => (opt.len(), 0),
            MatchingPacket::MemberList { members, .. } => (4 * (members.len() + 1), 0),
            MatchingPacket::Data { payload, .. } => (8 + payload.len(), 0),
            MatchingPacket::DataAck { .. } => (8, 0),
        };

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload_len + trailer_len);
        bytes.push(LEAD_BYTE);
        bytes.push(self.packet_type().as_u8());
        bytes.extend_from_slice(&(payload_len as u16).to_be_bytes());

        match self {
            MatchingPacket::Hello {
                hello_interval,
                rexmt_interval,
                opt,
            } => {
                bytes.extend_from_slice(&hello_interval.to_be_bytes());
                bytes.extend_from_slice(&rexmt_interval.to_be_bytes());
                bytes.extend_from_slice(opt);
                // Marker word the console stack writes host-endian, then padding
                bytes.extend_from_slice(&1u32.to_le_bytes());
                bytes.extend_from_slice(&[0u8; 12]);
            }
            MatchingPacket::HelloAck { nonce, opt } | MatchingPacket::Accept { nonce, opt } => {
                bytes.extend_from_slice(opt);
                bytes.extend_from_slice(&nonce.to_be_bytes());
                bytes.extend_from_slice(&[0u8; 12]);
            }
            MatchingPacket::Confirm
            | MatchingPacket::MemberListAck
            | MatchingPacket::Bye
            | MatchingPacket::Keepalive => {}
            MatchingPacket::Cancel { opt } => {
                bytes.extend_from_slice(opt);
            }
            MatchingPacket::MemberList { parent, members } => {
                bytes.extend_from_slice(&parent.octets());
                for member in members {
                    bytes.extend_from_slice(&member.octets());
                }
            }
            MatchingPacket::Data {
                nonce,
                seq,
                payload,
            } => {
                bytes.extend_from_slice(&nonce.to_be_bytes());
                bytes.extend_from_slice(&seq.to_be_bytes());
                bytes.extend_from_slice(payload);
            }
            MatchingPacket::DataAck { nonce, seq } => {
                bytes.extend_from_slice(&nonce.to_be_bytes());
                bytes.extend_from_slice(&seq.to_be_bytes());
            }
        }

        bytes
    }

    /// Decode one datagram
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let header = peek_header(bytes)?;
        let packet_type =
            PacketType::from_u8(header.packet_type).ok_or(PacketError::UnknownType(header.packet_type))?;

        let trailer_len = match packet_type {
            PacketType::Hello | PacketType::HelloAck | PacketType::Accept => TRAILER_LEN,
            _ => 0,
        };
        if bytes.len() != HEADER_LEN + header.payload_len + trailer_len {
            return Err(PacketError::LengthMismatch);
        }
        let payload = &bytes[HEADER_LEN..HEADER_LEN + header.payload_len];
        let trailer = &bytes[HEADER_LEN + header.payload_len..];

        match packet_type {
            PacketType::Hello => {
                if payload.len() < 8 {
                    return Err(PacketError::LengthMismatch);
                }
                let opt = &payload[8..];
                if opt.len() > MAX_OPT_LEN {
                    return Err(PacketError::BlobTooLong);
                }
                Ok(MatchingPacket::Hello {
                    hello_interval: u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ]),
                    rexmt_interval: u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ]),
                    opt: opt.to_vec(),
                })
            }
            PacketType::HelloAck | PacketType::Accept => {
                if payload.len() > MAX_OPT_LEN {
                    return Err(PacketError::BlobTooLong);
                }
                let nonce = i32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
                let opt = payload.to_vec();
                Ok(match packet_type {
                    PacketType::HelloAck => MatchingPacket::HelloAck { nonce, opt },
                    _ => MatchingPacket::Accept { nonce, opt },
                })
            }
            PacketType::Confirm => Ok(MatchingPacket::Confirm),
            PacketType::Cancel => {
                if payload.len() > MAX_OPT_LEN {
                    return Err(PacketError::BlobTooLong);
                }
                Ok(MatchingPacket::Cancel {
                    opt: payload.to_vec(),
                })
            }
            PacketType::MemberList => {
                if payload.len() < 4 || payload.len() % 4 != 0 {
                    return Err(PacketError::LengthMismatch);
                }
                let parent = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
                let members = payload[4..]
                    .chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                    .collect();
                Ok(MatchingPacket::MemberList { parent, members })
            }
            PacketType::MemberListAck => Ok(MatchingPacket::MemberListAck),
            PacketType::Bye => Ok(MatchingPacket::Bye),
            PacketType::Keepalive => Ok(MatchingPacket::Keepalive),
            PacketType::Data => {
                if payload.len() < 8 {
                    return Err(PacketError::LengthMismatch);
                }
                if payload.len() - 8 > MAX_DATA_LEN {
                    return Err(PacketError::BlobTooLong);
                }
                Ok(MatchingPacket::Data {
                    nonce: i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    seq: i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    payload: payload[8..].to_vec(),
                })
            }
            PacketType::DataAck => {
                if payload.len() != 8 {
                    return Err(PacketError::LengthMismatch);
                }
                Ok(MatchingPacket::DataAck {
                    nonce: i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    seq: i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                })
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
