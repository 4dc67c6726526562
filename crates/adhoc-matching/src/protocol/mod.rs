//! On-wire protocol of the matching runtime

pub mod packet;

pub use packet::{MatchingPacket, PacketError, PacketType, HEADER_LEN, TRAILER_LEN};
