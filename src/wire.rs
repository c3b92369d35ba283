//! In-host representation of Homa packets.
//!
//! Serialization to IP frames is the business of the [`crate::net`]
//! boundary; within the engine a packet is just a struct. Header field
//! sets match the wire protocol so a frame codec can be bolted on without
//! touching the engine.

use crate::type_alias::*;

/// Homa's protocol number within the IP protocol space.
pub const IPPROTO_HOMA: u8 = 146;

/// Maximum bytes of payload in a Homa request or response message.
pub const HOMA_MAX_MESSAGE_LENGTH: usize = 1_000_000;

/// The maximum number of priority levels usable by the protocol.
pub const HOMA_MAX_PRIORITIES: usize = 8;

/// Maximum number of acks that fit in a single ACK packet (and the bound
/// on each peer's pending-ack backlog).
pub const HOMA_MAX_ACKS_PER_PKT: usize = 5;

/// Bytes of a (serialized) DATA header; all other headers are smaller.
/// Only used for NIC-queue estimation.
pub(crate) const DATA_HEADER_BYTES: usize = 56;

/// Bytes of IP header assumed when estimating wire length.
pub(crate) const IP_HEADER_BYTES: usize = 40;

/// Per-packet Ethernet overhead: header, CRC, preamble, inter-packet gap.
pub(crate) const ETH_OVERHEAD_BYTES: usize = 42;

/// Given the RPC identifier from an incoming packet (which is expressed
/// from the sender's point of view), return the id for the same RPC on
/// this machine.
#[inline(always)]
pub fn local_id(sender_id: RpcId) -> RpcId {
    /* If the client bit was set on the sender side, it needs to be
     * removed here, and conversely.
     */
    sender_id ^ 1
}

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// A segment of a message.
    Data = 0x10,

    /// Receiver permission to send up to an offset at a priority.
    Grant = 0x11,

    /// Request to retransmit a byte range.
    Resend = 0x12,

    /// "I do not know this RPC id."
    RpcUnknown = 0x13,

    /// "I am alive but not yet ready to send."
    Busy = 0x14,

    /// The sender's current unscheduled-priority thresholds.
    Cutoffs = 0x15,

    /// Debugging signal; handled by observability, not the protocol.
    Freeze = 0x16,

    /// Server-initiated request for acks.
    NeedAck = 0x17,

    /// Client response listing fully-received RPC ids.
    Ack = 0x18,
}

/// Identifies an RPC whose server-side state can now be freed. A
/// `client_id` of zero means the ack is invalid (an empty slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HomaAck {
    pub client_id: RpcId,
    pub server_port: Port,
}

/// Fields common to every Homa packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// Port on the source machine from which the packet was sent.
    pub sport: Port,

    /// Port on the destination machine that is to receive the packet.
    pub dport: Port,

    /// The identifier of the RPC as used on the sender (low bit set means
    /// the sender is the server for the RPC).
    pub sender_id: RpcId,
}

/// Contents of a DATA packet: one segment of a message.
#[derive(Debug, Clone)]
pub struct DataHeader {
    /// Total bytes in the message.
    pub message_length: u32,

    /// The receiver can expect the sender to transmit all bytes up to at
    /// least this offset without additional grants.
    pub incoming: u32,

    /// The `cutoff_version` from the most recent CUTOFFS packet the sender
    /// has received from the destination, or 0 if none.
    pub cutoff_version: u16,

    /// True means this packet was sent in response to a RESEND.
    pub retransmit: bool,

    /// Piggybacked ack (invalid if `client_id` is zero).
    pub ack: HomaAck,

    /// Offset within the message of the first payload byte.
    pub offset: u32,

    /// Segment payload.
    pub payload: Vec<u8>,
}

/// Body of a Homa packet, by type.
#[derive(Debug, Clone)]
pub enum PacketBody {
    Data(DataHeader),
    Grant {
        /// The sender should now transmit all data up to (but not
        /// including) this offset, if it hasn't already.
        offset: u32,

        /// Priority level for future scheduled packets of this message.
        priority: u8,

        /// Nonzero means resend all previously transmitted data from
        /// offset 0 (assume nothing was received).
        resend_all: bool,
    },
    Resend {
        /// Offset of the first byte to retransmit.
        offset: u32,

        /// Bytes to retransmit; `u32::MAX` means "everything sent so far".
        length: u32,

        /// Priority to use for the retransmitted data.
        priority: u8,
    },
    RpcUnknown,
    Busy,
    Cutoffs {
        /// Entry i holds the largest message size that may use priority i
        /// for unscheduled packets (larger i is higher priority).
        unsched_cutoffs: [u32; HOMA_MAX_PRIORITIES],

        /// Version identifier to echo back in DATA packets.
        version: u16,
    },
    NeedAck,
    Ack {
        acks: Vec<HomaAck>,
    },
    Freeze,
}

/// One Homa packet, as handed to (and received from) the IP boundary.
#[derive(Debug, Clone)]
pub struct Packet {
    pub common: CommonHeader,
    pub body: PacketBody,
}

impl Packet {
    #[inline]
    pub fn packet_type(&self) -> PacketType {
        match self.body {
            PacketBody::Data(_) => PacketType::Data,
            PacketBody::Grant { .. } => PacketType::Grant,
            PacketBody::Resend { .. } => PacketType::Resend,
            PacketBody::RpcUnknown => PacketType::RpcUnknown,
            PacketBody::Busy => PacketType::Busy,
            PacketBody::Cutoffs { .. } => PacketType::Cutoffs,
            PacketBody::NeedAck => PacketType::NeedAck,
            PacketBody::Ack { .. } => PacketType::Ack,
            PacketBody::Freeze => PacketType::Freeze,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_flips_role_bit() {
        assert_eq!(local_id(100), 101);
        assert_eq!(local_id(101), 100);
        assert_eq!(local_id(local_id(42)), 42);
    }
}
