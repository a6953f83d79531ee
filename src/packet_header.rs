use std::fmt::Debug;

use bitflags::bitflags;
use bytes::BufMut;

bitflags! {
    /// Control flags of a frame.
    ///
    /// SYN and ACK travel in the two low bits of the header word; RST has
    /// its own bit at the top of the word and is folded into the high bit
    /// of the flag byte when a header is unpacked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const SYN = 0x01;
        const ACK = 0x02;
        const RST = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// The unpacked form of the 32-bit on-wire header.
///
/// Bit layout of the packed word, high to low:
/// ```ascii
/// 31      reset flag
/// 30      priority (0 = normal, 1 = high)
/// 29..22  destination node
/// 21..14  source node
/// 13..8   destination port
/// 7..2    source port
/// 1..0    ACK, SYN
/// ```
///
/// The word is serialized to the wire in little-endian byte order, so the
/// codec itself is endian-neutral.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub priority: Priority,
    pub dst_node: u8,
    pub src_node: u8,
    pub dst_port: u8,
    pub src_port: u8,
    pub flags: Flags,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HDR{{{}:{}->{}:{} {:?}}}",
            self.src_node, self.src_port, self.dst_node, self.dst_port, self.flags
        )
    }
}

impl PacketHeader {
    pub fn new(
        priority: Priority,
        dst_node: u8,
        src_node: u8,
        dst_port: u8,
        src_port: u8,
        flags: Flags,
    ) -> PacketHeader {
        PacketHeader {
            priority,
            dst_node,
            src_node,
            dst_port,
            src_port,
            flags,
        }
    }

    pub fn pack(&self) -> u32 {
        let mut h = 0u32;

        if self.flags.contains(Flags::RST) {
            h |= 1 << 31;
        }
        if self.priority == Priority::High {
            h |= 1 << 30;
        }

        h |= (self.dst_node as u32) << 22;
        h |= (self.src_node as u32) << 14;
        h |= ((self.dst_port & 0x3f) as u32) << 8;
        h |= ((self.src_port & 0x3f) as u32) << 2;

        h |= (self.flags.bits() & 0x03) as u32;

        h
    }

    pub fn unpack(raw: u32) -> PacketHeader {
        let mut flags = Flags::from_bits_truncate((raw & 0x03) as u8);
        if raw & (1 << 31) != 0 {
            flags |= Flags::RST;
        }

        PacketHeader {
            priority: if raw & (1 << 30) != 0 {
                Priority::High
            } else {
                Priority::Normal
            },
            dst_node: ((raw >> 22) & 0xff) as u8,
            src_node: ((raw >> 14) & 0xff) as u8,
            dst_port: ((raw >> 8) & 0x3f) as u8,
            src_port: ((raw >> 2) & 0x3f) as u8,
            flags,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.pack());
    }
}
