//! Zero-copy packet I/O and message fragmentation.
//!
//! The packet-level calls move whole pool records across the API instead
//! of copying through caller buffers: `send_packet`/`send_packet_to`
//! consume the packet, `recv_packet`/`recv_packet_from` hand it to the
//! caller, who frees it.
//!
//! On top of that sits SFP, the in-band fragmentation protocol for
//! messages larger than one packet. Each fragment carries one extra
//! header byte in front of the user data:
//!
//! ```ascii
//! bit 7     MORE   another fragment follows
//! bit 6     BEGIN  first fragment of a message
//! bits 5..0        fragment id, counting up from zero
//! ```
//!
//! Fragments travel over the reliable send path, so delivery and order
//! are guaranteed per fragment; reassembly only has to check that the ids
//! arrive in sequence. SFP is refused on datagram sockets - without
//! retransmission there is no way to detect a lost fragment, and a
//! silently broken reassembly would be worse than the error.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::buffer_pool::Packet;
use crate::config::{SFP_MAX_DATA_PER_FRAGMENT, SFP_MAX_FRAGMENTS};
use crate::error::{Result, StackError};
use crate::packet_header::{Flags, PacketHeader, Priority};
use crate::socket_table::{SocketId, SocketState, SocketType};
use crate::stack::Stack;

const SFP_FLAG_MORE: u8 = 0x80;
const SFP_FLAG_BEGIN: u8 = 0x40;
const SFP_ID_MASK: u8 = 0x3f;

fn sfp_pack_header(is_begin: bool, has_more: bool, fragment_id: u8) -> u8 {
    let mut header = fragment_id & SFP_ID_MASK;
    if is_begin {
        header |= SFP_FLAG_BEGIN;
    }
    if has_more {
        header |= SFP_FLAG_MORE;
    }
    header
}

/// Returns `(is_begin, has_more, fragment_id)`.
fn sfp_unpack_header(header: u8) -> (bool, bool, u8) {
    (
        header & SFP_FLAG_BEGIN != 0,
        header & SFP_FLAG_MORE != 0,
        header & SFP_ID_MASK,
    )
}

impl Stack {
    /// Transmit a caller-built packet on a connected socket. The packet
    /// moves into the stack and is returned to the pool after transmit;
    /// only the header is written, the payload is sent as-is.
    pub fn send_packet(&self, sock: SocketId, mut pkt: Packet) -> Result<()> {
        let (ty, state, local_node, remote_node, remote_port, local_port) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (
                slot.ty,
                slot.state,
                slot.local_node,
                slot.remote_node,
                slot.remote_port,
                slot.local_port,
            )
        };

        if ty != SocketType::Datagram && state != SocketState::Established {
            error!("socket not connected");
            self.pool.free(pkt);
            return Err(StackError::NotConnected);
        }

        pkt.header_raw = PacketHeader::new(
            Priority::Normal,
            remote_node,
            local_node,
            remote_port,
            local_port as u8,
            Flags::empty(),
        )
        .pack();

        let result = self.router.transmit(&pkt);
        self.pool.free(pkt);
        result
    }

    /// Transmit a caller-built packet to an explicit destination. Only
    /// valid on datagram sockets.
    pub fn send_packet_to(
        &self,
        sock: SocketId,
        mut pkt: Packet,
        dst_node: u8,
        dst_port: u8,
    ) -> Result<()> {
        let (ty, local_node, local_port) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (slot.ty, slot.local_node, slot.local_port)
        };
        if ty != SocketType::Datagram {
            error!("send_packet_to is only valid on datagram sockets");
            self.pool.free(pkt);
            return Err(StackError::WrongSocketType);
        }

        pkt.header_raw = PacketHeader::new(
            Priority::Normal,
            dst_node,
            local_node,
            dst_port,
            local_port as u8,
            Flags::empty(),
        )
        .pack();

        let result = self.router.transmit(&pkt);
        self.pool.free(pkt);
        result
    }

    /// Dequeue one received packet as-is. On a stream socket the payload
    /// still starts with the sequence byte. The caller owns the packet
    /// and frees it.
    pub async fn recv_packet(&self, sock: SocketId, timeout: Option<Duration>) -> Result<Packet> {
        let rx = self.sockets.lock().unwrap().slots[sock.0].rx_rx.clone();
        let mut rx = rx.lock().await;

        let item = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx.recv())
                .await
                .map_err(|_| StackError::Timeout)?,
            None => rx.recv().await,
        };
        match item {
            Some(Some(pkt)) => Ok(pkt),
            Some(None) => Err(StackError::ConnectionReset),
            None => Err(StackError::Timeout),
        }
    }

    /// Dequeue one received packet together with its source, as
    /// `(packet, src_node, src_port)`. Only valid on datagram sockets.
    pub async fn recv_packet_from(
        &self,
        sock: SocketId,
        timeout: Option<Duration>,
    ) -> Result<(Packet, u8, u8)> {
        {
            let table = self.sockets.lock().unwrap();
            if table.slots[sock.0].ty != SocketType::Datagram {
                error!("recv_packet_from is only valid on datagram sockets");
                return Err(StackError::WrongSocketType);
            }
        }

        let pkt = self.recv_packet(sock, timeout).await?;
        let header = PacketHeader::unpack(pkt.header_raw);
        Ok((pkt, header.src_node, header.src_port))
    }

    /// Send a message of arbitrary size over an established stream
    /// socket, fragmenting as needed. Returns the number of bytes sent.
    pub async fn send_sfp(&self, sock: SocketId, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(StackError::InvalidArgument);
        }

        let (ty, state) = {
            let table = self.sockets.lock().unwrap();
            let slot = &table.slots[sock.0];
            (slot.ty, slot.state)
        };
        if ty == SocketType::Datagram {
            error!("fragmentation requires a reliable stream socket");
            return Err(StackError::WrongSocketType);
        }
        if state != SocketState::Established {
            error!("socket not connected");
            return Err(StackError::NotConnected);
        }

        let total_fragments = data.len().div_ceil(SFP_MAX_DATA_PER_FRAGMENT);
        if total_fragments > SFP_MAX_FRAGMENTS {
            error!(
                "message of {} bytes needs {} fragments, limit is {}",
                data.len(),
                total_fragments,
                SFP_MAX_FRAGMENTS
            );
            return Err(StackError::InvalidArgument);
        }
        debug!("fragmenting {} bytes into {} fragments", data.len(), total_fragments);

        let mut fragment = [0u8; SFP_MAX_DATA_PER_FRAGMENT + 1];
        for (id, chunk) in data.chunks(SFP_MAX_DATA_PER_FRAGMENT).enumerate() {
            let has_more = id + 1 < total_fragments;
            fragment[0] = sfp_pack_header(id == 0, has_more, id as u8);
            fragment[1..=chunk.len()].copy_from_slice(chunk);

            self.send(sock, &fragment[..1 + chunk.len()]).await?;
        }

        Ok(data.len())
    }

    /// Receive one fragmented message and return it as a chain of
    /// packets, fragment payloads in order with all protocol bytes
    /// stripped. The timeout applies per fragment. Ownership of the
    /// chain moves to the caller; free it with
    /// [`buffer_free_chain`](Stack::buffer_free_chain).
    pub async fn recv_sfp(&self, sock: SocketId, timeout: Option<Duration>) -> Result<Vec<Packet>> {
        {
            let table = self.sockets.lock().unwrap();
            if table.slots[sock.0].ty == SocketType::Datagram {
                error!("fragmentation requires a reliable stream socket");
                return Err(StackError::WrongSocketType);
            }
        }

        let mut chain: Vec<Packet> = Vec::new();
        let mut expected: usize = 0;
        loop {
            let mut pkt = match self.recv_packet(sock, timeout).await {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!("reassembly aborted waiting for fragment {}: {}", expected, e);
                    self.pool.free_chain(chain);
                    return Err(e);
                }
            };

            // a reliable segment is [sequence byte | fragment header | data]
            if pkt.length < 2 {
                error!("malformed fragment of {} bytes", pkt.length);
                self.pool.free(pkt);
                self.pool.free_chain(chain);
                return Err(StackError::InvalidArgument);
            }
            let (_is_begin, has_more, fragment_id) = sfp_unpack_header(pkt.payload[1]);

            // ids are 6 bits on the wire, the running counter is not
            if fragment_id != (expected as u8) & SFP_ID_MASK {
                error!(
                    "fragment out of order: expected {}, got {}",
                    (expected as u8) & SFP_ID_MASK,
                    fragment_id
                );
                self.pool.free(pkt);
                self.pool.free_chain(chain);
                return Err(StackError::FragmentOutOfOrder);
            }

            // strip the sequence byte and the fragment header
            pkt.payload.copy_within(2.., 0);
            pkt.length -= 2;
            chain.push(pkt);
            expected += 1;

            if !has_more {
                break;
            }
        }

        debug!("reassembled message from {} fragments", expected);
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(true, true, 0, 0xc0)]
    #[case::middle(false, true, 1, 0x81)]
    #[case::last(false, false, 4, 0x04)]
    #[case::single(true, false, 0, 0x40)]
    #[case::id_masked(false, false, 0x7f, 0x3f)]
    fn test_sfp_header_pack(
        #[case] is_begin: bool,
        #[case] has_more: bool,
        #[case] fragment_id: u8,
        #[case] expected: u8,
    ) {
        assert_eq!(sfp_pack_header(is_begin, has_more, fragment_id), expected);
    }

    #[rstest]
    #[case::first(0xc0, true, true, 0)]
    #[case::middle(0x81, false, true, 1)]
    #[case::last(0x04, false, false, 4)]
    fn test_sfp_header_unpack(
        #[case] header: u8,
        #[case] is_begin: bool,
        #[case] has_more: bool,
        #[case] fragment_id: u8,
    ) {
        assert_eq!(sfp_unpack_header(header), (is_begin, has_more, fragment_id));
    }
}
