//! The stack handle: ingress dispatch and the connection state machine.
//!
//! [`Stack`] is where the other parts come together. Link drivers feed
//! received frames into [`Stack::input`]; the socket API on the other
//! side is in `socket.rs` and `zerocopy.rs`. Each `Stack` is one node -
//! several stacks can live in one process.
//!
//! Locking: the socket table sits behind one plain mutex. The state
//! machine never transmits while holding it - ingress processing decides
//! which control frames to send under the lock and emits them after
//! releasing it. A synchronous driver (the loopback) that delivers a
//! transmitted frame straight back into [`Stack::input`] therefore finds
//! the lock free, and handshakes and resets complete within the
//! triggering call. Lock order, outermost first: socket table, routing
//! state, packet pool.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Buf;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::buffer_pool::{Packet, PacketPool};
use crate::config::{StackConfig, HEADER_SIZE, MAX_SOCKETS, MTU, POOL_SIZE};
use crate::drivers::LinkInterface;
use crate::error::Result;
use crate::packet_header::{Flags, PacketHeader, Priority};
use crate::route_table::Router;
use crate::socket_table::{SocketId, SocketState, SocketTable, SocketType};

pub struct Stack {
    local_node: u8,
    pub(crate) pool: PacketPool,
    pub(crate) router: Router,
    pub(crate) sockets: Mutex<SocketTable>,
}

/// A control frame decided on under the socket lock, emitted after it is
/// released. ACKs on stream sockets carry the acknowledged sequence
/// number as a one-byte payload.
pub(crate) struct ControlFrame {
    pub dst_node: u8,
    pub dst_port: u8,
    pub src_port: u8,
    pub flags: Flags,
    pub ack_seq: Option<u8>,
}

impl Stack {
    pub fn new(config: StackConfig) -> Arc<Stack> {
        info!("initializing stack for node {}", config.local_node);
        Arc::new(Stack {
            local_node: config.local_node,
            pool: PacketPool::new(),
            router: Router::new(),
            sockets: Mutex::new(SocketTable::new()),
        })
    }

    pub fn local_node(&self) -> u8 {
        self.local_node
    }

    pub fn register_interface(&self, iface: Arc<dyn LinkInterface>) -> Result<()> {
        self.router.register(iface)
    }

    /// Replace the route table atomically from a textual rule set of
    /// `"<destination>:<interface>"` entries separated by commas or
    /// newlines. Any failure leaves the table empty.
    pub fn route_table_load(&self, table: &str) -> Result<()> {
        self.router.load(table)
    }

    pub fn buffer_get(&self) -> Option<Packet> {
        self.pool.get()
    }

    pub fn buffer_free(&self, pkt: Packet) {
        self.pool.free(pkt)
    }

    pub fn buffer_free_chain(&self, chain: Vec<Packet>) {
        self.pool.free_chain(chain)
    }

    pub fn buffer_free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Ingress entry point for link drivers. `frame` is one whole frame:
    /// the 4-byte header followed by the payload. May be called from any
    /// thread, including synchronously from within a transmit callback.
    pub fn input(&self, iface: &Arc<dyn LinkInterface>, frame: &[u8]) {
        if frame.len() < HEADER_SIZE {
            warn!("received frame shorter than the header, dropping");
            return;
        }
        if frame.len() > HEADER_SIZE + MTU {
            warn!(
                "received frame of {} bytes exceeds the packet size, dropping",
                frame.len()
            );
            return;
        }

        let Some(mut pkt) = self.pool.get() else {
            error!("no packet for incoming frame, dropping");
            return;
        };
        let (mut header_bytes, payload) = frame.split_at(HEADER_SIZE);
        pkt.header_raw = header_bytes.get_u32_le();
        pkt.set_data(payload);
        pkt.rx_iface = Some(iface.clone());

        let header = PacketHeader::unpack(pkt.header_raw);
        debug!("RX {:?} len={} iface={}", header, pkt.length, iface.name());

        if header.dst_node != iface.address() {
            info!("frame for node {} is not for this node, dropping", header.dst_node);
            self.pool.free(pkt);
            return;
        }

        self.socket_input(pkt);
    }

    fn socket_input(&self, pkt: Packet) {
        let control = {
            let mut table = self.sockets.lock().unwrap();
            self.dispatch_ingress(&mut table, pkt)
        };

        // emitted outside the socket lock, see the module docs
        for frame in control {
            self.emit_control(frame);
        }
    }

    pub(crate) fn emit_control(&self, frame: ControlFrame) {
        let Some(mut pkt) = self.pool.get() else {
            error!("failed to allocate control packet");
            return;
        };

        pkt.header_raw = PacketHeader::new(
            Priority::Normal,
            frame.dst_node,
            self.local_node,
            frame.dst_port,
            frame.src_port,
            frame.flags,
        )
        .pack();
        match frame.ack_seq {
            Some(seq) => {
                pkt.payload[0] = seq;
                pkt.length = 1;
            }
            None => pkt.length = 0,
        }

        // route errors are already logged, control frames are best effort
        let _ = self.router.transmit(&pkt);
        self.pool.free(pkt);
    }

    /// The state machine. Owns the packet from here on: every path either
    /// queues it on a socket or returns it to the pool.
    fn dispatch_ingress(&self, table: &mut SocketTable, pkt: Packet) -> Vec<ControlFrame> {
        let mut out = Vec::new();
        let header = PacketHeader::unpack(pkt.header_raw);

        let found = table.find(header.dst_port, header.src_node, header.src_port);

        if header.flags == Flags::RST {
            if let Some(id) = found {
                let slot = &mut table.slots[id.0];
                if slot.ty == SocketType::Stream {
                    info!("received RST from peer, closing socket on port {}", header.dst_port);
                    slot.state = SocketState::Closed;
                    slot.local_port = 0;
                    // a null sentinel wakes any receiver blocked on this socket
                    let _ = slot.rx_tx.try_send(None);
                } else {
                    warn!("ignoring RST on datagram socket port {}", header.dst_port);
                }
            }
            self.pool.free(pkt);
            return out;
        }

        let Some(id) = found else {
            warn!("no socket bound to port {}, dropping frame", header.dst_port);
            self.pool.free(pkt);
            return out;
        };
        let (state, ty) = {
            let slot = &table.slots[id.0];
            (slot.state, slot.ty)
        };

        // SYN on an active connection: the peer restarted, resynchronize
        if matches!(state, SocketState::Established | SocketState::SynReceived)
            && header.flags.contains(Flags::SYN)
        {
            warn!("SYN on active socket: peer restart, resynchronizing");
            let slot = &mut table.slots[id.0];
            if slot.ty == SocketType::Stream {
                slot.tx_seq = 0;
                slot.rx_expected_seq = 0;
                slot.drain_rx(&self.pool);
            }
            out.push(ControlFrame {
                dst_node: slot.remote_node,
                dst_port: slot.remote_port,
                src_port: slot.local_port as u8,
                flags: Flags::SYN | Flags::ACK,
                ack_seq: (slot.ty == SocketType::Stream).then_some(0),
            });
            slot.state = SocketState::SynReceived;
            self.pool.free(pkt);
            return out;
        }

        // SYN on a listener: spawn a child and offer it for accept
        if state == SocketState::Listening && header.flags.contains(Flags::SYN) {
            info!("SYN from node {} port {}", header.src_node, header.src_port);
            let (listener_port, accept_tx) = {
                let slot = &table.slots[id.0];
                (slot.local_port, slot.accept_tx.clone())
            };

            let Some(child_id) = table.allocate(ty, self.local_node, &self.pool) else {
                self.pool.free(pkt);
                return out;
            };
            {
                let child = &mut table.slots[child_id.0];
                child.local_port = listener_port;
                child.remote_node = header.src_node;
                child.remote_port = header.src_port;
                child.state = SocketState::SynReceived;
            }

            if accept_tx.try_send(child_id).is_err() {
                warn!("accept queue full, dropping connection request");
                let child = &mut table.slots[child_id.0];
                child.state = SocketState::Closed;
                child.local_port = 0;
                self.pool.free(pkt);
                return out;
            }

            out.push(ControlFrame {
                dst_node: header.src_node,
                dst_port: header.src_port,
                src_port: listener_port as u8,
                flags: Flags::SYN | Flags::ACK,
                ack_seq: (ty == SocketType::Stream).then_some(0),
            });
            self.pool.free(pkt);
            return out;
        }

        // SYN+ACK answers our SYN: established, emit the final ACK
        if state == SocketState::SynSent && header.flags.contains(Flags::ACK) {
            let slot = &mut table.slots[id.0];
            slot.state = SocketState::Established;
            out.push(ControlFrame {
                dst_node: slot.remote_node,
                dst_port: slot.remote_port,
                src_port: slot.local_port as u8,
                flags: Flags::ACK,
                ack_seq: (slot.ty == SocketType::Stream).then_some(0),
            });
            slot.signal.notify_one();
            self.pool.free(pkt);
            return out;
        }

        // the final ACK of the handshake
        if state == SocketState::SynReceived
            && header.flags.contains(Flags::ACK)
            && !header.flags.contains(Flags::SYN)
        {
            table.slots[id.0].state = SocketState::Established;
            self.pool.free(pkt);
            return out;
        }

        // ACK of a data segment: wake the blocked sender
        if header.flags.contains(Flags::ACK)
            && !header.flags.contains(Flags::SYN)
            && pkt.length == 1
        {
            let slot = &table.slots[id.0];
            if slot.ty == SocketType::Stream {
                let acked = pkt.payload[0];
                if acked == slot.tx_seq {
                    slot.signal.notify_one();
                } else {
                    debug!("stale ACK for sequence {}, current is {}", acked, slot.tx_seq);
                }
            }
            self.pool.free(pkt);
            return out;
        }

        // data
        let accepts_data = matches!(state, SocketState::Established | SocketState::SynReceived)
            || (ty == SocketType::Datagram && state == SocketState::Open);
        if accepts_data && pkt.length > 0 {
            if ty == SocketType::Datagram {
                let slot = &table.slots[id.0];
                if let Err(e) = slot.rx_tx.try_send(Some(pkt)) {
                    warn!("receive queue full, dropping datagram");
                    Self::reclaim_undelivered(e, &self.pool);
                }
                return out;
            }

            let seq = pkt.payload[0];
            let slot = &mut table.slots[id.0];
            if slot.state == SocketState::SynReceived {
                // the final ACK was overtaken by the first data segment
                slot.state = SocketState::Established;
                info!("connection implicitly established by data segment");
            }

            if seq == slot.rx_expected_seq {
                match slot.rx_tx.try_send(Some(pkt)) {
                    Ok(()) => {
                        slot.rx_expected_seq = slot.rx_expected_seq.wrapping_add(1);
                        out.push(ControlFrame {
                            dst_node: slot.remote_node,
                            dst_port: slot.remote_port,
                            src_port: slot.local_port as u8,
                            flags: Flags::ACK,
                            ack_seq: Some(seq),
                        });
                    }
                    Err(e) => {
                        // not acknowledged: the peer's retry redelivers
                        // once there is room again
                        warn!("receive queue full, dropping in-order segment");
                        Self::reclaim_undelivered(e, &self.pool);
                    }
                }
            } else {
                debug!(
                    "out-of-order segment {} (expected {}), re-acknowledging",
                    seq, slot.rx_expected_seq
                );
                out.push(ControlFrame {
                    dst_node: slot.remote_node,
                    dst_port: slot.remote_port,
                    src_port: slot.local_port as u8,
                    flags: Flags::ACK,
                    ack_seq: Some(seq),
                });
                self.pool.free(pkt);
            }
            return out;
        }

        self.pool.free(pkt);
        out
    }

    fn reclaim_undelivered(e: TrySendError<Option<Packet>>, pool: &PacketPool) {
        match e {
            TrySendError::Full(item) | TrySendError::Closed(item) => {
                if let Some(pkt) = item {
                    pool.free(pkt);
                }
            }
        }
    }

    /// Write a human-readable summary of the socket table and the packet
    /// pool to `out`.
    pub fn print_stats(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        {
            let table = self.sockets.lock().unwrap();
            writeln!(out, "socket table:")?;
            writeln!(out, "  max sockets: {}", MAX_SOCKETS)?;
            writeln!(out, "  next ephemeral port: {}", table.next_ephemeral_port)?;
            for slot in table.slots.iter().filter(|s| s.state != SocketState::Closed) {
                writeln!(
                    out,
                    "  port {:>2}: {:?} {:?}, peer {}:{}",
                    slot.local_port, slot.ty, slot.state, slot.remote_node, slot.remote_port
                )?;
            }
        }
        writeln!(out, "packet pool:")?;
        writeln!(out, "  free packets: {}/{}", self.pool.free_count(), POOL_SIZE)
    }

    pub fn socket_state(&self, sock: SocketId) -> SocketState {
        self.sockets.lock().unwrap().slots[sock.0].state
    }

    pub fn socket_local_port(&self, sock: SocketId) -> u16 {
        self.sockets.lock().unwrap().slots[sock.0].local_port
    }

    /// The remote peer as `(node, port)`, or `None` while no peer is
    /// set (unconnected, or a listener).
    pub fn socket_peer(&self, sock: SocketId) -> Option<(u8, u8)> {
        let table = self.sockets.lock().unwrap();
        let slot = &table.slots[sock.0];
        if slot.remote_port == 0 {
            return None;
        }
        Some((slot.remote_node, slot.remote_port))
    }

    /// The stop-and-wait counters as `(tx_seq, rx_expected_seq)`.
    pub fn socket_seqs(&self, sock: SocketId) -> (u8, u8) {
        let table = self.sockets.lock().unwrap();
        let slot = &table.slots[sock.0];
        (slot.tx_seq, slot.rx_expected_seq)
    }
}
