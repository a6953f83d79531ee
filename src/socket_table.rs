//! Socket slots and their bookkeeping.
//!
//! Sockets live in a fixed arena of [`MAX_SOCKETS`] slots. A slot is free
//! while it is `Closed` with local port 0; everything else is owned by
//! some user of the stack. The bounded receive and accept queues and the
//! ACK signal survive `close` with the slot so they can be recycled; the
//! queues are drained back into the packet pool when the slot is handed
//! out again.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::buffer_pool::{Packet, PacketPool};
use crate::config::{ACCEPT_QUEUE_DEPTH, MAX_PORTS, MAX_SOCKETS, RX_QUEUE_DEPTH};
use crate::error::{Result, StackError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Connectionless, unreliable.
    Datagram,
    /// Connection-oriented with stop-and-wait retransmission.
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Unused or closed.
    Closed,
    /// Allocated and possibly bound, not connected.
    Open,
    /// Waiting for incoming connections.
    Listening,
    /// Connection initiated, waiting for SYN+ACK.
    SynSent,
    /// SYN received, waiting for the final ACK.
    SynReceived,
    /// Connected (stream) or default peer set (datagram).
    Established,
}

/// Opaque reference to a socket slot, handed out by
/// [`Stack::socket`](crate::Stack::socket) and
/// [`Stack::accept`](crate::Stack::accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) usize);

pub(crate) struct SocketSlot {
    pub state: SocketState,
    pub ty: SocketType,

    pub local_port: u16,
    pub local_node: u8,
    pub remote_node: u8,
    pub remote_port: u8,

    // stop-and-wait state
    pub tx_seq: u8,
    pub rx_expected_seq: u8,

    // queues and the ACK signal outlive close so the slot can be reused
    pub rx_tx: mpsc::Sender<Option<Packet>>,
    pub rx_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Option<Packet>>>>,
    pub accept_tx: mpsc::Sender<SocketId>,
    pub accept_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SocketId>>>,
    pub signal: Arc<Notify>,
}

impl SocketSlot {
    fn new() -> SocketSlot {
        let (rx_tx, rx_rx) = mpsc::channel(RX_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);

        SocketSlot {
            state: SocketState::Closed,
            ty: SocketType::Datagram,
            local_port: 0,
            local_node: 0,
            remote_node: 0,
            remote_port: 0,
            tx_seq: 0,
            rx_expected_seq: 0,
            rx_tx,
            rx_rx: Arc::new(tokio::sync::Mutex::new(rx_rx)),
            accept_tx,
            accept_rx: Arc::new(tokio::sync::Mutex::new(accept_rx)),
            signal: Arc::new(Notify::new()),
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == SocketState::Closed && self.local_port == 0
    }

    /// Drop everything buffered on the receive queue, returning the
    /// packets to the pool.
    pub fn drain_rx(&mut self, pool: &PacketPool) {
        match self.rx_rx.try_lock() {
            Ok(mut rx) => {
                while let Ok(item) = rx.try_recv() {
                    if let Some(pkt) = item {
                        pool.free(pkt);
                    }
                }
            }
            Err(_) => warn!("receive queue still in use, skipping drain"),
        }
    }

    /// Drop any stale messages left behind by the slot's previous owner.
    fn drain(&mut self, pool: &PacketPool) {
        self.drain_rx(pool);
        if let Ok(mut rx) = self.accept_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}

pub(crate) struct SocketTable {
    pub slots: Vec<SocketSlot>,
    pub next_ephemeral_port: u16,
}

impl SocketTable {
    pub fn new() -> SocketTable {
        SocketTable {
            slots: (0..MAX_SOCKETS).map(|_| SocketSlot::new()).collect(),
            next_ephemeral_port: 1,
        }
    }

    /// Claim the first free slot, scrubbed and with drained queues.
    pub fn allocate(
        &mut self,
        ty: SocketType,
        local_node: u8,
        pool: &PacketPool,
    ) -> Option<SocketId> {
        let Some(index) = self.slots.iter().position(|s| s.is_free()) else {
            error!("socket allocation failed: no free slots");
            return None;
        };

        let slot = &mut self.slots[index];
        slot.drain(pool);

        slot.ty = ty;
        slot.state = SocketState::Open;
        slot.local_node = local_node;
        slot.local_port = 0;
        slot.remote_node = 0;
        slot.remote_port = 0;
        slot.tx_seq = 0;
        slot.rx_expected_seq = 0;
        // a stale permit from the previous owner must not satisfy the
        // next connect, so the signal is replaced rather than drained
        slot.signal = Arc::new(Notify::new());

        Some(SocketId(index))
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.slots
            .iter()
            .any(|s| s.state != SocketState::Closed && s.local_port == port)
    }

    /// Bind a socket to a local port. Port 0 picks an ephemeral port by
    /// scanning from a persistent cursor; the cursor advances past the
    /// chosen port and wraps at [`MAX_PORTS`].
    pub fn bind(&mut self, sock: SocketId, port: u16) -> Result<()> {
        let mut port = port;

        if port == 0 {
            let start = self.next_ephemeral_port;
            let mut chosen = 0;
            loop {
                if !self.port_in_use(self.next_ephemeral_port) {
                    chosen = self.next_ephemeral_port;
                    self.advance_ephemeral_cursor();
                    break;
                }
                self.advance_ephemeral_cursor();
                if self.next_ephemeral_port == start {
                    break;
                }
            }
            if chosen == 0 {
                error!("socket bind failed: no ephemeral ports available");
                return Err(StackError::PortsExhausted);
            }
            port = chosen;
        }

        if port >= MAX_PORTS {
            return Err(StackError::InvalidArgument);
        }
        if self.port_in_use(port) {
            error!("socket bind failed: port {} already in use", port);
            return Err(StackError::PortInUse(port));
        }

        self.slots[sock.0].local_port = port;
        info!("socket bound to port {}", port);
        Ok(())
    }

    fn advance_ephemeral_cursor(&mut self) {
        self.next_ephemeral_port += 1;
        if self.next_ephemeral_port >= MAX_PORTS {
            self.next_ephemeral_port = 1;
        }
    }

    /// Match an incoming frame to a socket. An exact peer match on a
    /// connected or handshaking socket wins over a wildcard; the wildcard
    /// is a listener (stream) or an open datagram socket on the local
    /// port. The table never holds two wildcards for one port.
    pub fn find(&self, local_port: u8, remote_node: u8, remote_port: u8) -> Option<SocketId> {
        let exact = self.slots.iter().position(|s| {
            s.local_port == local_port as u16
                && s.remote_node == remote_node
                && s.remote_port == remote_port
                && matches!(
                    s.state,
                    SocketState::Established | SocketState::SynSent | SocketState::SynReceived
                )
        });
        if let Some(index) = exact {
            return Some(SocketId(index));
        }

        self.slots
            .iter()
            .position(|s| {
                s.local_port == local_port as u16
                    && (s.state == SocketState::Listening
                        || (s.ty == SocketType::Datagram && s.state == SocketState::Open))
            })
            .map(SocketId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (SocketTable, PacketPool) {
        (SocketTable::new(), PacketPool::new())
    }

    fn open_socket(table: &mut SocketTable, pool: &PacketPool, port: u16) -> SocketId {
        let id = table.allocate(SocketType::Stream, 1, pool).unwrap();
        table.bind(id, port).unwrap();
        id
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let (mut table, pool) = table();

        for i in 0..MAX_SOCKETS {
            let id = table.allocate(SocketType::Stream, 7, &pool).unwrap();
            assert_eq!(id.0, i);
            table.bind(id, 0).unwrap();
        }
        assert!(table.allocate(SocketType::Stream, 7, &pool).is_none());

        // closing one slot makes it allocatable again
        table.slots[4].state = SocketState::Closed;
        table.slots[4].local_port = 0;
        assert_eq!(table.allocate(SocketType::Datagram, 7, &pool), Some(SocketId(4)));
    }

    #[test]
    fn test_allocate_scrubs_slot() {
        let (mut table, pool) = table();

        let id = table.allocate(SocketType::Stream, 7, &pool).unwrap();
        {
            let slot = &mut table.slots[id.0];
            slot.remote_node = 9;
            slot.remote_port = 9;
            slot.tx_seq = 3;
            slot.rx_expected_seq = 4;
            slot.rx_tx.try_send(Some(pool.get().unwrap())).unwrap();
            slot.state = SocketState::Closed;
            slot.local_port = 0;
        }
        assert_eq!(pool.free_count(), crate::config::POOL_SIZE - 1);

        let id = table.allocate(SocketType::Datagram, 7, &pool).unwrap();
        let slot = &table.slots[id.0];
        assert_eq!(slot.state, SocketState::Open);
        assert_eq!(slot.ty, SocketType::Datagram);
        assert_eq!((slot.remote_node, slot.remote_port), (0, 0));
        assert_eq!((slot.tx_seq, slot.rx_expected_seq), (0, 0));
        // the stale packet went back to the pool
        assert_eq!(pool.free_count(), crate::config::POOL_SIZE);
    }

    #[test]
    fn test_bind_port_range() {
        let (mut table, pool) = table();
        let id = table.allocate(SocketType::Stream, 1, &pool).unwrap();

        assert_eq!(table.bind(id, MAX_PORTS), Err(StackError::InvalidArgument));
        assert_eq!(table.bind(id, MAX_PORTS - 1), Ok(()));
        assert_eq!(table.slots[id.0].local_port, MAX_PORTS - 1);
    }

    #[test]
    fn test_bind_port_conflict() {
        let (mut table, pool) = table();
        open_socket(&mut table, &pool, 10);

        let other = table.allocate(SocketType::Stream, 1, &pool).unwrap();
        assert_eq!(table.bind(other, 10), Err(StackError::PortInUse(10)));

        // a closed slot does not hold its port
        table.slots[0].state = SocketState::Closed;
        table.slots[0].local_port = 0;
        assert_eq!(table.bind(other, 10), Ok(()));
    }

    #[test]
    fn test_ephemeral_port_sequence() {
        let (mut table, pool) = table();

        let a = table.allocate(SocketType::Datagram, 1, &pool).unwrap();
        let b = table.allocate(SocketType::Datagram, 1, &pool).unwrap();
        let c = table.allocate(SocketType::Datagram, 1, &pool).unwrap();

        table.bind(a, 0).unwrap();
        table.bind(b, 0).unwrap();
        table.bind(c, 0).unwrap();
        assert_eq!(table.slots[a.0].local_port, 1);
        assert_eq!(table.slots[b.0].local_port, 2);
        assert_eq!(table.slots[c.0].local_port, 3);

        // the cursor does not go back even when earlier ports free up
        table.slots[a.0].state = SocketState::Closed;
        table.slots[a.0].local_port = 0;
        let d = table.allocate(SocketType::Datagram, 1, &pool).unwrap();
        table.bind(d, 0).unwrap();
        assert_eq!(table.slots[d.0].local_port, 4);
    }

    #[test]
    fn test_ephemeral_skips_bound_ports() {
        let (mut table, pool) = table();
        open_socket(&mut table, &pool, 1);
        open_socket(&mut table, &pool, 2);

        let id = table.allocate(SocketType::Stream, 1, &pool).unwrap();
        table.bind(id, 0).unwrap();
        assert_eq!(table.slots[id.0].local_port, 3);
    }

    #[test]
    fn test_find_prefers_exact_match() {
        let (mut table, pool) = table();

        let listener = open_socket(&mut table, &pool, 10);
        table.slots[listener.0].state = SocketState::Listening;

        let child = table.allocate(SocketType::Stream, 1, &pool).unwrap();
        {
            let slot = &mut table.slots[child.0];
            slot.local_port = 10;
            slot.remote_node = 50;
            slot.remote_port = 11;
            slot.state = SocketState::Established;
        }

        assert_eq!(table.find(10, 50, 11), Some(child));
        // a different peer falls back to the listener
        assert_eq!(table.find(10, 50, 12), Some(listener));
        assert_eq!(table.find(9, 50, 11), None);
    }

    #[test]
    fn test_find_wildcard_datagram_open() {
        let (mut table, pool) = table();

        let id = table.allocate(SocketType::Datagram, 1, &pool).unwrap();
        table.bind(id, 20).unwrap();

        assert_eq!(table.find(20, 3, 4), Some(id));

        // a closed slot never matches
        table.slots[id.0].state = SocketState::Closed;
        table.slots[id.0].local_port = 0;
        assert_eq!(table.find(20, 3, 4), None);
    }
}
