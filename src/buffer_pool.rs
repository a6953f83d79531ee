//! The packet pool.
//!
//! All frames, ingress and egress, live in records drawn from one
//! fixed-capacity pool. The pool hands out *owned* [`Packet`] values and
//! takes them back when they are freed: a packet is either in the pool's
//! free list or held by exactly one owner, and the type system makes
//! double free and foreign free unrepresentable. Exhaustion is a normal
//! condition - ingress drops the frame, senders back off or fail.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use tracing::{error, trace};

use crate::config::{MTU, POOL_SIZE};
use crate::drivers::LinkInterface;

/// One pooled frame: the packed header word, an inline payload and the
/// valid payload length. `rx_iface` points back at the interface a
/// received packet arrived on; it is meaningless on the transmit path.
///
/// `Packet` has no public constructor - the only way to obtain one is
/// [`PacketPool::get`], which keeps the pool's accounting exact. Return
/// packets with [`PacketPool::free`]; a packet that is simply dropped is
/// lost to the pool for good.
pub struct Packet {
    pub header_raw: u32,
    pub length: usize,
    pub payload: [u8; MTU],
    pub rx_iface: Option<Arc<dyn LinkInterface>>,
    _pooled: (),
}

impl Packet {
    fn blank() -> Packet {
        Packet {
            header_raw: 0,
            length: 0,
            payload: [0; MTU],
            rx_iface: None,
            _pooled: (),
        }
    }

    /// The valid part of the payload.
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    /// Copy `bytes` into the payload and set the length accordingly.
    /// Panics if `bytes` exceeds the payload capacity; callers check
    /// their lengths against [`MTU`] first.
    pub fn set_data(&mut self, bytes: &[u8]) {
        self.payload[..bytes.len()].copy_from_slice(bytes);
        self.length = bytes.len();
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PKT{{header:{:08x} len:{}}}", self.header_raw, self.length)
    }
}

/// Fixed pool of [`POOL_SIZE`] packet records behind a single mutex.
pub struct PacketPool {
    free: Mutex<Vec<Packet>>,
}

impl PacketPool {
    pub fn new() -> PacketPool {
        PacketPool {
            free: Mutex::new((0..POOL_SIZE).map(|_| Packet::blank()).collect()),
        }
    }

    /// Take a packet from the pool, or `None` if it is empty. The length
    /// is reset to zero; payload contents are whatever the previous owner
    /// left behind.
    pub fn get(&self) -> Option<Packet> {
        let mut free = self.free.lock().unwrap();
        match free.pop() {
            Some(mut pkt) => {
                pkt.header_raw = 0;
                pkt.length = 0;
                pkt.rx_iface = None;
                trace!("allocated packet from pool, {} left", free.len());
                Some(pkt)
            }
            None => {
                error!("packet pool exhausted");
                None
            }
        }
    }

    /// Return a packet to the free list.
    pub fn free(&self, mut pkt: Packet) {
        pkt.rx_iface = None;

        let mut free = self.free.lock().unwrap();
        debug_assert!(free.len() < POOL_SIZE, "more packets freed than the pool ever issued");
        free.push(pkt);
        trace!("freed packet back to pool, {} free", free.len());
    }

    /// Return every packet of a chain to the free list. Tolerates an
    /// empty chain.
    pub fn free_chain(&self, chain: Vec<Packet>) {
        for pkt in chain {
            self.free(pkt);
        }
    }

    /// Number of packets currently in the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}
