#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

use bytes::BufMut;

use nanolink::config::{HEADER_SIZE, MTU};
use nanolink::drivers::loopback::LoopbackLink;
use nanolink::{Flags, LinkInterface, Packet, PacketHeader, Priority, Stack, StackConfig};

/// A node whose only link is a loopback to itself.
pub fn single_node(address: u8) -> Arc<Stack> {
    single_node_with_link(address).0
}

pub fn single_node_with_link(address: u8) -> (Arc<Stack>, Arc<LoopbackLink>) {
    let stack = Stack::new(StackConfig::new(address));
    let link = LoopbackLink::new(&stack, "lo", address);
    stack.register_interface(link.clone()).unwrap();
    stack.route_table_load(&format!("{}:lo", address)).unwrap();
    (stack, link)
}

/// Two nodes joined by an in-memory wire, each routing the other's
/// address over it.
pub fn wired_pair(addr_a: u8, addr_b: u8) -> (Arc<Stack>, Arc<Stack>) {
    let a = Stack::new(StackConfig::new(addr_a));
    let b = Stack::new(StackConfig::new(addr_b));

    let (link_a, link_b) = WireLink::pair(&a, addr_a, &b, addr_b);
    a.register_interface(link_a).unwrap();
    b.register_interface(link_b).unwrap();
    a.route_table_load(&format!("{}:wire", addr_b)).unwrap();
    b.route_table_load(&format!("{}:wire", addr_a)).unwrap();

    (a, b)
}

/// Serialize a frame the way it travels on the wire.
pub fn raw_frame(
    dst_node: u8,
    src_node: u8,
    dst_port: u8,
    src_port: u8,
    flags: Flags,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    PacketHeader::new(Priority::Normal, dst_node, src_node, dst_port, src_port, flags)
        .ser(&mut frame);
    frame.put_slice(payload);
    frame
}

/// One end of an in-memory wire between two stacks. Transmission is
/// synchronous: the frame lands in the peer stack's ingress path on the
/// calling thread.
pub struct WireLink {
    name: String,
    address: u8,
    peer: Mutex<Option<(Weak<Stack>, Weak<WireLink>)>>,
    this: Weak<WireLink>,
}

impl WireLink {
    pub fn pair(
        a: &Arc<Stack>,
        addr_a: u8,
        b: &Arc<Stack>,
        addr_b: u8,
    ) -> (Arc<WireLink>, Arc<WireLink>) {
        let link_a = WireLink::end(addr_a);
        let link_b = WireLink::end(addr_b);
        *link_a.peer.lock().unwrap() = Some((Arc::downgrade(b), Arc::downgrade(&link_b)));
        *link_b.peer.lock().unwrap() = Some((Arc::downgrade(a), Arc::downgrade(&link_a)));
        (link_a, link_b)
    }

    fn end(address: u8) -> Arc<WireLink> {
        Arc::new_cyclic(|this| WireLink {
            name: "wire".to_owned(),
            address,
            peer: Mutex::new(None),
            this: this.clone(),
        })
    }
}

impl LinkInterface for WireLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn mtu(&self) -> usize {
        HEADER_SIZE + MTU
    }

    fn transmit(&self, packet: &Packet) -> anyhow::Result<()> {
        let Some((stack, link)) = self.peer.lock().unwrap().clone() else {
            anyhow::bail!("wire is not connected");
        };
        let (Some(stack), Some(link)) = (stack.upgrade(), link.upgrade()) else {
            anyhow::bail!("peer is gone");
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + packet.length);
        frame.put_u32_le(packet.header_raw);
        frame.put_slice(packet.data());

        let iface: Arc<dyn LinkInterface> = link;
        stack.input(&iface, &frame);
        Ok(())
    }
}
