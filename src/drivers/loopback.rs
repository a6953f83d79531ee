//! The loopback link.
//!
//! Transmitted frames are serialized and fed straight back into the
//! owning stack's ingress path, on the calling thread. Because the stack
//! never transmits while holding its socket lock, the synchronous
//! re-entry is safe, and handshakes and resets against the local node
//! complete within the call that triggered them.

use std::sync::{Arc, Weak};

use anyhow::bail;
use bytes::BufMut;

use crate::buffer_pool::Packet;
use crate::config::{HEADER_SIZE, MTU};
use crate::drivers::LinkInterface;
use crate::stack::Stack;

pub struct LoopbackLink {
    name: String,
    address: u8,
    stack: Weak<Stack>,
    this: Weak<LoopbackLink>,
}

impl LoopbackLink {
    /// Create a loopback for `stack`. The caller registers it and routes
    /// the local node to it:
    ///
    /// ```no_run
    /// # use nanolink::{Stack, StackConfig};
    /// # use nanolink::drivers::loopback::LoopbackLink;
    /// let stack = Stack::new(StackConfig::new(50));
    /// stack.register_interface(LoopbackLink::new(&stack, "lo", 50)).unwrap();
    /// stack.route_table_load("50:lo").unwrap();
    /// ```
    pub fn new(stack: &Arc<Stack>, name: impl Into<String>, address: u8) -> Arc<LoopbackLink> {
        Arc::new_cyclic(|this| LoopbackLink {
            name: name.into(),
            address,
            stack: Arc::downgrade(stack),
            this: this.clone(),
        })
    }
}

impl LinkInterface for LoopbackLink {
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
        let Some(stack) = self.stack.upgrade() else {
            bail!("owning stack is gone");
        };
        let Some(this) = self.this.upgrade() else {
            bail!("interface is gone");
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + packet.length);
        frame.put_u32_le(packet.header_raw);
        frame.put_slice(packet.data());

        let iface: Arc<dyn LinkInterface> = this;
        stack.input(&iface, &frame);
        Ok(())
    }
}
