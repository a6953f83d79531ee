//! The link driver seam.
//!
//! The stack does not own any transport of its own. Link drivers register
//! themselves as [`LinkInterface`] trait objects and hand received frames
//! back through [`Stack::input`](crate::Stack::input). A driver may run its
//! receive path on any thread; ingress is fully locked internally.

pub mod loopback;

use crate::buffer_pool::Packet;

/// Contract between the stack and a link driver.
///
/// * `name` is stable for the lifetime of the interface and unique per
///   stack; the route table refers to interfaces by name.
/// * `address` is the local node as seen by this link. Incoming frames
///   whose destination differs are dropped.
/// * `mtu` is the largest whole frame (header plus payload) the link can
///   carry, at least `HEADER_SIZE + 1` and at most `HEADER_SIZE + MTU`.
/// * `transmit` is handed a borrowed packet and must not retain it past
///   return. It is invoked outside the stack's locks, so a driver may
///   deliver synchronously back into `Stack::input` (the loopback driver
///   does exactly that). It must not mutate the interface registry or the
///   route table from within the call.
pub trait LinkInterface: Send + Sync {
    fn name(&self) -> &str;

    fn address(&self) -> u8;

    fn mtu(&self) -> usize;

    fn transmit(&self, packet: &Packet) -> anyhow::Result<()>;
}
