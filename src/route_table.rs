//! Interface registry and static routing.
//!
//! Routing is single-hop: a destination node maps to exactly one
//! registered interface, and the whole table is replaced atomically from
//! a textual rule set (`"<dest>:<iface>"` entries separated by commas or
//! newlines). A failed load leaves the table *empty* so that a stale rule
//! set can never silently keep routing traffic.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::buffer_pool::Packet;
use crate::config::{HEADER_SIZE, MAX_NODES};
use crate::drivers::LinkInterface;
use crate::error::{Result, StackError};
use crate::packet_header::PacketHeader;

struct RouteEntry {
    dest_node: u16,
    iface: Arc<dyn LinkInterface>,
}

pub(crate) struct Router {
    inner: Mutex<RouterInner>,
}

struct RouterInner {
    interfaces: Vec<Arc<dyn LinkInterface>>,
    routes: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Router {
        Router {
            inner: Mutex::new(RouterInner {
                interfaces: Vec::new(),
                routes: Vec::new(),
            }),
        }
    }

    /// Register a link interface. The stack keeps a shared reference for
    /// the lifetime of the process and never deregisters.
    pub fn register(&self, iface: Arc<dyn LinkInterface>) -> Result<()> {
        if iface.name().is_empty() {
            error!("interface name is empty, cannot register");
            return Err(StackError::InvalidArgument);
        }
        if iface.mtu() < HEADER_SIZE {
            error!(
                "interface {} has mtu {} below the header size, cannot register",
                iface.name(),
                iface.mtu()
            );
            return Err(StackError::InvalidArgument);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.interfaces.is_empty() {
            info!("registering first network interface: {}", iface.name());
        } else {
            info!("registering network interface: {}", iface.name());
        }
        inner.interfaces.push(iface);
        Ok(())
    }

    /// Find a registered interface by exact name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn LinkInterface>> {
        self.inner
            .lock()
            .unwrap()
            .interfaces
            .iter()
            .find(|iface| iface.name() == name)
            .cloned()
    }

    /// Replace the route table from a textual rule set. Any failure
    /// clears the installed table and reports why.
    pub fn load(&self, table: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let mut routes: Vec<RouteEntry> = Vec::new();
        for entry in table.split(['\n', ',']) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let Some((dest_str, iface_str)) = entry.split_once(':') else {
                error!("invalid route entry '{}' (missing ':')", entry);
                inner.routes.clear();
                return Err(StackError::InvalidRoute(entry.to_owned()));
            };
            let dest_str = dest_str.trim();
            let iface_str = iface_str.trim();
            if dest_str.is_empty() || iface_str.is_empty() {
                error!("invalid route entry '{}'", entry);
                inner.routes.clear();
                return Err(StackError::InvalidRoute(entry.to_owned()));
            }

            let Some(dest_node) = parse_node(dest_str) else {
                error!("invalid destination node '{}'", dest_str);
                inner.routes.clear();
                return Err(StackError::InvalidRoute(entry.to_owned()));
            };

            if routes.len() >= MAX_NODES {
                error!("route table full, cannot add destination {}", dest_node);
                inner.routes.clear();
                return Err(StackError::RouteTableFull);
            }

            let Some(iface) = inner.interfaces.iter().find(|i| i.name() == iface_str).cloned()
            else {
                error!(
                    "interface '{}' not registered for destination {}",
                    iface_str, dest_node
                );
                inner.routes.clear();
                return Err(StackError::InvalidRoute(entry.to_owned()));
            };

            // a duplicate destination within one load mutates in place,
            // last occurrence wins
            match routes.iter_mut().find(|r| r.dest_node == dest_node) {
                Some(existing) => existing.iface = iface,
                None => routes.push(RouteEntry { dest_node, iface }),
            }
        }

        debug!("installed route table with {} entries", routes.len());
        inner.routes = routes;
        Ok(())
    }

    fn lookup(&self, dest_node: u16) -> Option<Arc<dyn LinkInterface>> {
        self.inner
            .lock()
            .unwrap()
            .routes
            .iter()
            .find(|r| r.dest_node == dest_node)
            .map(|r| r.iface.clone())
    }

    /// Route a packet: resolve the outgoing interface from the packed
    /// destination, enforce its MTU, transmit. The interface is resolved
    /// under the routing lock but the transmit callback runs outside it,
    /// so a synchronous driver may re-enter the stack.
    pub fn transmit(&self, pkt: &Packet) -> Result<()> {
        let header = PacketHeader::unpack(pkt.header_raw);

        let Some(iface) = self.lookup(header.dst_node as u16) else {
            error!("no route to node {}", header.dst_node);
            return Err(StackError::NoRoute(header.dst_node as u16));
        };

        let frame_len = pkt.length + HEADER_SIZE;
        if frame_len > iface.mtu() {
            error!(
                "frame of {} bytes exceeds mtu {} of interface {}",
                frame_len,
                iface.mtu(),
                iface.name()
            );
            return Err(StackError::MtuExceeded {
                frame_len,
                mtu: iface.mtu(),
                iface: iface.name().to_owned(),
            });
        }

        debug!(
            "TX {:?} len={} iface={}",
            header,
            pkt.length,
            iface.name()
        );
        iface.transmit(pkt).map_err(|e| {
            error!("transmit on {} failed: {:#}", iface.name(), e);
            StackError::TransmitFailed
        })
    }
}

/// Destination nodes are written in decimal or `0x`-prefixed hex.
fn parse_node(s: &str) -> Option<u16> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::PacketPool;
    use crate::config::MTU;
    use crate::packet_header::{Flags, Priority};
    use rstest::rstest;
    use std::sync::Mutex as StdMutex;

    /// A link that records every frame handed to it.
    struct RecordingLink {
        name: &'static str,
        mtu: usize,
        sent: StdMutex<Vec<(u32, usize)>>,
    }
    impl RecordingLink {
        fn new(name: &'static str) -> Arc<RecordingLink> {
            Self::with_mtu(name, HEADER_SIZE + MTU)
        }
        fn with_mtu(name: &'static str, mtu: usize) -> Arc<RecordingLink> {
            Arc::new(RecordingLink {
                name,
                mtu,
                sent: StdMutex::new(Vec::new()),
            })
        }
        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }
    impl LinkInterface for RecordingLink {
        fn name(&self) -> &str {
            self.name
        }
        fn address(&self) -> u8 {
            0
        }
        fn mtu(&self) -> usize {
            self.mtu
        }
        fn transmit(&self, packet: &Packet) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((packet.header_raw, packet.length));
            Ok(())
        }
    }

    fn router_with(ifaces: &[Arc<RecordingLink>]) -> Router {
        let router = Router::new();
        for iface in ifaces {
            router.register(iface.clone()).unwrap();
        }
        router
    }

    fn packet_to(pool: &PacketPool, dest: u8, len: usize) -> Packet {
        let mut pkt = pool.get().unwrap();
        pkt.header_raw =
            PacketHeader::new(Priority::Normal, dest, 1, 2, 3, Flags::empty()).pack();
        pkt.length = len;
        pkt
    }

    #[rstest]
    #[case::empty("", &[])]
    #[case::single("55:a", &[55])]
    #[case::commas("1:a, 2:b ,3:a", &[1, 2, 3])]
    #[case::newlines("1:a\n2:b\n3:a", &[1, 2, 3])]
    #[case::mixed_separators("1:a,\n, 2:b\n,3:a,", &[1, 2, 3])]
    #[case::whitespace("  7 : a  ", &[7])]
    #[case::hex("0x10:a, 0X2A:b", &[16, 42])]
    #[case::duplicate_last_wins("9:a, 9:b", &[9])]
    fn test_load_success(#[case] table: &str, #[case] expected_dests: &[u16]) {
        let router = router_with(&[RecordingLink::new("a"), RecordingLink::new("b")]);

        router.load(table).unwrap();

        let inner = router.inner.lock().unwrap();
        let dests: Vec<u16> = inner.routes.iter().map(|r| r.dest_node).collect();
        assert_eq!(dests, expected_dests);
    }

    #[rstest]
    #[case::missing_colon("55")]
    #[case::empty_dest(":a")]
    #[case::empty_iface("55:")]
    #[case::not_a_number("abc:a")]
    #[case::exceeds_u16("65536:a")]
    #[case::unknown_iface("55:nosuch")]
    fn test_load_failure_clears_table(#[case] table: &str) {
        let router = router_with(&[RecordingLink::new("a")]);
        router.load("1:a").unwrap();

        assert!(router.load(table).is_err());
        assert!(router.inner.lock().unwrap().routes.is_empty());
    }

    #[test]
    fn test_load_overflow_clears_table() {
        let router = router_with(&[RecordingLink::new("a")]);

        let table = (0..=MAX_NODES)
            .map(|n| format!("{}:a", n))
            .collect::<Vec<_>>()
            .join(",");

        assert_eq!(router.load(&table), Err(StackError::RouteTableFull));
        assert!(router.inner.lock().unwrap().routes.is_empty());
    }

    #[test]
    fn test_load_at_capacity_succeeds() {
        let router = router_with(&[RecordingLink::new("a")]);

        let table = (0..MAX_NODES)
            .map(|n| format!("{}:a", n))
            .collect::<Vec<_>>()
            .join(",");

        router.load(&table).unwrap();
        assert_eq!(router.inner.lock().unwrap().routes.len(), MAX_NODES);
    }

    #[test]
    fn test_duplicate_resolves_to_last_interface() {
        let a = RecordingLink::new("a");
        let b = RecordingLink::new("b");
        let router = router_with(&[a.clone(), b.clone()]);
        let pool = PacketPool::new();

        router.load("55:a, 55:b").unwrap();

        let pkt = packet_to(&pool, 55, 0);
        router.transmit(&pkt).unwrap();
        pool.free(pkt);

        assert_eq!(a.sent_count(), 0);
        assert_eq!(b.sent_count(), 1);
    }

    #[test]
    fn test_route_replacement_and_invalidation() {
        let a = RecordingLink::new("IFACE_A");
        let b = RecordingLink::new("IFACE_B");
        let router = router_with(&[a.clone(), b.clone()]);
        let pool = PacketPool::new();

        router.load("55:IFACE_A").unwrap();
        let pkt = packet_to(&pool, 55, 4);
        router.transmit(&pkt).unwrap();
        assert_eq!((a.sent_count(), b.sent_count()), (1, 0));

        router.load("55:IFACE_B").unwrap();
        router.transmit(&pkt).unwrap();
        assert_eq!((a.sent_count(), b.sent_count()), (1, 1));

        assert!(router.load("55:UNKNOWN").is_err());
        assert_eq!(router.transmit(&pkt), Err(StackError::NoRoute(55)));
        assert_eq!((a.sent_count(), b.sent_count()), (1, 1));
        pool.free(pkt);
    }

    #[test]
    fn test_transmit_no_route() {
        let router = router_with(&[RecordingLink::new("a")]);
        let pool = PacketPool::new();
        router.load("1:a").unwrap();

        let pkt = packet_to(&pool, 2, 0);
        assert_eq!(router.transmit(&pkt), Err(StackError::NoRoute(2)));
        pool.free(pkt);
    }

    #[test]
    fn test_transmit_mtu_boundary() {
        let iface = RecordingLink::with_mtu("a", 32);
        let router = router_with(&[iface.clone()]);
        let pool = PacketPool::new();
        router.load("1:a").unwrap();

        // length == mtu - HEADER_SIZE fits
        let pkt = packet_to(&pool, 1, 32 - HEADER_SIZE);
        router.transmit(&pkt).unwrap();
        pool.free(pkt);

        // one byte more does not
        let pkt = packet_to(&pool, 1, 32 - HEADER_SIZE + 1);
        assert!(matches!(
            router.transmit(&pkt),
            Err(StackError::MtuExceeded { .. })
        ));
        assert_eq!(iface.sent_count(), 1);
        pool.free(pkt);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let router = Router::new();

        assert_eq!(
            router.register(RecordingLink::new("")),
            Err(StackError::InvalidArgument)
        );
        assert_eq!(
            router.register(RecordingLink::with_mtu("tiny", HEADER_SIZE - 1)),
            Err(StackError::InvalidArgument)
        );
        assert!(router.find_by_name("tiny").is_none());
    }

    #[test]
    fn test_find_by_name_is_exact() {
        let router = router_with(&[RecordingLink::new("radio")]);

        assert!(router.find_by_name("radio").is_some());
        assert!(router.find_by_name("Radio").is_none());
        assert!(router.find_by_name("radio0").is_none());
    }
}
