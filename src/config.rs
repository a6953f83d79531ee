use std::time::Duration;

/// Payload capacity of a single packet in bytes.
pub const MTU: usize = 128;

/// Size of the packed on-wire header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Number of packets in the buffer pool.
pub const POOL_SIZE: usize = 20;

/// Number of socket slots.
pub const MAX_SOCKETS: usize = 20;

/// Transmission attempts for a reliable send before giving up.
pub const RETRY_LIMIT: usize = 3;

/// How long a sender or connector waits for an acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Ports are 6 bits on the wire; port 0 means "unbound".
pub const MAX_PORTS: u16 = 64;

/// Capacity of the route table.
pub const MAX_NODES: usize = 256;

/// Upper bound on fragments per fragmented message.
pub const SFP_MAX_FRAGMENTS: usize = 255;

/// User bytes per fragment: one packet minus the wire header and the
/// fragment header byte.
pub const SFP_MAX_DATA_PER_FRAGMENT: usize = MTU - HEADER_SIZE - 1;

/// Depth of the per-socket receive queue.
pub const RX_QUEUE_DEPTH: usize = 10;

/// Depth of the per-listener accept queue.
pub const ACCEPT_QUEUE_DEPTH: usize = 5;

/// Per-stack configuration. Each [`Stack`](crate::Stack) instance gets its
/// own copy, so several stacks (i.e. several nodes) can coexist in one
/// process.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// The node address this stack answers to. Frames arriving on an
    /// interface whose address differs from the destination in the header
    /// are dropped; the stack does not forward.
    pub local_node: u8,
}

impl StackConfig {
    pub fn new(local_node: u8) -> StackConfig {
        StackConfig { local_node }
    }
}
