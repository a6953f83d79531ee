//! A small connection-oriented and datagram transport for flat networks
//! of up to 256 nodes, aimed at constrained targets: no heap churn on the
//! data path (all frames live in a fixed packet pool), single-hop
//! routing over pluggable link drivers, and a socket-style API.
//!
//! ## Design points
//!
//! * Two socket types over the same wire format: *stream* sockets with a
//!   three-way handshake and stop-and-wait retransmission, and
//!   connectionless *datagram* sockets.
//! * A [`Stack`] is one node. It is an explicit handle, not process
//!   state, so several nodes can run in one process (the tests wire two
//!   stacks together through an in-memory link).
//! * Link drivers are trait objects ([`LinkInterface`]); the route table
//!   maps destination nodes to registered interfaces and is replaced
//!   atomically from a textual rule set.
//! * Larger messages go through SFP, an in-band one-byte-per-fragment
//!   protocol over stream sockets.
//!
//! ## Wire format
//!
//! Every frame is a 32-bit header, serialized little-endian, followed by
//! up to [`MTU`](config::MTU) payload bytes:
//!
//! ```ascii
//!  31 30 29      22 21      14 13       8 7        2  1  0
//! +--+--+----------+----------+----------+----------+--+--+
//! |R |P | dst node | src node | dst port | src port |A |S |
//! +--+--+----------+----------+----------+----------+--+--+
//!  R = reset, P = priority, A = ack, S = syn
//! ```
//!
//! Stream data frames carry the sender's sequence number as their first
//! payload byte; ACK frames echo the acknowledged sequence number the
//! same way. SFP fragments add one more byte (MORE flag, BEGIN flag,
//! fragment id) in front of the user data.

pub mod buffer_pool;
pub mod config;
pub mod drivers;
pub mod error;
pub mod packet_header;
mod route_table;
mod socket;
pub mod socket_table;
pub mod stack;
mod zerocopy;

pub use buffer_pool::Packet;
pub use config::StackConfig;
pub use drivers::LinkInterface;
pub use error::{Result, StackError};
pub use packet_header::{Flags, PacketHeader, Priority};
pub use socket_table::{SocketId, SocketState, SocketType};
pub use stack::Stack;
