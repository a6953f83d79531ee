use thiserror::Error;

/// Error kinds surfaced by the public API.
///
/// Timeouts are their own variant so callers can tell "try again later"
/// apart from genuine failures. Exhaustion of a fixed resource (pool,
/// socket slots, ephemeral ports, route table) is ordinary operation, not
/// a protocol error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation not valid for this socket type")]
    WrongSocketType,

    #[error("socket is not connected")]
    NotConnected,

    #[error("packet pool exhausted")]
    PoolExhausted,

    #[error("no free socket slot")]
    SocketsExhausted,

    #[error("no free ephemeral port")]
    PortsExhausted,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("invalid route entry '{0}'")]
    InvalidRoute(String),

    #[error("route table full")]
    RouteTableFull,

    #[error("no route to node {0}")]
    NoRoute(u16),

    #[error("frame of {frame_len} bytes exceeds mtu {mtu} of interface {iface}")]
    MtuExceeded {
        frame_len: usize,
        mtu: usize,
        iface: String,
    },

    #[error("interface transmit failed")]
    TransmitFailed,

    #[error("fragment arrived out of order")]
    FragmentOutOfOrder,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, StackError>;
