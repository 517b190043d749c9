use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("invalid magic number: expected 0x{expected:04X}, got 0x{got:04X}")]
    InvalidMagic { expected: u16, got: u16 },

    #[error("unknown frame tag: 0x{0:04X}")]
    UnknownTag(u16),

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: u32, max_size: u32 },

    #[error("listen address {addr} is already in use")]
    AddrInUse { addr: String },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
