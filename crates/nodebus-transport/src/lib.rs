#![warn(missing_docs)]

//! NodeBus transport subsystem: 8-byte framed TCP transport and peer connection pool

#[allow(missing_docs)]
pub mod error;
pub mod pool;
pub mod protocol;
pub mod tcp;

pub use error::{Result, TransportError};
pub use pool::{ConnectionPool, FrameHandler, PoolConfig, PoolStats};
pub use protocol::{Frame, FrameTag};
