//! Error types for the bus.

use nodebus_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of remote procedure calls and subscription management.
///
/// This is a closed set; every RPC outcome other than success maps onto one
/// of these variants and is returned to the caller as a value.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    /// No node provides the requested service.
    #[error("service not found: {service}")]
    ServiceNotExist {
        /// Requested service name.
        service: String,
    },

    /// No reply arrived before the deadline.
    #[error("call to {service} timed out after {timeout_ms}ms")]
    Timeout {
        /// Requested service name.
        service: String,
        /// Deadline that expired.
        timeout_ms: u64,
    },

    /// The provider failed while handling the call.
    #[error("rpc failed: {reason}")]
    RpcFailed {
        /// Description of the failure.
        reason: String,
    },

    /// A subscription could not be recorded.
    #[error("plugin {plugin} could not subscribe to {name}")]
    SubscribeFailed {
        /// Plugin that asked.
        plugin: String,
        /// Data or service name.
        name: String,
    },

    /// A subscription could not be removed.
    #[error("plugin {plugin} could not unsubscribe from {name}")]
    UnsubscribeFailed {
        /// Plugin that asked.
        plugin: String,
        /// Data or service name.
        name: String,
    },
}

/// Configuration problems. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Node id zero is reserved.
    #[error("node_id must be non-zero")]
    InvalidNodeId,

    /// Address could not be parsed as `host:port`.
    #[error("invalid address for {field}: {value}")]
    InvalidAddress {
        /// Config field holding the address.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// Common nodes need to know where the center is.
    #[error("common node requires a [center] section")]
    MissingCenter,

    /// The center entry is invalid.
    #[error("center id {0} is invalid for this node")]
    InvalidCenter(u32),

    /// Health thresholds must satisfy delayed < no_response < lost.
    #[error("health thresholds must be increasing: delayed_after={delayed}, no_response_after={no_response}, lost_after={lost}")]
    InvalidThresholds {
        /// Missed probes before Delayed.
        delayed: u64,
        /// Missed probes before NoResponse.
        no_response: u64,
        /// Missed probes before Lost.
        lost: u64,
    },

    /// Peers cannot dial the address this node would announce.
    #[error("advertised address {addr} has an unspecified IP; set advertise_addr")]
    UnspecifiedAdvertise {
        /// The address that would be announced.
        addr: String,
    },

    /// A numeric setting that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    /// Two plugin descriptors resolve to the same name.
    #[error("duplicate plugin name: {0}")]
    DuplicatePlugin(String),
}

/// Errors that can occur in the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A work channel is full; the envelope was not accepted.
    #[error("{channel} channel is full")]
    Backpressure {
        /// Which channel rejected the envelope.
        channel: &'static str,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Envelope could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No plugin factory is registered under this library name.
    #[error("unknown plugin library: {library}")]
    UnknownPlugin {
        /// Requested library name.
        library: String,
    },

    /// Plugin name is already bound.
    #[error("plugin already loaded: {name}")]
    DuplicatePlugin {
        /// Plugin name.
        name: String,
    },

    /// The plugin's start hook returned false.
    #[error("plugin {name} failed to start")]
    PluginStartFailed {
        /// Plugin name.
        name: String,
    },

    /// No plugin is bound under this name.
    #[error("plugin not loaded: {name}")]
    PluginNotLoaded {
        /// Plugin name.
        name: String,
    },

    /// RPC or subscription failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The bus has been shut down.
    #[error("bus is shut down")]
    Shutdown,
}

/// Result alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
