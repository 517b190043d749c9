#![warn(missing_docs)]

//! NodeBus: a process-to-process coordination bus.
//!
//! Nodes exchange published data, remote procedure calls and bus-internal
//! control messages over framed TCP. One center node tracks the health and
//! subscriptions of every other node through periodic heartbeats and
//! redistributes the subscription tables. Functionality is provided by
//! statically linked plugins.

pub mod builtin;
pub mod bus;
pub mod channel;
pub mod config;
pub mod directory;
pub mod envelope;
#[allow(missing_docs)]
pub mod error;
pub mod health;
pub mod logship;
pub mod plugin;
pub mod router;
pub mod rpc;
pub mod subscription;
pub mod types;
pub mod usage;

pub use bus::Bus;
pub use config::NodeConfig;
pub use envelope::{DataMessage, DispatchMode, Envelope, Payload, RpcCall};
pub use error::{BusError, ConfigError, Result, RpcError};
pub use health::{HealthMonitor, NodeState};
pub use plugin::{BusHandle, Plugin, PluginContext, PluginRegistry};
pub use router::Router;
pub use subscription::TableKind;
pub use types::{NodeId, NodeRole};
