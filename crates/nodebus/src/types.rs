//! Core identifiers shared across the bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide unique node identifier, assigned by configuration.
///
/// Zero is reserved: an envelope whose source is zero was created locally and
/// has not yet been stamped by the router.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// The "locally originated, not yet stamped" id.
    pub const UNSTAMPED: NodeId = NodeId(0);

    /// Creates a new NodeId from a raw u32 value
    pub const fn new(id: u32) -> Self {
        NodeId(id)
    }

    /// Returns the raw u32 value of this node ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// True for the reserved zero id.
    pub fn is_unstamped(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a node in the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs the health monitor and holds the authoritative subscription tables.
    Center,
    /// Registers with the center and follows its snapshots.
    Common,
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
