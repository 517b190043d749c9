//! Node directory: where to reach each known node.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::types::NodeId;

/// Maps node ids to their advertised `host:port` addresses.
///
/// The center fills it from registrations; common nodes learn it from
/// snapshots.
pub struct NodeDirectory {
    entries: RwLock<HashMap<NodeId, String>>,
}

impl NodeDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Records an address. Returns the previous address, if any.
    pub fn insert(&self, node: NodeId, addr: impl Into<String>) -> Option<String> {
        self.entries.write().insert(node, addr.into())
    }

    /// Forgets a node.
    pub fn remove(&self, node: NodeId) -> Option<String> {
        self.entries.write().remove(&node)
    }

    /// Address of a node.
    pub fn get(&self, node: NodeId) -> Option<String> {
        self.entries.read().get(&node).cloned()
    }

    /// Sorted copy of all entries.
    pub fn all(&self) -> BTreeMap<NodeId, String> {
        self.entries
            .read()
            .iter()
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }

    /// Adds or updates every entry in `other`. Entries not in `other` are kept.
    pub fn merge(&self, other: &BTreeMap<NodeId, String>) {
        let mut entries = self.entries.write();
        for (id, addr) in other {
            entries.insert(*id, addr.clone());
        }
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no node is known.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let dir = NodeDirectory::new();
        assert!(dir.insert(NodeId::new(2), "127.0.0.1:7001").is_none());
        assert_eq!(
            dir.insert(NodeId::new(2), "127.0.0.1:7002").as_deref(),
            Some("127.0.0.1:7001")
        );
        assert_eq!(dir.get(NodeId::new(2)).as_deref(), Some("127.0.0.1:7002"));
        assert!(dir.remove(NodeId::new(2)).is_some());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_merge_keeps_unlisted_entries() {
        let dir = NodeDirectory::new();
        dir.insert(NodeId::new(1), "a:1");
        dir.insert(NodeId::new(2), "b:2");

        let update = BTreeMap::from([(NodeId::new(2), "b:3".to_string()), (NodeId::new(3), "c:4".to_string())]);
        dir.merge(&update);

        assert_eq!(dir.len(), 3);
        assert_eq!(dir.get(NodeId::new(1)).as_deref(), Some("a:1"));
        assert_eq!(dir.get(NodeId::new(2)).as_deref(), Some("b:3"));
    }
}
