//! Subscription tables.
//!
//! Three name → node-set maps: data subscribers, service providers and system
//! event listeners. On the center they are authoritative; on common nodes they
//! are a replica refreshed from center snapshots.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::NodeId;

/// Which table an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    /// Data name → subscribed nodes.
    Data,
    /// Service name → provider nodes.
    Service,
    /// System event kind → listening nodes.
    System,
}

/// Point-in-time copy of all three tables plus the node directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Data subscriptions.
    pub data: BTreeMap<String, BTreeSet<NodeId>>,
    /// Service providers.
    pub services: BTreeMap<String, BTreeSet<NodeId>>,
    /// System event listeners.
    pub system: BTreeMap<String, BTreeSet<NodeId>>,
    /// Addresses of known nodes.
    pub directory: BTreeMap<NodeId, String>,
}

type Table = RwLock<HashMap<String, BTreeSet<NodeId>>>;

/// The three subscription tables.
///
/// Each table has its own lock and no operation holds two of them at once.
/// Every mutation that changes content bumps a generation counter, which the
/// health monitor uses to decide when to re-broadcast snapshots.
pub struct SubscriptionTables {
    data: Table,
    services: Table,
    system: Table,
    generation: AtomicU64,
}

impl SubscriptionTables {
    /// Empty tables.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            system: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn table(&self, kind: TableKind) -> &Table {
        match kind {
            TableKind::Data => &self.data,
            TableKind::Service => &self.services,
            TableKind::System => &self.system,
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Adds `node` under `name`. Returns true if the entry was new.
    pub fn add(&self, kind: TableKind, name: &str, node: NodeId) -> bool {
        let inserted = self
            .table(kind)
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(node);
        if inserted {
            self.bump();
        }
        inserted
    }

    /// Removes `node` from `name`. Empty names are dropped. Returns true if
    /// the entry existed.
    pub fn remove(&self, kind: TableKind, name: &str, node: NodeId) -> bool {
        let removed = {
            let mut table = self.table(kind).write();
            match table.get_mut(name) {
                Some(nodes) => {
                    let removed = nodes.remove(&node);
                    if nodes.is_empty() {
                        table.remove(name);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            self.bump();
        }
        removed
    }

    /// Nodes registered under `name`.
    pub fn subscribers(&self, kind: TableKind, name: &str) -> BTreeSet<NodeId> {
        self.table(kind).read().get(name).cloned().unwrap_or_default()
    }

    /// True if `node` is registered under `name`.
    pub fn contains(&self, kind: TableKind, name: &str, node: NodeId) -> bool {
        self.table(kind)
            .read()
            .get(name)
            .map(|nodes| nodes.contains(&node))
            .unwrap_or(false)
    }

    /// Removes `node` from every entry of every table. Returns the number of
    /// entries removed.
    pub fn remove_node(&self, node: NodeId) -> usize {
        let mut removed = 0;
        for kind in [TableKind::Data, TableKind::Service, TableKind::System] {
            let mut table = self.table(kind).write();
            table.retain(|_, nodes| {
                if nodes.remove(&node) {
                    removed += 1;
                }
                !nodes.is_empty()
            });
        }
        if removed > 0 {
            self.bump();
        }
        removed
    }

    /// Copies the tables. The directory is left empty for the caller to fill.
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let copy = |table: &Table| -> BTreeMap<String, BTreeSet<NodeId>> {
            table
                .read()
                .iter()
                .map(|(name, nodes)| (name.clone(), nodes.clone()))
                .collect()
        };
        SubscriptionSnapshot {
            data: copy(&self.data),
            services: copy(&self.services),
            system: copy(&self.system),
            directory: BTreeMap::new(),
        }
    }

    /// Replaces all tables with the snapshot's content.
    pub fn replace(&self, snapshot: &SubscriptionSnapshot) {
        let load = |table: &Table, source: &BTreeMap<String, BTreeSet<NodeId>>| {
            let mut table = table.write();
            table.clear();
            for (name, nodes) in source {
                if !nodes.is_empty() {
                    table.insert(name.clone(), nodes.clone());
                }
            }
        };
        load(&self.data, &snapshot.data);
        load(&self.services, &snapshot.services);
        load(&self.system, &snapshot.system);
        self.bump();
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for SubscriptionTables {
    fn default() -> Self {
        Self::new()
    }
}
