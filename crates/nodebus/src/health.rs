//! Node health monitoring (center only).
//!
//! The center probes every registered node with a numbered heartbeat on each
//! timer tick and evaluates each node from how many probes it has left
//! unanswered and from its last round-trip time:
//!
//! ```text
//! NewNode -> Normal -> Delayed -> NoResponse -> Lost
//!              ^          |           |
//!              +----------+-----------+   (fresh in-order response)
//! ```
//!
//! `Lost` is terminal until the node registers again. A node that becomes
//! `Lost` is removed from every subscription table.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::router::Router;
use crate::subscription::SubscriptionTables;
use crate::types::{now_micros, NodeId};

/// Health state of a registered node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Registered, no response yet.
    NewNode,
    /// Answering probes in time.
    Normal,
    /// Missed a few probes or answering slowly.
    Delayed,
    /// Missed enough probes to be considered unresponsive.
    NoResponse,
    /// Gone; subscriptions removed. Only re-registration revives it.
    Lost,
}

/// Monitor tuning.
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Probe period.
    pub interval: Duration,
    /// Missed probes before `Delayed`.
    pub delayed_after: u64,
    /// Missed probes before `NoResponse`.
    pub no_response_after: u64,
    /// Missed probes before `Lost`.
    pub lost_after: u64,
    /// Round-trip time above which a responding node is `Delayed`.
    pub delayed_ping: Duration,
    /// Snapshot broadcasts allowed between two table changes.
    pub max_snapshot_broadcasts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            delayed_after: 2,
            no_response_after: 3,
            lost_after: 5,
            delayed_ping: Duration::from_millis(500),
            max_snapshot_broadcasts: 5,
        }
    }
}

impl HealthConfig {
    /// Checks `delayed_after < no_response_after < lost_after` and a non-zero
    /// interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroValue("health.interval_ms"));
        }
        if self.delayed_after == 0
            || self.delayed_after >= self.no_response_after
            || self.no_response_after >= self.lost_after
        {
            return Err(ConfigError::InvalidThresholds {
                delayed: self.delayed_after,
                no_response: self.no_response_after,
                lost: self.lost_after,
            });
        }
        Ok(())
    }
}

/// Health record of one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Node id.
    pub id: NodeId,
    /// Name from the registration.
    pub display_name: String,
    /// Registration time, microseconds since epoch.
    pub registered_at: i64,
    /// Highest probe index answered, or the probe index at registration.
    pub last_heartbeat_index: u64,
    /// Last measured round-trip time in microseconds.
    pub last_ping_micros: i64,
    /// Last reported CPU load.
    pub cpu_usage: f32,
    /// Last reported memory usage.
    pub mem_usage: f32,
    /// Current state.
    pub state: NodeState,
    /// True once any probe has been answered since registration.
    pub responded: bool,
}

impl NodeHealth {
    fn evaluate(&self, probe_index: u64, config: &HealthConfig) -> NodeState {
        if self.state == NodeState::Lost {
            return NodeState::Lost;
        }
        let missed = probe_index.saturating_sub(self.last_heartbeat_index);
        let slow = self.last_ping_micros > config.delayed_ping.as_micros() as i64;
        if missed >= config.lost_after {
            NodeState::Lost
        } else if missed >= config.no_response_after {
            NodeState::NoResponse
        } else if missed >= config.delayed_after || slow {
            NodeState::Delayed
        } else if self.responded {
            NodeState::Normal
        } else {
            NodeState::NewNode
        }
    }
}

/// A state change produced by the monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Affected node.
    pub node: NodeId,
    /// Previous state.
    pub from: NodeState,
    /// New state.
    pub to: NodeState,
}

/// What the caller must send after a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickPlan {
    /// State changes applied during this tick.
    pub transitions: Vec<Transition>,
    /// Index of the heartbeat probe to broadcast.
    pub probe_index: u64,
    /// Timestamp to put in the probe.
    pub probe_sent_at: i64,
    /// True if a subscription snapshot should be broadcast.
    pub send_snapshot: bool,
}

#[derive(Default)]
struct SnapshotBudget {
    seen_generation: u64,
    sent: u32,
}

/// Tracks every registered node's health.
pub struct HealthMonitor {
    config: HealthConfig,
    records: RwLock<BTreeMap<NodeId, Arc<Mutex<NodeHealth>>>>,
    probe_index: AtomicU64,
    ticks: AtomicU64,
    budget: Mutex<SnapshotBudget>,
}

impl HealthMonitor {
    /// Creates a monitor with no registered nodes.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            records: RwLock::new(BTreeMap::new()),
            probe_index: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            budget: Mutex::new(SnapshotBudget::default()),
        }
    }

    /// Monitor tuning.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Index of the last probe sent.
    pub fn probe_index(&self) -> u64 {
        self.probe_index.load(Ordering::Acquire)
    }

    /// Creates or resets a node's record. A known node, including a `Lost`
    /// one, starts over as `NewNode`.
    pub fn register(&self, node: NodeId, display_name: &str) {
        let record = NodeHealth {
            id: node,
            display_name: display_name.to_string(),
            registered_at: now_micros(),
            last_heartbeat_index: self.probe_index(),
            last_ping_micros: 0,
            cpu_usage: 0.0,
            mem_usage: 0.0,
            state: NodeState::NewNode,
            responded: false,
        };
        let mut records = self.records.write();
        match records.get(&node) {
            Some(existing) => {
                let mut existing = existing.lock();
                info!(node = %node, previous = ?existing.state, "node re-registered");
                *existing = record;
            }
            None => {
                info!(node = %node, name = display_name, "node registered");
                records.insert(node, Arc::new(Mutex::new(record)));
            }
        }
    }

    /// Applies a heartbeat acknowledgement.
    ///
    /// Accepted only if the index is newer than the recorded one, not ahead
    /// of the last probe sent, and the node is not `Lost`. Returns the state
    /// change, if any.
    pub fn on_heartbeat_ack(
        &self,
        node: NodeId,
        index: u64,
        sent_at_micros: i64,
        cpu_usage: f32,
        mem_usage: f32,
        received_at_micros: i64,
    ) -> Option<Transition> {
        let record = self.records.read().get(&node).cloned();
        let Some(record) = record else {
            debug!(node = %node, index, "heartbeat ack from unregistered node");
            return None;
        };
        let probe_index = self.probe_index();

        let mut health = record.lock();
        if health.state == NodeState::Lost
            || index <= health.last_heartbeat_index
            || index > probe_index
        {
            debug!(node = %node, index, last = health.last_heartbeat_index, "stale heartbeat ack ignored");
            return None;
        }
        health.last_heartbeat_index = index;
        health.last_ping_micros = received_at_micros.saturating_sub(sent_at_micros).max(0);
        health.cpu_usage = cpu_usage;
        health.mem_usage = mem_usage;
        health.responded = true;

        let from = health.state;
        let to = health.evaluate(probe_index, &self.config);
        health.state = to;
        (from != to).then(|| {
            info!(node = %node, ?from, ?to, ping_us = health.last_ping_micros, "node state changed");
            Transition { node, from, to }
        })
    }

    /// Runs one timer step: re-evaluates every record, removes newly lost
    /// nodes from `tables`, advances the probe index and decides whether a
    /// snapshot goes out.
    pub fn tick(&self, tables: &SubscriptionTables) -> TickPlan {
        let probe_index = self.probe_index();
        let records: Vec<_> = self.records.read().values().cloned().collect();

        let mut transitions = Vec::new();
        for record in records {
            let mut health = record.lock();
            let from = health.state;
            let to = health.evaluate(probe_index, &self.config);
            if from == to {
                continue;
            }
            health.state = to;
            let node = health.id;
            drop(health);

            if to == NodeState::Lost {
                let removed = tables.remove_node(node);
                warn!(node = %node, ?from, removed, "node lost");
            } else {
                info!(node = %node, ?from, ?to, "node state changed");
            }
            transitions.push(Transition { node, from, to });
        }

        let next_probe = self.probe_index.fetch_add(1, Ordering::AcqRel) + 1;
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;

        let send_snapshot = {
            let mut budget = self.budget.lock();
            let generation = tables.generation();
            if generation != budget.seen_generation {
                budget.seen_generation = generation;
                budget.sent = 0;
            }
            let due = tick % 2 == 0 && budget.sent < self.config.max_snapshot_broadcasts;
            if due {
                budget.sent += 1;
            }
            due
        };

        TickPlan {
            transitions,
            probe_index: next_probe,
            probe_sent_at: now_micros(),
            send_snapshot,
        }
    }

    /// Copy of one node's record.
    pub fn record(&self, node: NodeId) -> Option<NodeHealth> {
        self.records.read().get(&node).map(|r| r.lock().clone())
    }

    /// Current state of a node.
    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.records.read().get(&node).map(|r| r.lock().state)
    }

    /// Copies of all records, ordered by node id.
    pub fn records(&self) -> Vec<NodeHealth> {
        self.records
            .read()
            .values()
            .map(|r| r.lock().clone())
            .collect()
    }
}

/// Spawns the monitor timer. The task ends when the router is dropped.
pub fn spawn_timer(router: Weak<Router>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(router) = router.upgrade() else {
                break;
            };
            router.health_tick().await;
        }
        debug!("health timer exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::TableKind;

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    fn setup() -> (HealthMonitor, SubscriptionTables) {
        let tables = SubscriptionTables::new();
        tables.add(TableKind::Data, "temps", n(2));
        tables.add(TableKind::System, "heartbeat", n(2));
        let monitor = HealthMonitor::new(HealthConfig::default());
        monitor.register(n(2), "worker");
        (monitor, tables)
    }

    #[test]
    fn test_validate_thresholds() {
        assert!(HealthConfig::default().validate().is_ok());
        let bad = HealthConfig {
            no_response_after: 2,
            ..HealthConfig::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidThresholds { .. })));
        let zero = HealthConfig {
            interval: Duration::ZERO,
            ..HealthConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_silent_node_walks_to_lost() {
        let (monitor, tables) = setup();
        let mut states = Vec::new();
        for _ in 0..6 {
            monitor.tick(&tables);
            states.push(monitor.state(n(2)).unwrap());
            if monitor.state(n(2)) != Some(NodeState::Lost) {
                assert!(tables.contains(TableKind::Data, "temps", n(2)));
            }
        }
        assert_eq!(
            states,
            vec![
                NodeState::NewNode,
                NodeState::NewNode,
                NodeState::Delayed,
                NodeState::NoResponse,
                NodeState::NoResponse,
                NodeState::Lost,
            ]
        );
        assert!(!tables.contains(TableKind::Data, "temps", n(2)));
        assert!(!tables.contains(TableKind::System, "heartbeat", n(2)));
        // Kept for audit.
        assert!(monitor.record(n(2)).is_some());
    }

    #[test]
    fn test_ack_moves_new_node_to_normal() {
        let (monitor, tables) = setup();
        let plan = monitor.tick(&tables);
        assert_eq!(plan.probe_index, 1);

        let t = monitor
            .on_heartbeat_ack(n(2), 1, 1_000, 0.1, 0.2, 1_500)
            .unwrap();
        assert_eq!((t.from, t.to), (NodeState::NewNode, NodeState::Normal));

        let record = monitor.record(n(2)).unwrap();
        assert_eq!(record.last_heartbeat_index, 1);
        assert_eq!(record.last_ping_micros, 500);
        assert_eq!(record.cpu_usage, 0.1);
    }

    #[test]
    fn test_acks_must_be_increasing_and_sent() {
        let (monitor, tables) = setup();
        monitor.tick(&tables);
        monitor.tick(&tables);

        assert!(monitor.on_heartbeat_ack(n(2), 2, 0, 0.0, 0.0, 10).is_some());
        // Older and duplicate indices are ignored.
        assert!(monitor.on_heartbeat_ack(n(2), 1, 0, 0.0, 0.0, 10).is_none());
        assert!(monitor.on_heartbeat_ack(n(2), 2, 0, 0.0, 0.0, 10).is_none());
        // Never sent.
        assert!(monitor.on_heartbeat_ack(n(2), 3, 0, 0.0, 0.0, 10).is_none());
        assert_eq!(monitor.record(n(2)).unwrap().last_heartbeat_index, 2);
    }

    #[test]
    fn test_out_of_order_ack_keeps_newest_index() {
        let tables = SubscriptionTables::new();
        let monitor = HealthMonitor::new(HealthConfig {
            delayed_after: 10,
            no_response_after: 20,
            lost_after: 30,
            ..HealthConfig::default()
        });
        monitor.register(n(2), "worker");
        for _ in 0..7 {
            monitor.tick(&tables);
        }
        assert!(monitor.on_heartbeat_ack(n(2), 7, 0, 0.0, 0.0, 1).is_some());
        assert!(monitor.on_heartbeat_ack(n(2), 5, 0, 0.0, 0.0, 1).is_none());
        assert_eq!(monitor.record(n(2)).unwrap().last_heartbeat_index, 7);
    }

    #[test]
    fn test_normal_node_degrades_in_order() {
        let (monitor, tables) = setup();
        monitor.tick(&tables);
        monitor.on_heartbeat_ack(n(2), 1, 0, 0.0, 0.0, 1);
        assert_eq!(monitor.state(n(2)), Some(NodeState::Normal));

        let mut seen = vec![NodeState::Normal];
        for _ in 0..8 {
            let plan = monitor.tick(&tables);
            for t in plan.transitions {
                assert_eq!(t.from, *seen.last().unwrap());
                if t.to != NodeState::Lost {
                    assert!(tables.contains(TableKind::Data, "temps", n(2)));
                }
                seen.push(t.to);
            }
        }
        assert_eq!(
            seen,
            vec![
                NodeState::Normal,
                NodeState::Delayed,
                NodeState::NoResponse,
                NodeState::Lost,
            ]
        );
        assert!(!tables.contains(TableKind::Data, "temps", n(2)));
    }

    #[test]
    fn test_slow_ping_is_delayed() {
        let (monitor, tables) = setup();
        monitor.tick(&tables);
        let t = monitor
            .on_heartbeat_ack(n(2), 1, 0, 0.0, 0.0, 600_000)
            .unwrap();
        assert_eq!(t.to, NodeState::Delayed);
    }

    #[test]
    fn test_no_response_recovers_on_fresh_ack() {
        let (monitor, tables) = setup();
        for _ in 0..4 {
            monitor.tick(&tables);
        }
        assert_eq!(monitor.state(n(2)), Some(NodeState::NoResponse));

        let latest = monitor.probe_index();
        let t = monitor
            .on_heartbeat_ack(n(2), latest, 0, 0.0, 0.0, 100)
            .unwrap();
        assert_eq!((t.from, t.to), (NodeState::NoResponse, NodeState::Normal));
    }

    #[test]
    fn test_lost_until_reregistered() {
        let (monitor, tables) = setup();
        for _ in 0..6 {
            monitor.tick(&tables);
        }
        assert_eq!(monitor.state(n(2)), Some(NodeState::Lost));
        let latest = monitor.probe_index();
        assert!(monitor.on_heartbeat_ack(n(2), latest, 0, 0.0, 0.0, 1).is_none());
        monitor.tick(&tables);
        assert_eq!(monitor.state(n(2)), Some(NodeState::Lost));

        monitor.register(n(2), "worker");
        let record = monitor.record(n(2)).unwrap();
        assert_eq!(record.state, NodeState::NewNode);
        assert_eq!(record.last_heartbeat_index, monitor.probe_index());
    }

    #[test]
    fn test_snapshot_budget_resets_on_change() {
        let tables = SubscriptionTables::new();
        let monitor = HealthMonitor::new(HealthConfig {
            max_snapshot_broadcasts: 2,
            ..HealthConfig::default()
        });

        let sent: Vec<bool> = (0..8).map(|_| monitor.tick(&tables).send_snapshot).collect();
        assert_eq!(sent, vec![false, true, false, true, false, false, false, false]);

        tables.add(TableKind::Data, "x", n(9));
        let sent: Vec<bool> = (0..4).map(|_| monitor.tick(&tables).send_snapshot).collect();
        assert_eq!(sent, vec![false, true, false, true]);
    }
}
