//! Node configuration, loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::health::HealthConfig;
use crate::router::RouterConfig;
use crate::types::{NodeId, NodeRole};

/// Where the center node lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CenterConfig {
    /// Center node id.
    pub id: u32,
    /// Center listen address, `host:port`.
    pub addr: String,
}

/// A plugin to load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Registry name of the implementation.
    pub library: String,
    /// Binding name; defaults to the library name.
    #[serde(default)]
    pub name: Option<String>,
    /// Disabled plugins are loaded but receive no dispatch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Passed to the plugin's start hook.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl PluginDescriptor {
    /// Binding name.
    pub fn binding_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.library)
    }
}

fn default_true() -> bool {
    true
}

/// Channel and RPC tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Ordered channel capacity.
    pub ordered_capacity: usize,
    /// Unordered channel capacity.
    pub unordered_capacity: usize,
    /// Unordered channel workers.
    pub unordered_workers: usize,
    /// Default `invoke` deadline.
    pub rpc_timeout_ms: u64,
    /// Outbound connect timeout.
    pub connect_timeout_ms: u64,
    /// Runtime worker threads driving connection I/O and dispatch.
    pub io_threads: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            ordered_capacity: 1000,
            unordered_capacity: 1000,
            unordered_workers: 4,
            rpc_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            io_threads: 4,
        }
    }
}

/// Health monitor tuning. Only the center uses the thresholds; every node
/// uses `interval_ms` and `reregister_after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Heartbeat period.
    pub interval_ms: u64,
    /// Missed probes before `Delayed`.
    pub delayed_after: u64,
    /// Missed probes before `NoResponse`.
    pub no_response_after: u64,
    /// Missed probes before `Lost`.
    pub lost_after: u64,
    /// Round-trip time above which a node is `Delayed`.
    pub delayed_ping_ms: u64,
    /// Snapshot broadcasts between table changes.
    pub max_snapshot_broadcasts: u32,
    /// Intervals without a probe before a common node registers again.
    pub reregister_after: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            delayed_after: 2,
            no_response_after: 3,
            lost_after: 5,
            delayed_ping_ms: 500,
            max_snapshot_broadcasts: 5,
            reregister_after: 5,
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Non-zero node id.
    pub node_id: u32,
    /// Display name; defaults to `node-<id>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Center or common.
    pub node_type: NodeRole,
    /// Listen address, `host:port`.
    pub listen_addr: String,
    /// Address announced to other nodes; defaults to `listen_addr`.
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Required for common nodes.
    #[serde(default)]
    pub center: Option<CenterConfig>,
    /// Optional log shipping endpoint, `host:port`.
    #[serde(default)]
    pub remote_log: Option<String>,
    /// Plugins to load.
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    /// Channel and RPC tuning.
    #[serde(default)]
    pub bus: BusSettings,
    /// Health tuning.
    #[serde(default)]
    pub health: HealthSettings,
}

/// `0.0.0.0` or `[::]`; a peer dialing it would reach itself.
fn has_unspecified_ip(addr: &str) -> bool {
    addr.rsplit_once(':')
        .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
        .and_then(|host| host.parse::<IpAddr>().ok())
        .is_some_and(|ip| ip.is_unspecified())
}

fn valid_addr(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl NodeConfig {
    /// Loads configuration, choosing the format by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: NodeConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: NodeConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Checks every constraint; any error is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::InvalidNodeId);
        }
        if !valid_addr(&self.listen_addr) {
            return Err(ConfigError::InvalidAddress {
                field: "listen_addr",
                value: self.listen_addr.clone(),
            });
        }
        if let Some(addr) = &self.advertise_addr {
            if !valid_addr(addr) {
                return Err(ConfigError::InvalidAddress {
                    field: "advertise_addr",
                    value: addr.clone(),
                });
            }
        }
        if has_unspecified_ip(self.advertise_addr()) {
            return Err(ConfigError::UnspecifiedAdvertise {
                addr: self.advertise_addr().to_string(),
            });
        }
        if let Some(addr) = &self.remote_log {
            if !valid_addr(addr) {
                return Err(ConfigError::InvalidAddress {
                    field: "remote_log",
                    value: addr.clone(),
                });
            }
        }

        if self.node_type == NodeRole::Common {
            let center = self.center.as_ref().ok_or(ConfigError::MissingCenter)?;
            if center.id == 0 || center.id == self.node_id {
                return Err(ConfigError::InvalidCenter(center.id));
            }
            if !valid_addr(&center.addr) {
                return Err(ConfigError::InvalidAddress {
                    field: "center.addr",
                    value: center.addr.clone(),
                });
            }
        }

        let bus = &self.bus;
        for (field, value) in [
            ("bus.ordered_capacity", bus.ordered_capacity as u64),
            ("bus.unordered_capacity", bus.unordered_capacity as u64),
            ("bus.unordered_workers", bus.unordered_workers as u64),
            ("bus.rpc_timeout_ms", bus.rpc_timeout_ms),
            ("bus.connect_timeout_ms", bus.connect_timeout_ms),
            ("bus.io_threads", bus.io_threads as u64),
            ("health.reregister_after", self.health.reregister_after as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue(field));
            }
        }
        self.health_config().validate()?;

        let mut names = HashSet::new();
        for plugin in &self.plugins {
            if !names.insert(plugin.binding_name()) {
                return Err(ConfigError::DuplicatePlugin(plugin.binding_name().to_string()));
            }
        }
        Ok(())
    }

    /// Display name.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("node-{}", self.node_id))
    }

    /// Address announced to peers.
    pub fn advertise_addr(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.listen_addr)
    }

    /// Health monitor tuning.
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.health.interval_ms),
            delayed_after: self.health.delayed_after,
            no_response_after: self.health.no_response_after,
            lost_after: self.health.lost_after,
            delayed_ping: Duration::from_millis(self.health.delayed_ping_ms),
            max_snapshot_broadcasts: self.health.max_snapshot_broadcasts,
        }
    }

    /// Router settings. `advertise_addr` overrides the configured one, for
    /// listeners bound to port zero.
    pub fn router_config(&self, advertise_addr: String) -> RouterConfig {
        RouterConfig {
            local_id: NodeId::new(self.node_id),
            name: self.display_name(),
            role: self.node_type,
            advertise_addr,
            center: self
                .center
                .as_ref()
                .map(|c| (NodeId::new(c.id), c.addr.clone())),
            ordered_capacity: self.bus.ordered_capacity,
            unordered_capacity: self.bus.unordered_capacity,
            unordered_workers: self.bus.unordered_workers,
            rpc_timeout: Duration::from_millis(self.bus.rpc_timeout_ms),
            health: self.health_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn common() -> NodeConfig {
        NodeConfig {
            node_id: 2,
            name: None,
            node_type: NodeRole::Common,
            listen_addr: "127.0.0.1:7002".into(),
            advertise_addr: None,
            center: Some(CenterConfig {
                id: 1,
                addr: "127.0.0.1:7001".into(),
            }),
            remote_log: None,
            plugins: Vec::new(),
            bus: BusSettings::default(),
            health: HealthSettings::default(),
        }
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
node_id = 2
name = "worker-a"
node_type = "common"
listen_addr = "0.0.0.0:7002"
advertise_addr = "10.0.0.2:7002"

[center]
id = 1
addr = "10.0.0.1:7001"

[bus]
unordered_workers = 8

[health]
interval_ms = 500

[[plugins]]
library = "echo"
params = {{ service = "ping" }}

[[plugins]]
library = "data-logger"
name = "audit"
enabled = false
            "#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.display_name(), "worker-a");
        assert_eq!(config.advertise_addr(), "10.0.0.2:7002");
        assert_eq!(config.bus.unordered_workers, 8);
        assert_eq!(config.bus.ordered_capacity, 1000);
        assert_eq!(config.bus.io_threads, 4);
        assert_eq!(config.health.interval_ms, 500);
        assert_eq!(config.health.lost_after, 5);
        assert_eq!(config.plugins.len(), 2);
        assert!(config.plugins[0].enabled);
        assert_eq!(config.plugins[0].params.get("service").map(String::as_str), Some("ping"));
        assert_eq!(config.plugins[1].binding_name(), "audit");
        assert!(!config.plugins[1].enabled);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "node_id": 1,
                "node_type": "center",
                "listen_addr": "127.0.0.1:7001"
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_type, NodeRole::Center);
        assert_eq!(config.display_name(), "node-1");
        assert!(config.center.is_none());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = common();
        c.node_id = 0;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidNodeId)));

        let mut c = common();
        c.listen_addr = "nope".into();
        assert!(matches!(c.validate(), Err(ConfigError::InvalidAddress { field: "listen_addr", .. })));

        let mut c = common();
        c.center = None;
        assert!(matches!(c.validate(), Err(ConfigError::MissingCenter)));

        let mut c = common();
        c.center.as_mut().unwrap().id = 2;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidCenter(2))));

        let mut c = common();
        c.health.no_response_after = 6;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidThresholds { .. })));

        let mut c = common();
        c.bus.unordered_workers = 0;
        assert!(matches!(c.validate(), Err(ConfigError::ZeroValue("bus.unordered_workers"))));

        let mut c = common();
        c.bus.io_threads = 0;
        assert!(matches!(c.validate(), Err(ConfigError::ZeroValue("bus.io_threads"))));
    }

    #[test]
    fn test_unspecified_listen_ip_needs_advertise_addr() {
        let mut c = common();
        c.listen_addr = "0.0.0.0:7002".into();
        c.advertise_addr = None;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::UnspecifiedAdvertise { addr }) if addr == "0.0.0.0:7002"
        ));

        c.advertise_addr = Some("[::]:7002".into());
        assert!(matches!(c.validate(), Err(ConfigError::UnspecifiedAdvertise { .. })));

        c.advertise_addr = Some("10.1.2.3:7002".into());
        assert!(c.validate().is_ok());

        c.listen_addr = "worker.local:7002".into();
        c.advertise_addr = None;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_duplicate_plugin_names() {
        let mut c = common();
        let echo = PluginDescriptor {
            library: "echo".into(),
            name: None,
            enabled: true,
            params: BTreeMap::new(),
        };
        c.plugins = vec![echo.clone(), echo];
        assert!(matches!(c.validate(), Err(ConfigError::DuplicatePlugin(_))));
    }

    #[test]
    fn test_router_config() {
        let rc = common().router_config("127.0.0.1:9999".into());
        assert_eq!(rc.local_id, NodeId::new(2));
        assert_eq!(rc.center, Some((NodeId::new(1), "127.0.0.1:7001".to_string())));
        assert_eq!(rc.advertise_addr, "127.0.0.1:9999");
        assert_eq!(rc.rpc_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_sample_configs_are_valid() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");
        let center = NodeConfig::from_file(&dir.join("center.toml")).unwrap();
        assert_eq!(center.node_type, NodeRole::Center);
        center.validate().unwrap();

        let worker = NodeConfig::from_file(&dir.join("worker.toml")).unwrap();
        assert_eq!(worker.plugins[0].binding_name(), "resize-echo");
        assert!(!worker.plugins[1].enabled);
        assert_eq!(worker.center.as_ref().map(|c| c.id), Some(1));
        worker.validate().unwrap();
    }
}
