//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use nodebus::config::{BusSettings, CenterConfig, HealthSettings, PluginDescriptor};
use nodebus::{
    Bus, BusHandle, DataMessage, NodeConfig, NodeRole, Payload, Plugin, PluginContext, PluginRegistry,
    RpcCall, RpcError,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Heartbeat interval used by every test node.
pub const INTERVAL_MS: u64 = 100;

pub fn health() -> HealthSettings {
    HealthSettings {
        interval_ms: INTERVAL_MS,
        ..HealthSettings::default()
    }
}

/// A center node listening on an ephemeral port.
pub async fn start_center(plugins: Vec<PluginDescriptor>, registry: &PluginRegistry) -> Bus {
    start_center_with(plugins, registry, health()).await
}

/// A center node with custom health tuning.
pub async fn start_center_with(
    plugins: Vec<PluginDescriptor>,
    registry: &PluginRegistry,
    health: HealthSettings,
) -> Bus {
    let config = NodeConfig {
        node_id: 1,
        name: Some("center".into()),
        node_type: NodeRole::Center,
        listen_addr: "127.0.0.1:0".into(),
        advertise_addr: None,
        center: None,
        remote_log: None,
        plugins,
        bus: BusSettings::default(),
        health,
    };
    Bus::start(config, registry).await.expect("center starts")
}

/// A common node joined to `center`.
pub async fn start_common(
    id: u32,
    center: &Bus,
    plugins: Vec<PluginDescriptor>,
    registry: &PluginRegistry,
) -> Bus {
    start_common_with(id, center, plugins, registry, health()).await
}

/// A common node with custom health tuning.
pub async fn start_common_with(
    id: u32,
    center: &Bus,
    plugins: Vec<PluginDescriptor>,
    registry: &PluginRegistry,
    health: HealthSettings,
) -> Bus {
    let config = NodeConfig {
        node_id: id,
        name: Some(format!("node-{}", id)),
        node_type: NodeRole::Common,
        listen_addr: "127.0.0.1:0".into(),
        advertise_addr: None,
        center: Some(CenterConfig {
            id: center.local_id().as_u32(),
            addr: center.local_addr().to_string(),
        }),
        remote_log: None,
        plugins,
        bus: BusSettings::default(),
        health,
    };
    Bus::start(config, registry).await.expect("common node starts")
}

/// Descriptor for a registered test library.
pub fn plugin(library: &str, name: &str, params: &[(&str, &str)]) -> PluginDescriptor {
    PluginDescriptor {
        library: library.into(),
        name: Some(name.into()),
        enabled: true,
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Forwards every data message on `topics` to a channel.
pub struct Collector {
    tx: mpsc::UnboundedSender<DataMessage>,
}

#[async_trait]
impl Plugin for Collector {
    async fn start(&self, ctx: PluginContext) -> bool {
        let topics = ctx.param("topics").unwrap_or("").to_string();
        for topic in topics.split(',').filter(|t| !t.is_empty()) {
            if ctx.bus.subscribe_data(topic).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn on_data(&self, data: &DataMessage) {
        let _ = self.tx.send(data.clone());
    }
}

/// Provides `sleep`, which answers after the number of milliseconds in the
/// `ms` block.
pub struct Sleeper;

#[async_trait]
impl Plugin for Sleeper {
    async fn start(&self, ctx: PluginContext) -> bool {
        ctx.bus.subscribe_service("sleep").await.is_ok()
    }

    async fn invoke(&self, call: &RpcCall) -> Result<Payload, RpcError> {
        let ms = call
            .payload
            .get("ms")
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Payload::new())
    }
}

/// Panics on every data message of `topics`.
pub struct Exploder;

#[async_trait]
impl Plugin for Exploder {
    async fn start(&self, ctx: PluginContext) -> bool {
        let topics = ctx.param("topics").unwrap_or("").to_string();
        for topic in topics.split(',').filter(|t| !t.is_empty()) {
            if ctx.bus.subscribe_data(topic).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn on_data(&self, _data: &DataMessage) {
        panic!("plugin failure");
    }
}

/// Hands its bus handle to the test so it can subscribe after start.
pub struct Keeper {
    slot: HandleSlot,
}

/// Where a [`Keeper`] leaves its handle.
pub type HandleSlot = Arc<Mutex<Option<BusHandle>>>;

#[async_trait]
impl Plugin for Keeper {
    async fn start(&self, ctx: PluginContext) -> bool {
        *self.slot.lock() = Some(ctx.bus);
        true
    }
}

/// Registry with a `keeper` library writing into the returned slot.
pub fn keeper_registry() -> (PluginRegistry, HandleSlot) {
    let slot: HandleSlot = Arc::new(Mutex::new(None));
    let mut registry = PluginRegistry::with_builtins();
    let shared = Arc::clone(&slot);
    registry.register("keeper", move || {
        Arc::new(Keeper {
            slot: Arc::clone(&shared),
        }) as Arc<dyn Plugin>
    });
    (registry, slot)
}

/// Registry with the bundled plugins plus `collector`, `sleeper` and
/// `exploder`. Collector output goes to the returned receiver.
pub fn registry() -> (PluginRegistry, mpsc::UnboundedReceiver<DataMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut registry = PluginRegistry::with_builtins();
    registry.register("collector", move || {
        Arc::new(Collector { tx: tx.clone() }) as Arc<dyn Plugin>
    });
    registry.register("sleeper", || Arc::new(Sleeper) as Arc<dyn Plugin>);
    registry.register("exploder", || Arc::new(Exploder) as Arc<dyn Plugin>);
    (registry, rx)
}

/// Waits for the next collected message.
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<DataMessage>) -> Option<DataMessage> {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .ok()
        .flatten()
}
