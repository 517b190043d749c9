//! Plugin hosting.
//!
//! Plugins are statically linked implementations of [`Plugin`], created by
//! name through a [`PluginRegistry`] that the composition root builds. The
//! [`PluginHost`] keeps one [`PluginBinding`] per loaded plugin and dispatches
//! local data and RPC deliveries to them. Plugin panics are contained at the
//! host boundary: each dispatch runs on its own task and a join error is
//! logged, not propagated.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::envelope::{DataMessage, DispatchMode, Payload, RpcCall};
use crate::error::{BusError, Result, RpcError};
use crate::router::Router;
use crate::subscription::TableKind;
use crate::types::NodeId;

/// A component hosted by the bus.
///
/// Every hook has a default so a plugin only implements what it uses.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Called once after loading. Returning false aborts the load.
    async fn start(&self, ctx: PluginContext) -> bool;

    /// Called once before the binding is dropped.
    async fn stop(&self) {}

    /// Delivery of a data message the plugin subscribed to.
    async fn on_data(&self, data: &DataMessage) {
        let _ = data;
    }

    /// Handles a call to a service the plugin provides.
    async fn invoke(&self, call: &RpcCall) -> std::result::Result<Payload, RpcError> {
        Err(RpcError::ServiceNotExist {
            service: call.service.clone(),
        })
    }
}

/// Everything a plugin receives at start.
#[derive(Clone)]
pub struct PluginContext {
    /// Name the plugin is bound under.
    pub name: String,
    /// Parameters from the plugin's configuration descriptor.
    pub params: BTreeMap<String, String>,
    /// Access back into the bus.
    pub bus: BusHandle,
}

impl PluginContext {
    /// Parameter lookup.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// A plugin's weak handle on the bus.
///
/// The handle does not keep the bus alive; once the bus is gone every call
/// fails with the operation's error variant.
#[derive(Clone)]
pub struct BusHandle {
    router: Weak<Router>,
    plugin: String,
}

impl BusHandle {
    pub(crate) fn new(router: Weak<Router>, plugin: impl Into<String>) -> Self {
        Self {
            router,
            plugin: plugin.into(),
        }
    }

    /// A handle that is not attached to any bus.
    pub fn detached(plugin: impl Into<String>) -> Self {
        Self::new(Weak::new(), plugin)
    }

    /// Name of the plugin owning this handle.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Local node id, if the bus is still running.
    pub fn local_id(&self) -> Option<NodeId> {
        self.router.upgrade().map(|r| r.local_id())
    }

    async fn subscribe(&self, kind: TableKind, name: &str) -> std::result::Result<(), RpcError> {
        match self.router.upgrade() {
            Some(router) => router.subscribe(&self.plugin, kind, name).await,
            None => Err(RpcError::SubscribeFailed {
                plugin: self.plugin.clone(),
                name: name.to_string(),
            }),
        }
    }

    async fn unsubscribe(&self, kind: TableKind, name: &str) -> std::result::Result<(), RpcError> {
        match self.router.upgrade() {
            Some(router) => router.unsubscribe(&self.plugin, kind, name).await,
            None => Err(RpcError::UnsubscribeFailed {
                plugin: self.plugin.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Receive data published under `name`.
    pub async fn subscribe_data(&self, name: &str) -> std::result::Result<(), RpcError> {
        self.subscribe(TableKind::Data, name).await
    }

    /// Stop receiving data published under `name`.
    pub async fn unsubscribe_data(&self, name: &str) -> std::result::Result<(), RpcError> {
        self.unsubscribe(TableKind::Data, name).await
    }

    /// Provide the service `name`.
    pub async fn subscribe_service(&self, name: &str) -> std::result::Result<(), RpcError> {
        self.subscribe(TableKind::Service, name).await
    }

    /// Stop providing the service `name`.
    pub async fn unsubscribe_service(&self, name: &str) -> std::result::Result<(), RpcError> {
        self.unsubscribe(TableKind::Service, name).await
    }

    /// Publish a data message.
    pub async fn publish_data(&self, data: DataMessage, mode: DispatchMode) -> Result<()> {
        let router = self.router.upgrade().ok_or(BusError::Shutdown)?;
        router.publish_data(data, mode).await
    }

    /// Call a service. `timeout` falls back to the bus default.
    pub async fn invoke(
        &self,
        service: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> std::result::Result<Payload, RpcError> {
        match self.router.upgrade() {
            Some(router) => router.invoke(service, payload, timeout).await,
            None => Err(RpcError::RpcFailed {
                reason: BusError::Shutdown.to_string(),
            }),
        }
    }
}

/// Creates plugin instances.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Library name → factory.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the bundled plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers a factory, replacing any previous one for `library`.
    pub fn register<F>(&mut self, library: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(library.into(), Arc::new(factory));
    }

    /// Builds a fresh instance.
    pub fn create(&self, library: &str) -> Option<Arc<dyn Plugin>> {
        self.factories.get(library).map(|factory| factory())
    }

    /// True if `library` is registered.
    pub fn contains(&self, library: &str) -> bool {
        self.factories.contains_key(library)
    }

    /// Registered library names, sorted.
    pub fn libraries(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A loaded plugin and its subscriptions.
pub struct PluginBinding {
    name: String,
    plugin: Arc<dyn Plugin>,
    enabled: AtomicBool,
    data: RwLock<BTreeSet<String>>,
    services: RwLock<BTreeSet<String>>,
    // Dispatches hold the read side; unload takes the write side to wait
    // for them.
    gate: tokio::sync::RwLock<()>,
}

impl PluginBinding {
    fn new(name: String, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            name,
            plugin,
            enabled: AtomicBool::new(true),
            data: RwLock::new(BTreeSet::new()),
            services: RwLock::new(BTreeSet::new()),
            gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Bound name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if dispatch reaches this plugin.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set(&self, kind: TableKind) -> Option<&RwLock<BTreeSet<String>>> {
        match kind {
            TableKind::Data => Some(&self.data),
            TableKind::Service => Some(&self.services),
            TableKind::System => None,
        }
    }

    /// Records a subscription. Returns true if it was new.
    pub fn add_subscription(&self, kind: TableKind, name: &str) -> bool {
        self.set(kind)
            .map(|set| set.write().insert(name.to_string()))
            .unwrap_or(false)
    }

    /// Drops a subscription. Returns true if it existed.
    pub fn remove_subscription(&self, kind: TableKind, name: &str) -> bool {
        self.set(kind)
            .map(|set| set.write().remove(name))
            .unwrap_or(false)
    }

    /// True if subscribed to `name` in `kind`.
    pub fn is_subscribed(&self, kind: TableKind, name: &str) -> bool {
        self.set(kind)
            .map(|set| set.read().contains(name))
            .unwrap_or(false)
    }

    /// Data names subscribed to.
    pub fn subscribed_data(&self) -> BTreeSet<String> {
        self.data.read().clone()
    }

    /// Services provided.
    pub fn subscribed_services(&self) -> BTreeSet<String> {
        self.services.read().clone()
    }
}

/// The set of loaded plugins on this node.
pub struct PluginHost {
    bindings: RwLock<BTreeMap<String, Arc<PluginBinding>>>,
}

impl PluginHost {
    /// No plugins loaded.
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a binding. It is visible to dispatch before the plugin's
    /// start hook runs so subscriptions made during start are recorded.
    pub fn bind(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<Arc<PluginBinding>> {
        let mut bindings = self.bindings.write();
        if bindings.contains_key(name) {
            return Err(BusError::DuplicatePlugin {
                name: name.to_string(),
            });
        }
        let binding = Arc::new(PluginBinding::new(name.to_string(), plugin));
        bindings.insert(name.to_string(), Arc::clone(&binding));
        Ok(binding)
    }

    /// Runs the start hook. A panic counts as a refusal.
    pub async fn start(&self, binding: &Arc<PluginBinding>, ctx: PluginContext) -> bool {
        let plugin = Arc::clone(&binding.plugin);
        match tokio::spawn(async move { plugin.start(ctx).await }).await {
            Ok(started) => started,
            Err(e) => {
                error!(plugin = %binding.name, error = %e, "plugin panicked during start");
                false
            }
        }
    }

    /// Removes a binding without calling its stop hook.
    pub fn discard(&self, name: &str) -> Option<Arc<PluginBinding>> {
        self.bindings.write().remove(name)
    }

    /// Disables the plugin, waits for in-flight dispatches, calls its stop
    /// hook and removes the binding.
    pub async fn unload(&self, name: &str) -> Result<Arc<PluginBinding>> {
        let binding = self.binding(name).ok_or_else(|| BusError::PluginNotLoaded {
            name: name.to_string(),
        })?;
        binding.enabled.store(false, Ordering::Release);
        {
            let _drained = binding.gate.write().await;
            debug!(plugin = name, "in-flight dispatches drained");
        }

        let plugin = Arc::clone(&binding.plugin);
        if let Err(e) = tokio::spawn(async move { plugin.stop().await }).await {
            error!(plugin = name, error = %e, "plugin panicked during stop");
        }

        self.bindings.write().remove(name);
        info!(plugin = name, "plugin unloaded");
        Ok(binding)
    }

    /// Enables or disables dispatch to a plugin.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let binding = self.binding(name).ok_or_else(|| BusError::PluginNotLoaded {
            name: name.to_string(),
        })?;
        binding.enabled.store(enabled, Ordering::Release);
        info!(plugin = name, enabled, "plugin dispatch toggled");
        Ok(())
    }

    /// Looks up a binding.
    pub fn binding(&self, name: &str) -> Option<Arc<PluginBinding>> {
        self.bindings.read().get(name).cloned()
    }

    /// Names of loaded plugins.
    pub fn names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    /// True if any loaded plugin subscribes to `name` in `kind`.
    pub fn any_subscribed(&self, kind: TableKind, name: &str) -> bool {
        self.bindings
            .read()
            .values()
            .any(|b| b.is_subscribed(kind, name))
    }

    /// Union of all plugins' subscriptions of `kind`.
    pub fn subscriptions(&self, kind: TableKind) -> BTreeSet<String> {
        let bindings = self.bindings.read();
        let mut names = BTreeSet::new();
        for binding in bindings.values() {
            match kind {
                TableKind::Data => names.extend(binding.subscribed_data()),
                TableKind::Service => names.extend(binding.subscribed_services()),
                TableKind::System => {}
            }
        }
        names
    }

    fn enabled_subscribers(&self, kind: TableKind, name: &str) -> Vec<Arc<PluginBinding>> {
        self.bindings
            .read()
            .values()
            .filter(|b| b.is_enabled() && b.is_subscribed(kind, name))
            .cloned()
            .collect()
    }

    /// Delivers `data` to every enabled subscriber concurrently and waits
    /// for all of them. Returns the number of plugins that completed.
    pub async fn dispatch_data(&self, data: DataMessage) -> usize {
        let targets = self.enabled_subscribers(TableKind::Data, &data.name);
        if targets.is_empty() {
            return 0;
        }
        let data = Arc::new(data);

        let mut handles = Vec::with_capacity(targets.len());
        for binding in targets {
            let data = Arc::clone(&data);
            let name = binding.name.clone();
            let handle = tokio::spawn(async move {
                let _gate = binding.gate.read().await;
                if !binding.is_enabled() {
                    return false;
                }
                binding.plugin.on_data(&data).await;
                true
            });
            handles.push((name, handle));
        }

        let mut delivered = 0;
        for (name, handle) in handles {
            match handle.await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(plugin = %name, data = %data.name, error = %e, "plugin panicked in on_data");
                }
            }
        }
        delivered
    }

    /// Runs a call on the first enabled local provider.
    pub async fn dispatch_call(&self, call: RpcCall) -> std::result::Result<Payload, RpcError> {
        let Some(binding) = self
            .enabled_subscribers(TableKind::Service, &call.service)
            .into_iter()
            .next()
        else {
            return Err(RpcError::ServiceNotExist {
                service: call.service,
            });
        };

        let name = binding.name.clone();
        let service = call.service.clone();
        let handle = tokio::spawn(async move {
            let _gate = binding.gate.read().await;
            if !binding.is_enabled() {
                return Err(RpcError::ServiceNotExist {
                    service: call.service.clone(),
                });
            }
            binding.plugin.invoke(&call).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(plugin = %name, service = %service, error = %e, "plugin panicked in invoke");
                Err(RpcError::RpcFailed {
                    reason: format!("provider {} panicked", name),
                })
            }
        }
    }
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        let remaining = self.bindings.get_mut().len();
        if remaining > 0 {
            warn!(remaining, "plugin host dropped with plugins still bound");
        }
    }
}
