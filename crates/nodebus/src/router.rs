//! Bus router.
//!
//! Every envelope, local or inbound, passes through [`Router::classify`].
//! `Sync` envelopes are handled on the calling task; `Ordered` and
//! `Unordered` ones are queued on the matching work channel.
//!
//! Handling a locally originated envelope (source zero) stamps the local id,
//! merges the push list with the subscribers of the envelope's key, delivers
//! to local plugins if the local id is among the destinations, and sends one
//! frame to each remaining peer. Inbound envelopes are only delivered
//! locally; a node never forwards what it received.

use async_trait::async_trait;
use nodebus_transport::{ConnectionPool, Frame, FrameHandler, FrameTag, TransportError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelConfig, WorkChannel, WorkHandler};
use crate::directory::NodeDirectory;
use crate::envelope::{
    Body, DataMessage, DispatchMode, Envelope, Payload, Registration, RpcCall, RpcReply,
    SubscriptionChange, SystemMessage,
};
use crate::error::{BusError, Result, RpcError};
use crate::health::{HealthConfig, HealthMonitor, NodeState};
use crate::plugin::{BusHandle, Plugin, PluginBinding, PluginContext, PluginHost};
use crate::rpc::PendingCalls;
use crate::subscription::{SubscriptionTables, TableKind};
use crate::types::{now_micros, NodeId, NodeRole};
use crate::usage;

/// System event kinds every registered node listens to.
const NODE_SYSTEM_EVENTS: [&str; 2] = ["heartbeat", "table-sync"];

/// Static router settings.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// This node's id.
    pub local_id: NodeId,
    /// Display name sent in registrations.
    pub name: String,
    /// Center or common.
    pub role: NodeRole,
    /// Address peers use to reach this node.
    pub advertise_addr: String,
    /// Center id and address; required for common nodes.
    pub center: Option<(NodeId, String)>,
    /// Ordered channel capacity.
    pub ordered_capacity: usize,
    /// Unordered channel capacity.
    pub unordered_capacity: usize,
    /// Unordered channel workers.
    pub unordered_workers: usize,
    /// Deadline for `invoke` when the caller gives none.
    pub rpc_timeout: Duration,
    /// Health monitor tuning; only used on the center.
    pub health: HealthConfig,
}

/// Routes envelopes between local plugins and peer nodes.
pub struct Router {
    config: RouterConfig,
    center_id: NodeId,
    tables: SubscriptionTables,
    directory: NodeDirectory,
    pool: ConnectionPool,
    plugins: PluginHost,
    pending: PendingCalls,
    ordered: WorkChannel<Envelope>,
    unordered: WorkChannel<Envelope>,
    health: Option<HealthMonitor>,
    last_probe_at: AtomicI64,
    // Serializes local subscription changes with their table updates.
    subscription_guard: tokio::sync::Mutex<()>,
    self_ref: Weak<Router>,
}

fn channel_handler(router: Weak<Router>) -> WorkHandler<Envelope> {
    Arc::new(move |envelope| {
        let router = router.clone();
        Box::pin(async move {
            if let Some(router) = router.upgrade() {
                router.handle(envelope).await;
            }
        })
    })
}

impl Router {
    /// Builds the router and starts its work channels. The pool must already
    /// be bound; inbound traffic reaches the router once the caller starts
    /// the pool with [`InboundFrames`].
    pub fn new(config: RouterConfig, pool: ConnectionPool) -> Result<Arc<Self>> {
        let center_id = match (config.role, &config.center) {
            (NodeRole::Center, _) => config.local_id,
            (NodeRole::Common, Some((id, _))) => *id,
            (NodeRole::Common, None) => {
                return Err(crate::error::ConfigError::MissingCenter.into());
            }
        };

        Ok(Arc::new_cyclic(|weak: &Weak<Router>| {
            let directory = NodeDirectory::new();
            directory.insert(config.local_id, config.advertise_addr.clone());
            if let Some((id, addr)) = &config.center {
                if config.role == NodeRole::Common {
                    directory.insert(*id, addr.clone());
                }
            }

            let ordered = WorkChannel::start(
                ChannelConfig {
                    name: "ordered",
                    capacity: config.ordered_capacity,
                    workers: 1,
                },
                channel_handler(weak.clone()),
            );
            let unordered = WorkChannel::start(
                ChannelConfig {
                    name: "unordered",
                    capacity: config.unordered_capacity,
                    workers: config.unordered_workers,
                },
                channel_handler(weak.clone()),
            );
            let health = (config.role == NodeRole::Center)
                .then(|| HealthMonitor::new(config.health.clone()));

            Router {
                center_id,
                tables: SubscriptionTables::new(),
                directory,
                pool,
                plugins: PluginHost::new(),
                pending: PendingCalls::new(),
                ordered,
                unordered,
                health,
                last_probe_at: AtomicI64::new(now_micros()),
                subscription_guard: tokio::sync::Mutex::new(()),
                self_ref: weak.clone(),
                config,
            }
        }))
    }

    /// This node's id.
    pub fn local_id(&self) -> NodeId {
        self.config.local_id
    }

    /// This node's role.
    pub fn role(&self) -> NodeRole {
        self.config.role
    }

    /// Id of the center node (the local id on the center).
    pub fn center_id(&self) -> NodeId {
        self.center_id
    }

    fn is_center(&self) -> bool {
        self.config.role == NodeRole::Center
    }

    /// Subscription tables.
    pub fn tables(&self) -> &SubscriptionTables {
        &self.tables
    }

    /// Node directory.
    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    /// Loaded plugins.
    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    /// Health monitor, present on the center only.
    pub fn health(&self) -> Option<&HealthMonitor> {
        self.health.as_ref()
    }

    /// Connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Default RPC deadline.
    pub fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout
    }

    /// Entry point for every envelope.
    pub async fn classify(&self, envelope: Envelope) -> Result<()> {
        match envelope.mode {
            DispatchMode::Sync => {
                self.handle(envelope).await;
                Ok(())
            }
            DispatchMode::Ordered => self.enqueue(&self.ordered, envelope),
            DispatchMode::Unordered => self.enqueue(&self.unordered, envelope),
        }
    }

    fn enqueue(&self, channel: &WorkChannel<Envelope>, envelope: Envelope) -> Result<()> {
        let key = envelope.key();
        if channel.enqueue(envelope) {
            Ok(())
        } else if channel.is_stopped() {
            debug!(channel = channel.name(), key = %key, "channel stopped, envelope rejected");
            Err(BusError::Shutdown)
        } else {
            warn!(channel = channel.name(), key = %key, "channel full, envelope rejected");
            Err(BusError::Backpressure {
                channel: channel.name(),
            })
        }
    }

    /// Processes an envelope and any reply it produces.
    async fn handle(&self, envelope: Envelope) {
        let mut next = Some(envelope);
        while let Some(envelope) = next.take() {
            next = self.route_once(envelope).await;
        }
    }

    async fn route_once(&self, mut envelope: Envelope) -> Option<Envelope> {
        if !envelope.source.is_unstamped() {
            return self.deliver_local(envelope).await;
        }

        let local = self.local_id();
        envelope.source = local;
        let mut destinations = std::mem::take(&mut envelope.destinations);
        destinations.extend(self.resolve(&envelope, &destinations));
        let deliver_here = destinations.remove(&local);
        envelope.destinations = destinations;

        trace!(
            kind = ?envelope.kind(),
            key = %envelope.key(),
            local = deliver_here,
            remote = envelope.destinations.len(),
            "routing envelope"
        );

        let remote = if envelope.destinations.is_empty() {
            None
        } else {
            match Self::prepare_remote(&envelope).await {
                Ok(prepared) => Some((envelope.destinations.clone(), prepared)),
                Err(e) => {
                    warn!(key = %envelope.key(), error = %e, "envelope not sent to peers");
                    None
                }
            }
        };

        let follow_up = if deliver_here {
            self.deliver_local(envelope).await
        } else {
            None
        };

        if let Some((peers, (frame, to_delete))) = remote {
            self.transmit(&peers, &frame).await;
            for path in to_delete {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "could not remove sent attachment");
                }
            }
        }

        follow_up
    }

    /// Destinations implied by the envelope's key.
    fn resolve(&self, envelope: &Envelope, push: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        match &envelope.body {
            Body::Data(data) => self.tables.subscribers(TableKind::Data, &data.name),
            // An explicit provider wins; otherwise every provider is asked.
            Body::RpcCall(call) if push.is_empty() => {
                self.tables.subscribers(TableKind::Service, &call.service)
            }
            Body::RpcCall(_) => BTreeSet::new(),
            Body::RpcReply(reply) => BTreeSet::from([reply.caller]),
            Body::System(msg) => self.tables.subscribers(TableKind::System, msg.event_kind()),
        }
    }

    /// Encodes the envelope for peers, inlining file attachments.
    async fn prepare_remote(envelope: &Envelope) -> Result<(Frame, Vec<PathBuf>)> {
        let mut wire = envelope.clone();
        let to_delete = match wire.payload_mut() {
            Some(payload) if !payload.attachments.is_empty() => {
                payload.inline_attachments().await?
            }
            _ => Vec::new(),
        };
        let frame = Frame::new(FrameTag::Bus, wire.encode()?)?;
        Ok((frame, to_delete))
    }

    /// Sends `frame` to every peer concurrently and waits for all sends, so
    /// one slow peer does not hold back the others.
    async fn transmit(&self, peers: &BTreeSet<NodeId>, frame: &Frame) {
        let mut sends = Vec::with_capacity(peers.len());
        for &node in peers {
            let Some(addr) = self.directory.get(node) else {
                warn!(node = %node, "no address known for node, skipping");
                continue;
            };
            let pool = self.pool.clone();
            let frame = frame.clone();
            sends.push(tokio::spawn(async move {
                if let Err(e) = pool.send(&addr, &frame).await {
                    warn!(node = %node, addr = %addr, error = %e, "send failed");
                }
            }));
        }
        for send in sends {
            if let Err(e) = send.await {
                warn!(error = %e, "send task failed");
            }
        }
    }

    async fn deliver_local(&self, envelope: Envelope) -> Option<Envelope> {
        let source = envelope.source;
        match envelope.body {
            Body::Data(data) => {
                let name = data.name.clone();
                let delivered = self.plugins.dispatch_data(data).await;
                trace!(data = %name, source = %source, delivered, "data delivered");
                None
            }
            Body::RpcCall(call) => {
                let header = RpcCall {
                    correlation_id: call.correlation_id,
                    service: call.service.clone(),
                    caller: call.caller,
                    payload: Payload::new(),
                };
                let reply = match self.plugins.dispatch_call(call).await {
                    Ok(payload) => RpcReply::ok(&header, payload),
                    Err(e) => {
                        debug!(service = %header.service, caller = %header.caller, error = %e, "call failed");
                        RpcReply::failed(&header, &e)
                    }
                };
                Some(Envelope::rpc_reply(reply))
            }
            Body::RpcReply(reply) => {
                self.pending.complete(reply);
                None
            }
            Body::System(msg) => self.handle_system(source, msg).await,
        }
    }

    async fn handle_system(&self, source: NodeId, msg: SystemMessage) -> Option<Envelope> {
        match msg {
            SystemMessage::Register(registration) => {
                if self.is_center() {
                    self.accept_registration(registration);
                } else {
                    debug!(node = %registration.node, "ignoring registration on common node");
                }
                None
            }
            SystemMessage::Heartbeat {
                index,
                sent_at_micros,
            } => {
                self.last_probe_at.store(now_micros(), Ordering::Release);
                let ack = SystemMessage::HeartbeatAck {
                    index,
                    sent_at_micros,
                    cpu_usage: usage::cpu_usage(),
                    mem_usage: usage::mem_usage(),
                };
                Some(Envelope::system(ack).to(source))
            }
            SystemMessage::HeartbeatAck {
                index,
                sent_at_micros,
                cpu_usage,
                mem_usage,
            } => {
                if let Some(monitor) = &self.health {
                    monitor.on_heartbeat_ack(
                        source,
                        index,
                        sent_at_micros,
                        cpu_usage,
                        mem_usage,
                        now_micros(),
                    );
                }
                None
            }
            SystemMessage::SubscriptionChange(change) => {
                if self.is_center() {
                    self.apply_change(&change);
                }
                None
            }
            SystemMessage::Snapshot(snapshot) => {
                if !self.is_center() {
                    let _guard = self.subscription_guard.lock().await;
                    self.tables.replace(&snapshot);
                    self.directory.merge(&snapshot.directory);
                    self.reassert_local_subscriptions();
                    debug!(
                        data = snapshot.data.len(),
                        services = snapshot.services.len(),
                        nodes = snapshot.directory.len(),
                        "subscription snapshot applied"
                    );
                }
                None
            }
        }
    }

    fn accept_registration(&self, registration: Registration) {
        let node = registration.node;
        self.directory.insert(node, registration.listen_addr.clone());
        if let Some(monitor) = &self.health {
            monitor.register(node, &registration.name);
        }
        // Forget whatever a previous incarnation subscribed to.
        self.tables.remove_node(node);
        for event in NODE_SYSTEM_EVENTS {
            self.tables.add(TableKind::System, event, node);
        }
        for name in &registration.data {
            self.tables.add(TableKind::Data, name, node);
        }
        for name in &registration.services {
            self.tables.add(TableKind::Service, name, node);
        }
        info!(
            node = %node,
            name = %registration.name,
            addr = %registration.listen_addr,
            data = registration.data.len(),
            services = registration.services.len(),
            "node registered"
        );
    }

    fn apply_change(&self, change: &SubscriptionChange) {
        let changed = if change.subscribed {
            self.tables.add(change.table, &change.name, change.node)
        } else {
            self.tables.remove(change.table, &change.name, change.node)
        };
        debug!(
            node = %change.node,
            table = ?change.table,
            name = %change.name,
            subscribed = change.subscribed,
            changed,
            "subscription change applied"
        );
    }

    fn reassert_local_subscriptions(&self) {
        let local = self.local_id();
        for kind in [TableKind::Data, TableKind::Service] {
            for name in self.plugins.subscriptions(kind) {
                self.tables.add(kind, &name, local);
            }
        }
    }

    async fn notify_center(&self, table: TableKind, name: &str, subscribed: bool) {
        if self.is_center() {
            return;
        }
        let change = SubscriptionChange {
            node: self.local_id(),
            table,
            name: name.to_string(),
            subscribed,
        };
        self.handle(Envelope::system(SystemMessage::SubscriptionChange(change)).to(self.center_id))
            .await;
    }

    /// Records that `plugin` subscribes to `name`.
    pub async fn subscribe(
        &self,
        plugin: &str,
        kind: TableKind,
        name: &str,
    ) -> std::result::Result<(), RpcError> {
        let failed = || RpcError::SubscribeFailed {
            plugin: plugin.to_string(),
            name: name.to_string(),
        };
        if kind == TableKind::System {
            return Err(failed());
        }
        let binding = self.plugins.binding(plugin).ok_or_else(failed)?;
        let _guard = self.subscription_guard.lock().await;
        binding.add_subscription(kind, name);
        if self.tables.add(kind, name, self.local_id()) {
            self.notify_center(kind, name, true).await;
        }
        debug!(plugin, table = ?kind, name, "subscribed");
        Ok(())
    }

    /// Removes `plugin`'s subscription to `name`. The node stays subscribed
    /// while another local plugin still wants `name`.
    pub async fn unsubscribe(
        &self,
        plugin: &str,
        kind: TableKind,
        name: &str,
    ) -> std::result::Result<(), RpcError> {
        let failed = || RpcError::UnsubscribeFailed {
            plugin: plugin.to_string(),
            name: name.to_string(),
        };
        let binding = self.plugins.binding(plugin).ok_or_else(failed)?;
        let _guard = self.subscription_guard.lock().await;
        if !binding.remove_subscription(kind, name) {
            return Err(failed());
        }
        self.release_locked(kind, name).await;
        debug!(plugin, table = ?kind, name, "unsubscribed");
        Ok(())
    }

    async fn release(&self, kind: TableKind, name: &str) {
        let _guard = self.subscription_guard.lock().await;
        self.release_locked(kind, name).await;
    }

    /// Drops the local table entry once no plugin wants `name`. The caller
    /// holds `subscription_guard`.
    async fn release_locked(&self, kind: TableKind, name: &str) {
        if self.plugins.any_subscribed(kind, name) {
            return;
        }
        if self.tables.remove(kind, name, self.local_id()) {
            self.notify_center(kind, name, false).await;
        }
    }

    async fn release_binding(&self, binding: &PluginBinding) {
        for name in binding.subscribed_data() {
            self.release(TableKind::Data, &name).await;
        }
        for name in binding.subscribed_services() {
            self.release(TableKind::Service, &name).await;
        }
    }

    /// Publishes data to every subscriber.
    pub async fn publish_data(&self, data: DataMessage, mode: DispatchMode) -> Result<()> {
        self.classify(Envelope::data(data, mode)).await
    }

    /// Routes a caller-built envelope, push list included.
    pub async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.classify(envelope).await
    }

    /// Calls `service` on one provider and waits for the reply.
    ///
    /// A local provider is preferred; otherwise the lowest provider id is
    /// chosen. `timeout` defaults to the configured RPC timeout.
    pub async fn invoke(
        &self,
        service: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> std::result::Result<Payload, RpcError> {
        let local = self.local_id();
        let providers = self.tables.subscribers(TableKind::Service, service);
        let provider = if providers.contains(&local) {
            Some(local)
        } else {
            providers.iter().next().copied()
        };
        let Some(provider) = provider else {
            return Err(RpcError::ServiceNotExist {
                service: service.to_string(),
            });
        };

        let timeout = timeout.unwrap_or(self.config.rpc_timeout);
        let (correlation_id, reply) = self.pending.register();
        let call = RpcCall {
            correlation_id,
            service: service.to_string(),
            caller: local,
            payload,
        };
        debug!(service, correlation_id, provider = %provider, "invoking");

        if let Err(e) = self
            .classify(Envelope::rpc_call(call, DispatchMode::Unordered).to(provider))
            .await
        {
            self.pending.cancel(correlation_id);
            return Err(RpcError::RpcFailed {
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(RpcError::RpcFailed {
                reason: "reply channel closed".to_string(),
            }),
            Err(_) => {
                self.pending.cancel(correlation_id);
                warn!(service, correlation_id, timeout_ms = timeout.as_millis() as u64, "call timed out");
                Err(RpcError::Timeout {
                    service: service.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Announces this node to the center with its current subscriptions.
    pub async fn register_with_center(&self) {
        if self.is_center() {
            return;
        }
        let registration = Registration {
            node: self.local_id(),
            name: self.config.name.clone(),
            listen_addr: self.config.advertise_addr.clone(),
            data: self.plugins.subscriptions(TableKind::Data).into_iter().collect(),
            services: self.plugins.subscriptions(TableKind::Service).into_iter().collect(),
        };
        self.last_probe_at.store(now_micros(), Ordering::Release);
        info!(center = %self.center_id, "registering with center");
        self.handle(Envelope::system(SystemMessage::Register(registration)).to(self.center_id))
            .await;
    }

    /// Re-registers if no probe has arrived for `silence`. Returns true if a
    /// registration was sent.
    pub async fn reregister_if_silent(&self, silence: Duration) -> bool {
        let last = self.last_probe_at.load(Ordering::Acquire);
        if now_micros().saturating_sub(last) < silence.as_micros() as i64 {
            return false;
        }
        warn!(silent_ms = silence.as_millis() as u64, "no heartbeat from center, re-registering");
        self.register_with_center().await;
        true
    }

    /// One health monitor step: evaluate, probe, maybe snapshot.
    pub async fn health_tick(&self) {
        let Some(monitor) = &self.health else {
            return;
        };
        let plan = monitor.tick(&self.tables);

        for transition in plan.transitions.iter().filter(|t| t.to == NodeState::Lost) {
            if let Some(addr) = self.directory.get(transition.node) {
                self.pool.remove_peer(&addr).await;
            }
        }

        let probe = SystemMessage::Heartbeat {
            index: plan.probe_index,
            sent_at_micros: plan.probe_sent_at,
        };
        self.handle(Envelope::system(probe)).await;

        if plan.send_snapshot {
            self.broadcast_snapshot().await;
        }
    }

    /// Sends the full tables and directory to every registered node.
    pub async fn broadcast_snapshot(&self) {
        let mut snapshot = self.tables.snapshot();
        snapshot.directory = self.directory.all();
        debug!(generation = self.tables.generation(), "broadcasting subscription snapshot");
        self.handle(Envelope::system(SystemMessage::Snapshot(snapshot))).await;
    }

    /// Binds and starts a plugin.
    pub async fn load_plugin(
        &self,
        name: &str,
        plugin: Arc<dyn Plugin>,
        params: BTreeMap<String, String>,
    ) -> Result<()> {
        let binding = self.plugins.bind(name, plugin)?;
        let ctx = PluginContext {
            name: name.to_string(),
            params,
            bus: BusHandle::new(self.self_ref.clone(), name),
        };
        if !self.plugins.start(&binding, ctx).await {
            self.plugins.discard(name);
            self.release_binding(&binding).await;
            return Err(BusError::PluginStartFailed {
                name: name.to_string(),
            });
        }
        info!(plugin = name, "plugin loaded");
        Ok(())
    }

    /// Disables, drains, stops and unbinds a plugin, then drops its
    /// subscriptions.
    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let binding = self.plugins.unload(name).await?;
        self.release_binding(&binding).await;
        Ok(())
    }

    /// Toggles dispatch to a plugin.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.plugins.set_enabled(name, enabled)
    }

    /// Stops both channels (draining queued work) and unloads every plugin.
    pub async fn stop(&self) {
        self.ordered.stop().await;
        self.unordered.stop().await;
        for name in self.plugins.names() {
            if let Err(e) = self.unload_plugin(&name).await {
                warn!(plugin = %name, error = %e, "unload failed");
            }
        }
    }
}

/// Feeds frames from the connection pool into a router.
pub struct InboundFrames {
    router: Weak<Router>,
}

impl InboundFrames {
    /// Handler for `router`.
    pub fn new(router: &Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            router: Arc::downgrade(router),
        })
    }
}

#[async_trait]
impl FrameHandler for InboundFrames {
    async fn on_frame(&self, peer: &str, frame: Frame) {
        let Some(router) = self.router.upgrade() else {
            return;
        };
        match frame.tag() {
            FrameTag::Bus => match Envelope::decode(&frame.payload) {
                Ok(envelope) if envelope.source.is_unstamped() => {
                    warn!(peer, "dropping unstamped envelope from peer");
                }
                Ok(envelope) => {
                    if let Err(e) = router.classify(envelope).await {
                        warn!(peer, error = %e, "inbound envelope rejected");
                    }
                }
                Err(e) => warn!(peer, error = %e, "undecodable envelope"),
            },
            FrameTag::Log => {
                let line = String::from_utf8_lossy(&frame.payload);
                info!(target: "nodebus::remote", peer, "{}", line.trim_end());
            }
        }
    }

    fn on_error(&self, peer: &str, error: &TransportError) {
        debug!(peer, error = %error, "peer connection dropped");
    }
}
