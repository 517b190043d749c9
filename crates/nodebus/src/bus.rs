//! Node composition root.
//!
//! [`Bus::start`] wires the connection pool, router, plugins and timers
//! together for one node; [`Bus::shutdown`] takes them down in order:
//! timers, work channels (drained), plugins, connection pool.

use nodebus_transport::tcp::TcpTransportConfig;
use nodebus_transport::{ConnectionPool, PoolConfig};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::envelope::{DataMessage, DispatchMode, Payload};
use crate::error::{BusError, Result, RpcError};
use crate::health;
use crate::plugin::PluginRegistry;
use crate::router::{InboundFrames, Router};
use crate::types::{NodeId, NodeRole};

/// A running node.
pub struct Bus {
    router: Arc<Router>,
    pool: ConnectionPool,
    timers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Bus {
    /// Validates `config`, binds the listener, loads plugins and joins the
    /// bus. Fails fast on invalid configuration, an occupied listen port or
    /// an unknown plugin library.
    pub async fn start(config: NodeConfig, registry: &PluginRegistry) -> Result<Self> {
        config.validate()?;
        for descriptor in &config.plugins {
            if !registry.contains(&descriptor.library) {
                return Err(BusError::UnknownPlugin {
                    library: descriptor.library.clone(),
                });
            }
        }

        let pool = ConnectionPool::bind(
            &config.listen_addr,
            PoolConfig {
                tcp: TcpTransportConfig {
                    connect_timeout_ms: config.bus.connect_timeout_ms,
                    ..TcpTransportConfig::default()
                },
            },
        )
        .await?;
        let advertise = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| pool.local_addr().to_string());

        let router = match Router::new(config.router_config(advertise.clone()), pool.clone()) {
            Ok(router) => router,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };
        pool.start(InboundFrames::new(&router));
        info!(
            node = config.node_id,
            role = ?config.node_type,
            listen = %pool.local_addr(),
            advertise = %advertise,
            "node listening"
        );

        let bus = Self {
            router,
            pool,
            timers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        if let Err(e) = bus.load_plugins(&config, registry).await {
            bus.shutdown().await;
            return Err(e);
        }

        let interval = Duration::from_millis(config.health.interval_ms);
        let weak = Arc::downgrade(&bus.router);
        match config.node_type {
            NodeRole::Center => {
                bus.timers.lock().push(health::spawn_timer(weak, interval));
            }
            NodeRole::Common => {
                bus.router.register_with_center().await;
                let silence = interval * config.health.reregister_after;
                bus.timers
                    .lock()
                    .push(spawn_watchdog(weak, interval, silence));
            }
        }
        Ok(bus)
    }

    async fn load_plugins(&self, config: &NodeConfig, registry: &PluginRegistry) -> Result<()> {
        for descriptor in &config.plugins {
            let name = descriptor.binding_name();
            let plugin = registry
                .create(&descriptor.library)
                .ok_or_else(|| BusError::UnknownPlugin {
                    library: descriptor.library.clone(),
                })?;
            match self
                .router
                .load_plugin(name, plugin, descriptor.params.clone())
                .await
            {
                Ok(()) => {
                    if !descriptor.enabled {
                        self.router.set_plugin_enabled(name, false)?;
                    }
                }
                Err(BusError::PluginStartFailed { name }) => {
                    warn!(plugin = %name, library = %descriptor.library, "plugin refused to start, not loaded");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The node's router.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// This node's id.
    pub fn local_id(&self) -> NodeId {
        self.router.local_id()
    }

    /// Bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.pool.local_addr()
    }

    /// Publishes data from outside any plugin.
    pub async fn publish_data(&self, data: DataMessage, mode: DispatchMode) -> Result<()> {
        self.router.publish_data(data, mode).await
    }

    /// Calls a service from outside any plugin.
    pub async fn invoke(
        &self,
        service: &str,
        payload: Payload,
        timeout: Option<Duration>,
    ) -> std::result::Result<Payload, RpcError> {
        self.router.invoke(service, payload, timeout).await
    }

    /// Stops the node. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let timers: Vec<_> = std::mem::take(&mut *self.timers.lock());
        for timer in timers {
            timer.abort();
            let _ = timer.await;
        }
        self.router.stop().await;
        self.pool.close().await;
        info!(node = %self.local_id(), "node stopped");
    }
}

/// Re-registers a common node whenever the center has been silent for
/// `silence`.
fn spawn_watchdog(router: Weak<Router>, interval: Duration, silence: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(router) = router.upgrade() else {
                break;
            };
            router.reregister_if_silent(silence).await;
        }
        debug!("registration watchdog exiting");
    })
}
