//! Plugins bundled with the node binary.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::envelope::{DataMessage, Payload, RpcCall};
use crate::error::RpcError;
use crate::plugin::{BusHandle, Plugin, PluginContext, PluginRegistry};

/// Library name of [`EchoService`].
pub const ECHO_LIBRARY: &str = "echo";
/// Library name of [`DataLogger`].
pub const LOGGER_LIBRARY: &str = "data-logger";

/// Adds the bundled plugins to `registry`.
pub fn register_builtins(registry: &mut PluginRegistry) {
    registry.register(ECHO_LIBRARY, || Arc::new(EchoService::default()) as Arc<dyn Plugin>);
    registry.register(LOGGER_LIBRARY, || Arc::new(DataLogger::default()) as Arc<dyn Plugin>);
}

/// Provides one service that returns the call payload unchanged.
///
/// Parameters: `service` (default `"echo"`).
#[derive(Default)]
pub struct EchoService {
    calls: AtomicU64,
}

impl EchoService {
    /// Calls answered so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for EchoService {
    async fn start(&self, ctx: PluginContext) -> bool {
        let service = ctx.param("service").unwrap_or("echo");
        match ctx.bus.subscribe_service(service).await {
            Ok(()) => {
                info!(plugin = %ctx.name, service, "echo service ready");
                true
            }
            Err(e) => {
                warn!(plugin = %ctx.name, service, error = %e, "echo service could not register");
                false
            }
        }
    }

    async fn invoke(&self, call: &RpcCall) -> Result<Payload, RpcError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(call.payload.clone())
    }
}

/// Logs every data message on a configured set of names.
///
/// Parameters: `topics`, a comma separated list of data names.
#[derive(Default)]
pub struct DataLogger {
    bus: Mutex<Option<BusHandle>>,
    received: AtomicU64,
}

impl DataLogger {
    /// Messages logged so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Splits a comma separated parameter, ignoring blanks.
fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

#[async_trait]
impl Plugin for DataLogger {
    async fn start(&self, ctx: PluginContext) -> bool {
        let topics = split_list(ctx.param("topics").unwrap_or(""));
        if topics.is_empty() {
            warn!(plugin = %ctx.name, "data logger has no topics configured");
        }
        for topic in topics {
            if let Err(e) = ctx.bus.subscribe_data(topic).await {
                warn!(plugin = %ctx.name, topic, error = %e, "subscription failed");
                return false;
            }
        }
        *self.bus.lock() = Some(ctx.bus);
        true
    }

    async fn stop(&self) {
        self.bus.lock().take();
    }

    async fn on_data(&self, data: &DataMessage) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let local = self
            .bus
            .lock()
            .as_ref()
            .and_then(BusHandle::local_id)
            .map(|id| id.as_u32())
            .unwrap_or(0);
        info!(
            local,
            data = %data.name,
            blocks = data.payload.blocks.len(),
            bytes = data.payload.block_bytes(),
            attachments = data.payload.attachments.len(),
            "data received"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use std::collections::BTreeMap;

    fn detached_ctx(name: &str, params: &[(&str, &str)]) -> PluginContext {
        PluginContext {
            name: name.into(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            bus: BusHandle::detached(name),
        }
    }

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let echo = EchoService::default();
        let call = RpcCall {
            correlation_id: 9,
            service: "echo".into(),
            caller: NodeId::new(2),
            payload: Payload::new().with_block("msg", b"hi".to_vec()),
        };
        let out = echo.invoke(&call).await.unwrap();
        assert_eq!(out.get("msg"), Some(&b"hi"[..]));
        assert_eq!(echo.calls(), 1);
    }

    #[tokio::test]
    async fn test_start_without_bus_fails() {
        let echo = EchoService::default();
        assert!(!echo.start(detached_ctx("echo", &[])).await);

        let logger = DataLogger::default();
        assert!(!logger.start(detached_ctx("log", &[("topics", "a,b")])).await);
        // No topics means nothing to subscribe to.
        assert!(DataLogger::default().start(detached_ctx("log", &[])).await);
    }

    #[tokio::test]
    async fn test_logger_counts() {
        let logger = DataLogger::default();
        logger.on_data(&DataMessage::new("a", Payload::new())).await;
        assert_eq!(logger.received(), 1);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_registered() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.contains(ECHO_LIBRARY));
        assert!(registry.contains(LOGGER_LIBRARY));
    }
}
