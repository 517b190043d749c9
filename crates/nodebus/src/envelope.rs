//! Envelopes: the unit of bus traffic.
//!
//! An envelope carries one of four bodies (data, RPC call, RPC reply,
//! system control), a dispatch mode and a destination set. Envelopes are
//! serialized with bincode and travel inside [`FrameTag::Bus`] frames.
//!
//! [`FrameTag::Bus`]: nodebus_transport::FrameTag::Bus

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{BusError, Result, RpcError};
use crate::subscription::{SubscriptionSnapshot, TableKind};
use crate::types::NodeId;

/// A file shipped alongside an envelope.
///
/// Local delivery hands the path to plugins as-is; remote delivery reads the
/// file into the payload's byte blocks under `tag` before transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Block name the file content is stored under when inlined.
    pub tag: String,
    /// Location of the file on the sending node.
    pub path: PathBuf,
    /// Remove the file once the envelope has been sent to every peer.
    pub delete_after_send: bool,
}

/// Opaque envelope content: named byte blocks plus file attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Byte blocks keyed by tag.
    pub blocks: BTreeMap<String, Vec<u8>>,
    /// Files referenced by path.
    pub attachments: Vec<Attachment>,
}

impl Payload {
    /// Empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_block(mut self, tag: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(tag, bytes);
        self
    }

    /// Stores a byte block, replacing any previous block with the same tag.
    pub fn insert(&mut self, tag: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blocks.insert(tag.into(), bytes.into());
    }

    /// Looks up a byte block.
    pub fn get(&self, tag: &str) -> Option<&[u8]> {
        self.blocks.get(tag).map(Vec::as_slice)
    }

    /// References a file to ship with the envelope.
    pub fn attach(&mut self, tag: impl Into<String>, path: impl AsRef<Path>, delete_after_send: bool) {
        self.attachments.push(Attachment {
            tag: tag.into(),
            path: path.as_ref().to_path_buf(),
            delete_after_send,
        });
    }

    /// True when there are neither blocks nor attachments.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.attachments.is_empty()
    }

    /// Total size of all byte blocks.
    pub fn block_bytes(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    /// Reads every attachment into a byte block and clears the attachment
    /// list. Returns the paths flagged delete-after-send; the caller removes
    /// them once transmission is finished.
    pub async fn inline_attachments(&mut self) -> std::io::Result<Vec<PathBuf>> {
        let mut to_delete = Vec::new();
        for attachment in std::mem::take(&mut self.attachments) {
            let bytes = tokio::fs::read(&attachment.path).await?;
            self.blocks.insert(attachment.tag, bytes);
            if attachment.delete_after_send {
                to_delete.push(attachment.path);
            }
        }
        Ok(to_delete)
    }
}

/// Published data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Data name subscribers register for.
    pub name: String,
    /// Content.
    pub payload: Payload,
}

impl DataMessage {
    /// Creates a data message.
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A remote procedure call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    /// Unique per calling node; echoed in the reply.
    pub correlation_id: u64,
    /// Service name providers register for.
    pub service: String,
    /// Node waiting for the reply.
    pub caller: NodeId,
    /// Call arguments.
    pub payload: Payload,
}

/// Outcome code carried by a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    /// Success; the payload holds the result.
    Ok,
    /// The receiving node has no enabled provider for the service.
    ServiceNotExist,
    /// The provider failed.
    RpcFailed,
}

/// Reply to an [`RpcCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcReply {
    /// Copied from the call.
    pub correlation_id: u64,
    /// Copied from the call.
    pub service: String,
    /// Copied from the call; the only destination of the reply.
    pub caller: NodeId,
    /// Outcome.
    pub status: RpcStatus,
    /// Failure description when `status` is not `Ok`.
    pub message: String,
    /// Result payload.
    pub payload: Payload,
}

impl RpcReply {
    /// Successful reply to `call`.
    pub fn ok(call: &RpcCall, payload: Payload) -> Self {
        Self {
            correlation_id: call.correlation_id,
            service: call.service.clone(),
            caller: call.caller,
            status: RpcStatus::Ok,
            message: String::new(),
            payload,
        }
    }

    /// Failed reply to `call`.
    pub fn failed(call: &RpcCall, error: &RpcError) -> Self {
        let status = match error {
            RpcError::ServiceNotExist { .. } => RpcStatus::ServiceNotExist,
            _ => RpcStatus::RpcFailed,
        };
        Self {
            correlation_id: call.correlation_id,
            service: call.service.clone(),
            caller: call.caller,
            status,
            message: error.to_string(),
            payload: Payload::new(),
        }
    }

    /// Converts the reply into the caller-facing result.
    pub fn into_result(self) -> std::result::Result<Payload, RpcError> {
        match self.status {
            RpcStatus::Ok => Ok(self.payload),
            RpcStatus::ServiceNotExist => Err(RpcError::ServiceNotExist {
                service: self.service,
            }),
            RpcStatus::RpcFailed => Err(RpcError::RpcFailed {
                reason: self.message,
            }),
        }
    }
}

/// Sent by a common node to announce itself to the center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Registering node.
    pub node: NodeId,
    /// Human readable name.
    pub name: String,
    /// Address other nodes should connect to.
    pub listen_addr: String,
    /// Data names the node's plugins subscribe to.
    pub data: Vec<String>,
    /// Services the node's plugins provide.
    pub services: Vec<String>,
}

/// A single subscription table mutation, reported to the center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    /// Node whose subscription changed.
    pub node: NodeId,
    /// Affected table.
    pub table: TableKind,
    /// Data, service or system event name.
    pub name: String,
    /// True for subscribe, false for unsubscribe.
    pub subscribed: bool,
}

/// Bus-internal control traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemMessage {
    /// Node registration, common node to center.
    Register(Registration),
    /// Heartbeat probe, center to all registered nodes.
    Heartbeat {
        /// Monotonically increasing probe number.
        index: u64,
        /// Center clock when the probe was sent, microseconds since epoch.
        sent_at_micros: i64,
    },
    /// Heartbeat response, node to center.
    HeartbeatAck {
        /// Index of the probe being answered.
        index: u64,
        /// Timestamp copied from the probe.
        sent_at_micros: i64,
        /// Responder CPU load, 0.0 to 1.0.
        cpu_usage: f32,
        /// Responder memory usage, 0.0 to 1.0.
        mem_usage: f32,
    },
    /// Subscription mutation, node to center.
    SubscriptionChange(SubscriptionChange),
    /// Full subscription tables and node directory, center to all nodes.
    Snapshot(SubscriptionSnapshot),
}

impl SystemMessage {
    /// Event kind name; the key used in the system subscription table.
    pub fn event_kind(&self) -> &'static str {
        match self {
            SystemMessage::Register(_) => "register",
            SystemMessage::Heartbeat { .. } => "heartbeat",
            SystemMessage::HeartbeatAck { .. } => "heartbeat-ack",
            SystemMessage::SubscriptionChange(_) => "subscription-change",
            SystemMessage::Snapshot(_) => "table-sync",
        }
    }
}

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Published data.
    Data,
    /// RPC request.
    RpcCall,
    /// RPC response.
    RpcReply,
    /// Bus control traffic.
    System,
}

/// How the receiving side schedules an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatchMode {
    /// Processed inline on the calling or receiving task.
    Sync,
    /// Queued on the single-worker channel; processed in arrival order.
    Ordered,
    /// Queued on the multi-worker channel; no ordering guarantee.
    Unordered,
}

/// Envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Published data.
    Data(DataMessage),
    /// RPC request.
    RpcCall(RpcCall),
    /// RPC response.
    RpcReply(RpcReply),
    /// Control traffic.
    System(SystemMessage),
}

/// One routed unit of bus traffic.
///
/// `destinations` starts as the sender's push list. Only the router mutates
/// it: the sender gives up the envelope (by value) when handing it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Originating node; zero until stamped by the first router.
    pub source: NodeId,
    /// Scheduling mode on the receiving side.
    pub mode: DispatchMode,
    /// Explicit push list, augmented by routing.
    pub destinations: BTreeSet<NodeId>,
    /// Content.
    pub body: Body,
}

impl Envelope {
    fn with_body(mode: DispatchMode, body: Body) -> Self {
        Self {
            source: NodeId::UNSTAMPED,
            mode,
            destinations: BTreeSet::new(),
            body,
        }
    }

    /// Data envelope.
    pub fn data(data: DataMessage, mode: DispatchMode) -> Self {
        Self::with_body(mode, Body::Data(data))
    }

    /// RPC call envelope.
    pub fn rpc_call(call: RpcCall, mode: DispatchMode) -> Self {
        Self::with_body(mode, Body::RpcCall(call))
    }

    /// RPC reply envelope, addressed to the caller and processed inline.
    pub fn rpc_reply(reply: RpcReply) -> Self {
        let caller = reply.caller;
        Self::with_body(DispatchMode::Sync, Body::RpcReply(reply)).to(caller)
    }

    /// System envelope; always processed inline.
    pub fn system(msg: SystemMessage) -> Self {
        Self::with_body(DispatchMode::Sync, Body::System(msg))
    }

    /// Adds a node to the push list.
    pub fn to(mut self, node: NodeId) -> Self {
        self.destinations.insert(node);
        self
    }

    /// Adds several nodes to the push list.
    pub fn to_all(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.destinations.extend(nodes);
        self
    }

    /// Envelope kind derived from the body.
    pub fn kind(&self) -> EnvelopeKind {
        match &self.body {
            Body::Data(_) => EnvelopeKind::Data,
            Body::RpcCall(_) => EnvelopeKind::RpcCall,
            Body::RpcReply(_) => EnvelopeKind::RpcReply,
            Body::System(_) => EnvelopeKind::System,
        }
    }

    /// Routing key: data name, service name, correlation id or system
    /// event kind.
    pub fn key(&self) -> String {
        match &self.body {
            Body::Data(d) => d.name.clone(),
            Body::RpcCall(c) => c.service.clone(),
            Body::RpcReply(r) => r.correlation_id.to_string(),
            Body::System(s) => s.event_kind().to_string(),
        }
    }

    /// Mutable access to the payload, if the body has one.
    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match &mut self.body {
            Body::Data(d) => Some(&mut d.payload),
            Body::RpcCall(c) => Some(&mut c.payload),
            Body::RpcReply(r) => Some(&mut r.payload),
            Body::System(_) => None,
        }
    }

    /// Serialize with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Deserialize with bincode.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_by_kind() {
        let data = Envelope::data(DataMessage::new("temps", Payload::new()), DispatchMode::Ordered);
        assert_eq!(data.kind(), EnvelopeKind::Data);
        assert_eq!(data.key(), "temps");

        let call = RpcCall {
            correlation_id: 42,
            service: "resize".into(),
            caller: NodeId::new(3),
            payload: Payload::new(),
        };
        let env = Envelope::rpc_call(call.clone(), DispatchMode::Unordered);
        assert_eq!(env.key(), "resize");

        let reply = Envelope::rpc_reply(RpcReply::ok(&call, Payload::new()));
        assert_eq!(reply.kind(), EnvelopeKind::RpcReply);
        assert_eq!(reply.key(), "42");
        assert_eq!(reply.mode, DispatchMode::Sync);
        assert_eq!(reply.destinations, BTreeSet::from([NodeId::new(3)]));

        let probe = Envelope::system(SystemMessage::Heartbeat {
            index: 1,
            sent_at_micros: 0,
        });
        assert_eq!(probe.key(), "heartbeat");
        assert_eq!(probe.mode, DispatchMode::Sync);
    }

    #[test]
    fn test_encode_decode_preserves_envelope() {
        let mut payload = Payload::new().with_block("body", vec![1, 2, 3]);
        payload.attach("img", "/tmp/does-not-matter", true);
        let mut env = Envelope::data(DataMessage::new("frames", payload), DispatchMode::Unordered)
            .to_all([NodeId::new(2), NodeId::new(5)]);
        env.source = NodeId::new(1);

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            Envelope::decode(&[0xFF, 0xFF, 0xFF]),
            Err(BusError::Serialization(_))
        ));
    }

    #[test]
    fn test_reply_into_result() {
        let call = RpcCall {
            correlation_id: 7,
            service: "sum".into(),
            caller: NodeId::new(1),
            payload: Payload::new(),
        };
        let ok = RpcReply::ok(&call, Payload::new().with_block("r", b"10".to_vec()));
        assert_eq!(ok.into_result().unwrap().get("r"), Some(&b"10"[..]));

        let missing = RpcReply::failed(
            &call,
            &RpcError::ServiceNotExist {
                service: "sum".into(),
            },
        );
        assert_eq!(
            missing.into_result(),
            Err(RpcError::ServiceNotExist {
                service: "sum".into()
            })
        );

        let failed = RpcReply::failed(
            &call,
            &RpcError::RpcFailed {
                reason: "boom".into(),
            },
        );
        assert!(matches!(failed.into_result(), Err(RpcError::RpcFailed { .. })));
    }

    #[tokio::test]
    async fn test_inline_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.bin");
        let drop = dir.path().join("drop.bin");
        std::fs::write(&keep, b"kept").unwrap();
        std::fs::write(&drop, b"dropped").unwrap();

        let mut payload = Payload::new();
        payload.attach("a", &keep, false);
        payload.attach("b", &drop, true);

        let to_delete = payload.inline_attachments().await.unwrap();
        assert!(payload.attachments.is_empty());
        assert_eq!(payload.get("a"), Some(&b"kept"[..]));
        assert_eq!(payload.get("b"), Some(&b"dropped"[..]));
        assert_eq!(to_delete, vec![drop]);
    }
}
