//! Peer connection pool.
//!
//! The pool owns the listening socket and one [`TcpConnection`] per peer.
//! Inbound connections are accepted continuously; outbound connections are
//! opened lazily on the first send to a destination and cached by that
//! address. Every connection gets a read loop that hands complete frames to
//! the registered [`FrameHandler`]. Any read or write error tears the
//! connection down, removes its table entry and reports the peer address
//! through [`FrameHandler::on_error`]; the socket is never reused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::protocol::Frame;
use crate::tcp::{TcpConnection, TcpTransport, TcpTransportConfig};

/// Receiver of pool traffic.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Called on the connection's read task for every complete frame.
    async fn on_frame(&self, peer: &str, frame: Frame);

    /// Called once when a connection is torn down after an I/O error.
    fn on_error(&self, peer: &str, error: &TransportError);
}

/// Connection pool configuration.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Socket options and connect timeout.
    pub tcp: TcpTransportConfig,
}

/// Which side opened a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from the listener.
    Inbound,
    /// Opened by a local send.
    Outbound,
}

/// Pool statistics.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of live peer connections.
    pub peers: usize,
    /// Live connections accepted from the listener.
    pub inbound: usize,
    /// Live connections opened by sends.
    pub outbound: usize,
}

struct PeerEntry {
    conn: Arc<TcpConnection>,
    direction: Direction,
    reader: JoinHandle<()>,
}

struct PoolInner {
    transport: TcpTransport,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<String, PeerEntry>>,
    handler: OnceLock<Arc<dyn FrameHandler>>,
    listener: Mutex<Option<TcpListener>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Connection pool managing one framed connection per peer address.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Binds the listening socket. Fails immediately if the address is
    /// already bound. No connection is accepted until [`start`](Self::start).
    pub async fn bind(addr: &str, config: PoolConfig) -> Result<Self> {
        let transport = TcpTransport::new(config.tcp);
        let listener = transport.listen(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "connection pool listening");
        Ok(Self {
            inner: Arc::new(PoolInner {
                transport,
                local_addr,
                peers: RwLock::new(HashMap::new()),
                handler: OnceLock::new(),
                listener: Mutex::new(Some(listener)),
                acceptor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Installs the frame handler and starts accepting inbound connections.
    /// Calling it a second time has no effect.
    pub fn start(&self, handler: Arc<dyn FrameHandler>) {
        if self.inner.handler.set(handler).is_err() {
            warn!("connection pool already started");
            return;
        }
        let Some(listener) = self.inner.listener.lock().take() else {
            return;
        };
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let conn = match inner.transport.prepare(stream) {
                    Ok(conn) => Arc::new(conn),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to set up inbound connection");
                        continue;
                    }
                };
                debug!(peer = %peer, "accepted connection");
                PoolInner::register(&inner, peer.to_string(), conn, Direction::Inbound).await;
            }
        });
        *self.inner.acceptor.lock() = Some(handle);
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Sends a frame to `addr`, opening and caching a connection if needed.
    ///
    /// A write failure drops the connection from the table and is returned
    /// to the caller; the next send opens a fresh connection.
    pub async fn send(&self, addr: &str, frame: &Frame) -> Result<()> {
        let conn = self.connection_for(addr).await?;
        if let Err(e) = conn.send_frame(frame).await {
            self.inner.drop_peer(addr, &conn, &e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn connection_for(&self, addr: &str) -> Result<Arc<TcpConnection>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::PoolClosed);
        }
        if let Some(entry) = self.inner.peers.read().await.get(addr) {
            return Ok(entry.conn.clone());
        }
        let conn = Arc::new(self.inner.transport.connect(addr).await?);
        Ok(PoolInner::register(&self.inner, addr.to_string(), conn, Direction::Outbound).await)
    }

    /// Whether a live connection is cached for `addr`.
    pub async fn is_connected(&self, addr: &str) -> bool {
        self.inner.peers.read().await.contains_key(addr)
    }

    /// Drops the connection to `addr`, if any. Returns true if one existed.
    pub async fn remove_peer(&self, addr: &str) -> bool {
        match self.inner.peers.write().await.remove(addr) {
            Some(entry) => {
                entry.reader.abort();
                true
            }
            None => false,
        }
    }

    /// Get pool statistics.
    pub async fn stats(&self) -> PoolStats {
        let peers = self.inner.peers.read().await;
        let inbound = peers
            .values()
            .filter(|e| e.direction == Direction::Inbound)
            .count();
        PoolStats {
            peers: peers.len(),
            inbound,
            outbound: peers.len() - inbound,
        }
    }

    /// Stops accepting, drops every live socket and refuses further sends.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
        }
        self.inner.listener.lock().take();
        let drained: Vec<(String, PeerEntry)> = self.inner.peers.write().await.drain().collect();
        for (peer, entry) in drained {
            entry.reader.abort();
            debug!(peer = %peer, "closed connection");
        }
        info!(addr = %self.inner.local_addr, "connection pool closed");
    }
}

impl PoolInner {
    /// Inserts a connection and spawns its read loop. If another task won
    /// the race for the same key, the existing connection is kept.
    async fn register(
        inner: &Arc<PoolInner>,
        key: String,
        conn: Arc<TcpConnection>,
        direction: Direction,
    ) -> Arc<TcpConnection> {
        let mut peers = inner.peers.write().await;
        if let Some(existing) = peers.get(&key) {
            return existing.conn.clone();
        }
        let reader = tokio::spawn(Self::read_loop(inner.clone(), key.clone(), conn.clone()));
        peers.insert(
            key,
            PeerEntry {
                conn: conn.clone(),
                direction,
                reader,
            },
        );
        conn
    }

    async fn read_loop(inner: Arc<PoolInner>, peer: String, conn: Arc<TcpConnection>) {
        loop {
            match conn.recv_frame().await {
                Ok(frame) => {
                    if let Some(handler) = inner.handler.get() {
                        handler.on_frame(&peer, frame).await;
                    }
                }
                Err(e) => {
                    inner.drop_peer(&peer, &conn, &e).await;
                    break;
                }
            }
        }
    }

    /// Removes `conn` from the table if it is still the entry for `peer`,
    /// then reports the error.
    async fn drop_peer(&self, peer: &str, conn: &Arc<TcpConnection>, error: &TransportError) {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(peer) {
                Some(entry) if Arc::ptr_eq(&entry.conn, conn) => peers.remove(peer),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        if matches!(error, TransportError::ConnectionReset) {
            debug!(peer = peer, "peer closed connection");
        } else {
            warn!(peer = peer, error = %error, "connection dropped");
        }
        if let Some(handler) = self.handler.get() {
            handler.on_error(peer, error);
        }
    }
}
