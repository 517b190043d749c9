//! Ships formatted log lines to a remote endpoint as log frames.
//!
//! [`RemoteLogSink`] is a `tracing_subscriber` writer. Each event's formatted
//! line is handed to a bounded queue without blocking; a background task
//! sends the lines over one framed TCP connection, reconnecting after
//! failures. Lines are dropped (and counted) when the queue is full or the
//! endpoint is unreachable. The shipper never logs through `tracing` itself.

use nodebus_transport::tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
use nodebus_transport::{Frame, FrameTag};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::MakeWriter;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// `MakeWriter` that forwards each log line to the shipping task.
#[derive(Clone)]
pub struct RemoteLogSink {
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl RemoteLogSink {
    /// Starts the shipping task for `addr`. Must be called inside a Tokio
    /// runtime.
    pub fn spawn(
        addr: String,
        capacity: usize,
        config: TcpTransportConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(ship(addr, rx, TcpTransport::new(config), Arc::clone(&dropped)));
        (Self { tx, dropped }, task)
    }

    /// Lines lost to a full queue or a failed send.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn ship(
    addr: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
    transport: TcpTransport,
    dropped: Arc<AtomicU64>,
) {
    let mut conn: Option<TcpConnection> = None;
    while let Some(line) = rx.recv().await {
        if conn.is_none() {
            match transport.connect(&addr).await {
                Ok(c) => conn = Some(c),
                Err(_) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
        }
        let Ok(frame) = Frame::new(FrameTag::Log, line) else {
            dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        if let Some(c) = &conn {
            if c.send_frame(&frame).await.is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
                conn = None;
            }
        }
    }
}

/// Buffers one formatted event and queues it on drop.
pub struct LineWriter {
    buf: Vec<u8>,
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl io::Write for LineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.buf);
        if self.tx.try_send(line).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<'a> MakeWriter<'a> for RemoteLogSink {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            buf: Vec::new(),
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}
