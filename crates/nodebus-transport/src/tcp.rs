//! Framed TCP connections: one socket per peer, whole frames in and out.

use std::io::ErrorKind;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE};

/// Socket options for outbound and accepted connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Upper bound on an outbound connect.
    pub connect_timeout_ms: u64,
    /// Sets `TCP_NODELAY`; bus frames are small and latency bound.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport that opens and accepts framed connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Transport applying `config` to every socket.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Dials `addr`, giving up after `connect_timeout_ms`.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let limit = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = match tokio::time::timeout(limit, tokio::net::TcpStream::connect(addr)).await {
            Ok(connected) => connected.map_err(TransportError::IoError)?,
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        };
        tracing::debug!(addr, "dialed peer");
        self.prepare(stream)
    }

    /// Binds a listener. An occupied address is reported as
    /// [`TransportError::AddrInUse`].
    pub async fn listen(&self, addr: &str) -> Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == ErrorKind::AddrInUse {
                TransportError::AddrInUse {
                    addr: addr.to_string(),
                }
            } else {
                TransportError::IoError(e)
            }
        })
    }

    /// Waits for the next inbound connection on `listener`.
    pub async fn accept(&self, listener: &tokio::net::TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
        self.prepare(stream)
    }

    /// Applies the socket options and wraps `stream`.
    pub fn prepare(&self, stream: tokio::net::TcpStream) -> Result<TcpConnection> {
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        TcpConnection::from_stream(stream)
    }
}

/// One framed socket, split so a reader and writers can work at once.
///
/// Reads and writes are each serialized by their own lock, so a frame is
/// always written and read as one unit.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream) -> Result<Self> {
        let addr_of = |addr: std::io::Result<std::net::SocketAddr>| {
            addr.map(|a| a.to_string()).unwrap_or_default()
        };
        let peer_addr = addr_of(stream.peer_addr());
        let local_addr = addr_of(stream.local_addr());
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
        })
    }

    /// Writes one whole frame; concurrent senders queue on the write half.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut write = self.write.lock().await;
        write.write_all(&encoded).await.map_err(map_io)?;
        write.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Reads the next frame: a full header, then exactly the announced
    /// payload.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        read.read_exact(&mut header_buf).await.map_err(map_io)?;
        let header = FrameHeader::decode(&header_buf)?;
        let mut payload = vec![0u8; header.payload_length as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await.map_err(map_io)?;
        }
        Ok(Frame {
            header,
            payload: payload.into(),
        })
    }

    /// Remote address, empty if the socket could not report it.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Local address, empty if the socket could not report it.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

fn map_io(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            TransportError::ConnectionReset
        }
        _ => TransportError::IoError(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameTag;

    #[tokio::test]
    async fn test_send_recv_frame() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let conn = transport.accept(&listener).await.unwrap();
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.tag(), FrameTag::Bus);
            assert_eq!(frame.payload.as_ref(), b"ping");
            let response = Frame::new(FrameTag::Bus, b"pong".to_vec()).unwrap();
            conn.send_frame(&response).await.unwrap();
        });

        let client_transport = TcpTransport::new(TcpTransportConfig::default());
        let conn = client_transport.connect(&addr).await.unwrap();
        let frame = Frame::new(FrameTag::Bus, b"ping".to_vec()).unwrap();
        conn.send_frame(&frame).await.unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert_eq!(response.payload.as_ref(), b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_do_not_interleave() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = std::sync::Arc::new(transport.connect(&addr).await.unwrap());
        let server = transport.accept(&listener).await.unwrap();

        let mut writers = Vec::new();
        for i in 0..8u8 {
            let client = client.clone();
            writers.push(tokio::spawn(async move {
                let frame = Frame::new(FrameTag::Bus, vec![i; 64 * 1024]).unwrap();
                client.send_frame(&frame).await.unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            let frame = server.recv_frame().await.unwrap();
            let first = frame.payload[0];
            assert!(frame.payload.iter().all(|b| *b == first));
            seen.push(first);
        }
        for w in writers {
            w.await.unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_listen_on_bound_port_fails_fast() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let first = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap().to_string();
        match transport.listen(&addr).await {
            Err(TransportError::AddrInUse { addr: reported }) => assert_eq!(reported, addr),
            other => panic!("expected AddrInUse, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_peer_close_reports_reset() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = transport.connect(&addr).await.unwrap();
        let server = transport.accept(&listener).await.unwrap();
        drop(client);

        assert!(matches!(server.recv_frame().await, Err(TransportError::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let transport = TcpTransport::new(TcpTransportConfig {
            connect_timeout_ms: 500,
            nodelay: true,
        });
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match transport.connect(&addr).await {
            Err(TransportError::IoError(_)) | Err(TransportError::ConnectionTimeout { .. }) => {}
            other => panic!("expected a connect failure, got {:?}", other.map(|c| c.peer_addr().to_string())),
        }
    }
}
