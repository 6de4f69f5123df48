//! Request/response channel to remote peers.
//!
//! Frames are a u32 big-endian length prefix and a body, bounded so a
//! corrupt or hostile peer cannot make a node allocate unbounded memory.
//! `TcpTransport` opens one connection per call and bounds the whole call
//! with a timeout; transport failure is routine partition behavior, so it
//! surfaces as `PeerUnreachable`/`Timeout` and the gossip layer treats it
//! as bookkeeping, not as an error to escalate.
//!
//! `MemoryTransport` binds addresses straight to in-process aggregators
//! through the same dispatch path the TCP server uses. Tests use it to
//! build whole meshes, and to cut and heal partitions deterministically.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::aggregator::Aggregator;
use crate::error::NodeError;
use crate::server::handle_request;
use crate::wire::{Request, Response};

/// MAX_FRAME_LEN bounds a frame body: the largest dense sketch plus
/// generous header room.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> io::Result<()> {
    debug_assert!(body.len() <= MAX_FRAME_LEN as usize);
    w.write_u32(body.len() as u32).await?;
    w.write_all(body).await?;
    w.flush().await
}

/// read_frame returns the next frame body, or None when the peer closed
/// the connection cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes, exp <= {}", len, MAX_FRAME_LEN),
        ));
    }
    let mut body = vec![0_u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Transport carries one request to a peer and returns its response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, addr: SocketAddr, request: Request) -> Result<Response, NodeError>;
}

/// TCP transport: connect, one framed request, one framed response, all
/// inside the per-call timeout.
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, addr: SocketAddr, request: Request) -> Result<Response, NodeError> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            write_frame(&mut stream, &request.encode()).await?;
            read_frame(&mut stream).await?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-call")
            })
        };
        let body = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| NodeError::Timeout(self.timeout))?
            .map_err(|e: io::Error| NodeError::PeerUnreachable(e.to_string()))?;
        Response::decode(&body)
    }
}

#[derive(Default)]
struct MemoryMesh {
    nodes: HashMap<SocketAddr, Arc<Aggregator>>,
    /// Addresses currently cut off, as if behind a partition.
    down: HashSet<SocketAddr>,
}

/// In-process transport over a shared registry of aggregators.
///
/// `partition` cuts an address off in both directions: calls to it fail,
/// and calls made through that node's `endpoint` handle fail too, the way
/// a real network partition isolates a host.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    mesh: Arc<Mutex<MemoryMesh>>,
    /// The address this handle originates calls from, if bound via
    /// `endpoint`.
    local: Option<SocketAddr>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// endpoint returns a handle whose outbound calls originate from
    /// `local`, so partitioning `local` cuts them off as well.
    pub fn endpoint(&self, local: SocketAddr) -> Self {
        Self {
            mesh: self.mesh.clone(),
            local: Some(local),
        }
    }

    pub fn register(&self, addr: SocketAddr, aggregator: Arc<Aggregator>) {
        self.mesh.lock().unwrap().nodes.insert(addr, aggregator);
    }

    /// partition makes an address unreachable until healed.
    pub fn partition(&self, addr: SocketAddr) {
        self.mesh.lock().unwrap().down.insert(addr);
    }

    pub fn heal(&self, addr: SocketAddr) {
        self.mesh.lock().unwrap().down.remove(&addr);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, addr: SocketAddr, request: Request) -> Result<Response, NodeError> {
        let target = {
            let mesh = self.mesh.lock().unwrap();
            if mesh.down.contains(&addr) {
                return Err(NodeError::PeerUnreachable(format!("{} partitioned", addr)));
            }
            if let Some(local) = self.local {
                if mesh.down.contains(&local) {
                    return Err(NodeError::PeerUnreachable(format!(
                        "{} partitioned",
                        local
                    )));
                }
            }
            mesh.nodes.get(&addr).cloned()
        };
        match target {
            Some(aggregator) => Ok(handle_request(&aggregator, request).await),
            None => Err(NodeError::PeerUnreachable(format!("{} not registered", addr))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();

        let mut cursor = buf.as_slice();
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_rejects_oversize() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = buf.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error_not_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = buf.as_slice();
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
