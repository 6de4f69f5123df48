//! RPC server: the responder side of every exchange.
//!
//! One task per connection, framed requests dispatched straight into the
//! aggregator. A merge arriving here runs under the same sketch write lock
//! as the node's own inserts and initiator-side merges, so responder
//! traffic needs no extra coordination. Bad frames and undecodable
//! requests are answered (when the connection still works) and dropped;
//! nothing a peer sends can crash the node.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use countmesh_sketch::SketchError;

use crate::aggregator::Aggregator;
use crate::error::NodeError;
use crate::transport::{read_frame, write_frame};
use crate::wire::{ErrorCode, Request, Response};

/// handle_request maps one decoded request onto the aggregator. Shared by
/// the TCP server and the in-memory transport so both paths stay
/// behaviorally identical.
pub async fn handle_request(aggregator: &Aggregator, request: Request) -> Response {
    if !aggregator.hosts(request.sketch_id()) {
        return Response::Error(ErrorCode::UnknownSketch);
    }
    match request {
        Request::Insert { element, .. } => match aggregator.insert(&element).await {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(error_code(&e)),
        },
        Request::Merge { sketch, .. } => match aggregator.merge_bytes(&sketch).await {
            Ok(_) => Response::Ack,
            Err(e) => Response::Error(error_code(&e)),
        },
        Request::Estimate { .. } => Response::Estimate(aggregator.estimate().await),
        Request::DigestExchange { sender, digest, .. } => {
            let local = aggregator.digest().await;
            if local == digest {
                tracing::trace!(peer = %sender, "digest match, nothing to exchange");
                Response::DigestMatch
            } else {
                tracing::trace!(peer = %sender, "digest mismatch, sending sketch");
                Response::DigestDiffer {
                    sketch: aggregator.snapshot_bytes().await,
                }
            }
        }
    }
}

/// error_code projects a node error onto the wire.
fn error_code(e: &NodeError) -> ErrorCode {
    match e {
        NodeError::Sketch(SketchError::PrecisionMismatch { .. }) => ErrorCode::PrecisionMismatch,
        NodeError::Sketch(_) => ErrorCode::MalformedPayload,
        NodeError::ReadOnly | NodeError::Durability(_) => ErrorCode::ReadOnly,
        NodeError::Overloaded(_) => ErrorCode::Overloaded,
        _ => ErrorCode::Internal,
    }
}

pub struct RpcServer {
    listener: TcpListener,
    aggregator: Arc<Aggregator>,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, aggregator: Arc<Aggregator>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            aggregator,
        })
    }

    /// local_addr is the bound address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> io::Result<()> {
        tracing::info!(addr = %self.local_addr()?, node = %self.aggregator.node_id(), "rpc server listening");
        loop {
            let (stream, remote) = self.listener.accept().await?;
            let aggregator = self.aggregator.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_conn(stream, aggregator).await {
                    tracing::debug!(remote = %remote, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_conn(mut stream: TcpStream, aggregator: Arc<Aggregator>) -> io::Result<()> {
    while let Some(body) = read_frame(&mut stream).await? {
        let response = match Request::decode(&body) {
            Ok(request) => handle_request(&aggregator, request).await,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable request");
                let resp = Response::Error(ErrorCode::MalformedPayload);
                write_frame(&mut stream, &resp.encode()).await?;
                break;
            }
        };
        write_frame(&mut stream, &response.encode()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::transport::{TcpTransport, Transport};
    use std::time::Duration;

    async fn aggregator(node_id: &str) -> Arc<Aggregator> {
        let config = NodeConfig {
            node_id: node_id.to_string(),
            precision: 12,
            ..NodeConfig::default()
        };
        Arc::new(Aggregator::new(&config, None).await.unwrap())
    }

    async fn spawn_server(agg: Arc<Aggregator>) -> SocketAddr {
        let server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), agg)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    #[tokio::test]
    async fn test_insert_and_estimate_over_tcp() {
        let agg = aggregator("a").await;
        let addr = spawn_server(agg).await;
        let transport = TcpTransport::new(Duration::from_secs(1));

        for i in 0..100_u32 {
            let resp = transport
                .call(
                    addr,
                    Request::Insert {
                        sketch_id: "default".to_string(),
                        element: format!("element-{}", i).into_bytes(),
                    },
                )
                .await
                .unwrap();
            assert_eq!(resp, Response::Ack);
        }

        let resp = transport
            .call(
                addr,
                Request::Estimate {
                    sketch_id: "default".to_string(),
                },
            )
            .await
            .unwrap();
        match resp {
            Response::Estimate(e) => {
                let err = (e - 100.0).abs() / 100.0;
                assert!(err < 0.05, "estimate {} off by {:.3}", e, err);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_sketch_refused() {
        let agg = aggregator("a").await;
        let addr = spawn_server(agg).await;
        let transport = TcpTransport::new(Duration::from_secs(1));

        let resp = transport
            .call(
                addr,
                Request::Estimate {
                    sketch_id: "other".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resp, Response::Error(ErrorCode::UnknownSketch));
    }

    #[tokio::test]
    async fn test_digest_exchange_round() {
        let a = aggregator("a").await;
        let b = aggregator("b").await;
        a.insert(b"only-on-a").await.unwrap();

        let addr = spawn_server(b.clone()).await;
        let transport = TcpTransport::new(Duration::from_secs(1));

        // Digests differ, so the responder hands back its sketch.
        let resp = transport
            .call(
                addr,
                Request::DigestExchange {
                    sketch_id: "default".to_string(),
                    sender: "a".to_string(),
                    digest: a.digest().await,
                },
            )
            .await
            .unwrap();
        let sketch = match resp {
            Response::DigestDiffer { sketch } => sketch,
            other => panic!("unexpected response: {:?}", other),
        };
        a.merge_bytes(&sketch).await.unwrap();

        // Push the merged state back; now both sides agree.
        let resp = transport
            .call(
                addr,
                Request::Merge {
                    sketch_id: "default".to_string(),
                    sketch: a.snapshot_bytes().await,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp, Response::Ack);

        let resp = transport
            .call(
                addr,
                Request::DigestExchange {
                    sketch_id: "default".to_string(),
                    sender: "a".to_string(),
                    digest: a.digest().await,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp, Response::DigestMatch);
    }

    #[tokio::test]
    async fn test_malformed_merge_payload_answered() {
        let agg = aggregator("a").await;
        let addr = spawn_server(agg).await;
        let transport = TcpTransport::new(Duration::from_secs(1));

        let resp = transport
            .call(
                addr,
                Request::Merge {
                    sketch_id: "default".to_string(),
                    sketch: vec![0xde, 0xad, 0xbe, 0xef],
                },
            )
            .await
            .unwrap();
        assert_eq!(resp, Response::Error(ErrorCode::MalformedPayload));
    }

    #[tokio::test]
    async fn test_undecodable_frame_does_not_kill_server() {
        let agg = aggregator("a").await;
        let addr = spawn_server(agg).await;

        // Raw garbage frame on one connection.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, &[0x00, 0x01, 0x02]).await.unwrap();
        let resp = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(
            Response::decode(&resp).unwrap(),
            Response::Error(ErrorCode::MalformedPayload)
        );
        drop(stream);

        // The server still answers a healthy client.
        let transport = TcpTransport::new(Duration::from_secs(1));
        let resp = transport
            .call(
                addr,
                Request::Estimate {
                    sketch_id: "default".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(resp, Response::Estimate(_)));
    }
}
