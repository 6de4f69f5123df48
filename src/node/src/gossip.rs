//! Anti-entropy gossip: the loop that makes every reachable replica
//! converge.
//!
//! A round walks IDLE → SELECT_PEER → EXCHANGING → MERGING → IDLE: pick one
//! peer at random, offer the local digest, and if the digests differ pull
//! the peer's sketch, merge it, and push the merged state back. Because the
//! merge is a semilattice join, rounds can repeat, interleave, cross a
//! healing partition or arrive duplicated without any ordering metadata;
//! the digest only exists to skip payload transfer between replicas that
//! already agree.
//!
//! Transport failures and timeouts are the weather this protocol is built
//! for: the round aborts, the peer's failure counter ticks up (degrading it
//! for selection past the threshold, never removing it), and the next tick
//! tries again. Nothing network-shaped ever escalates past a round.

use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::Aggregator;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::transport::Transport;
use crate::wire::{Request, Response};

/// The per-round state machine, in log form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SelectPeer,
    Exchanging,
    Merging,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::SelectPeer => write!(f, "select_peer"),
            Phase::Exchanging => write!(f, "exchanging"),
            Phase::Merging => write!(f, "merging"),
        }
    }
}

/// What one gossip round accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The peer table is empty; nothing to do.
    NoPeers,
    /// Digests matched; no payload moved.
    InSync,
    /// States differed; both sides now hold the join.
    Reconciled,
    /// Timeout, transport failure, or a peer-side refusal. Routine.
    Failed,
}

pub struct GossipProtocol {
    aggregator: Arc<Aggregator>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    round_timeout: Duration,
}

impl GossipProtocol {
    pub fn new(
        aggregator: Arc<Aggregator>,
        transport: Arc<dyn Transport>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            aggregator,
            transport,
            interval: config.gossip_interval,
            round_timeout: config.round_timeout,
        }
    }

    /// run drives rounds at the configured interval, one at a time; a
    /// round in flight delays the next tick rather than stacking.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.round().await;
        }
    }

    /// round runs one full exchange with one peer. Every failure path
    /// lands back at idle; callers never see an error.
    pub async fn round(&self) -> RoundOutcome {
        tracing::trace!(phase = %Phase::SelectPeer, "gossip round starting");
        let Some((peer_id, addr)) = self.aggregator.select_peer() else {
            tracing::trace!("no peers configured, skipping round");
            return RoundOutcome::NoPeers;
        };

        let result = tokio::time::timeout(self.round_timeout, self.exchange(&peer_id, addr)).await;
        match result {
            Ok(Ok(outcome)) => {
                self.aggregator.record_peer_success(&peer_id);
                outcome
            }
            Ok(Err(e)) => {
                self.note_failure(&peer_id, &e);
                RoundOutcome::Failed
            }
            Err(_) => {
                self.note_failure(&peer_id, &NodeError::Timeout(self.round_timeout));
                RoundOutcome::Failed
            }
        }
    }

    async fn exchange(&self, peer_id: &str, addr: std::net::SocketAddr) -> Result<RoundOutcome, NodeError> {
        let sketch_id = self.aggregator.sketch_id().to_string();
        let digest = self.aggregator.digest().await;
        tracing::trace!(phase = %Phase::Exchanging, peer = %peer_id, digest, "offering digest");

        let probe = Request::DigestExchange {
            sketch_id: sketch_id.clone(),
            sender: self.aggregator.node_id().to_string(),
            digest,
        };
        let sketch = match self.transport.call(addr, probe).await? {
            Response::DigestMatch => {
                tracing::trace!(peer = %peer_id, "already in sync");
                return Ok(RoundOutcome::InSync);
            }
            Response::DigestDiffer { sketch } => sketch,
            Response::Error(code) => {
                return Err(NodeError::Protocol(format!(
                    "digest exchange refused: {}",
                    code
                )));
            }
            other => {
                return Err(NodeError::Protocol(format!(
                    "unexpected digest exchange response: {:?}",
                    other
                )));
            }
        };

        tracing::trace!(phase = %Phase::Merging, peer = %peer_id, bytes = sketch.len(), "merging peer sketch");
        let pulled = self.aggregator.merge_bytes(&sketch).await?;

        // Push the joined state back so the peer converges this round too.
        let push = Request::Merge {
            sketch_id,
            sketch: self.aggregator.snapshot_bytes().await,
        };
        match self.transport.call(addr, push).await? {
            Response::Ack => {
                tracing::debug!(peer = %peer_id, pulled, "gossip round reconciled");
                Ok(RoundOutcome::Reconciled)
            }
            Response::Error(code) => Err(NodeError::Protocol(format!("merge refused: {}", code))),
            other => Err(NodeError::Protocol(format!(
                "unexpected merge response: {:?}",
                other
            ))),
        }
    }

    /// note_failure logs the abort and, for reachability failures only,
    /// advances the peer's degradation bookkeeping. A refusal (precision
    /// mismatch, malformed payload) means the peer is alive but
    /// misconfigured; it is logged louder and not counted as unreachable.
    fn note_failure(&self, peer_id: &str, e: &NodeError) {
        match e {
            NodeError::Timeout(_) | NodeError::PeerUnreachable(_) | NodeError::Io(_) => {
                if self.aggregator.record_peer_failure(peer_id) {
                    tracing::warn!(peer = %peer_id, error = %e, "peer degraded after repeated failures");
                } else {
                    tracing::debug!(peer = %peer_id, error = %e, "gossip round aborted");
                }
            }
            other => {
                tracing::warn!(peer = %peer_id, error = %other, "gossip round aborted by protocol error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::transport::MemoryTransport;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    async fn node(
        id: &str,
        peers: &[(&str, u16)],
        transport: &MemoryTransport,
        port: u16,
    ) -> (Arc<Aggregator>, Arc<GossipProtocol>) {
        let config = NodeConfig {
            node_id: id.to_string(),
            precision: 12,
            peers: peers
                .iter()
                .map(|(pid, pport)| PeerConfig {
                    id: pid.to_string(),
                    addr: addr(*pport),
                })
                .collect(),
            failure_threshold: 2,
            ..NodeConfig::default()
        };
        let aggregator = Arc::new(Aggregator::new(&config, None).await.unwrap());
        transport.register(addr(port), aggregator.clone());
        let gossip = Arc::new(GossipProtocol::new(
            aggregator.clone(),
            Arc::new(transport.clone()),
            &config,
        ));
        (aggregator, gossip)
    }

    #[tokio::test]
    async fn test_round_without_peers() {
        let transport = MemoryTransport::new();
        let (_, gossip) = node("a", &[], &transport, 1).await;
        assert_eq!(gossip.round().await, RoundOutcome::NoPeers);
    }

    #[tokio::test]
    async fn test_round_converges_both_sides() {
        let transport = MemoryTransport::new();
        let (a, gossip_a) = node("a", &[("b", 2)], &transport, 1).await;
        let (b, _) = node("b", &[("a", 1)], &transport, 2).await;

        for i in 0..300_u32 {
            a.insert(format!("left-{}", i).as_bytes()).await.unwrap();
            b.insert(format!("right-{}", i).as_bytes()).await.unwrap();
        }
        assert_ne!(a.digest().await, b.digest().await);

        assert_eq!(gossip_a.round().await, RoundOutcome::Reconciled);
        assert_eq!(a.digest().await, b.digest().await);
        assert_eq!(a.snapshot_bytes().await, b.snapshot_bytes().await);

        // Next round finds nothing to do.
        assert_eq!(gossip_a.round().await, RoundOutcome::InSync);
    }

    #[tokio::test]
    async fn test_failed_round_marks_peer_and_recovers() {
        let transport = MemoryTransport::new();
        let (a, gossip_a) = node("a", &[("b", 2)], &transport, 1).await;
        let (_b, _) = node("b", &[("a", 1)], &transport, 2).await;

        transport.partition(addr(2));
        assert_eq!(gossip_a.round().await, RoundOutcome::Failed);
        assert_eq!(a.peers()[0].consecutive_failures, 1);
        assert!(!a.peers()[0].degraded);

        assert_eq!(gossip_a.round().await, RoundOutcome::Failed);
        assert!(a.peers()[0].degraded, "expected degradation at threshold 2");

        transport.heal(addr(2));
        assert_ne!(gossip_a.round().await, RoundOutcome::Failed);
        assert!(!a.peers()[0].degraded);
        assert_eq!(a.peers()[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_precision_mismatch_aborts_without_degradation() {
        let transport = MemoryTransport::new();
        let (a, gossip_a) = node("a", &[("b", 2)], &transport, 1).await;

        // Peer b runs an incompatible precision.
        let config = NodeConfig {
            node_id: "b".to_string(),
            precision: 14,
            ..NodeConfig::default()
        };
        let b = Arc::new(Aggregator::new(&config, None).await.unwrap());
        transport.register(addr(2), b.clone());

        a.insert(b"x").await.unwrap();
        b.insert(b"y").await.unwrap();

        let before = a.snapshot_bytes().await;
        assert_eq!(gossip_a.round().await, RoundOutcome::Failed);
        assert_eq!(a.snapshot_bytes().await, before, "aborted round mutated sketch");
        assert!(
            !a.peers()[0].degraded,
            "misconfiguration must not count as unreachability"
        );
    }
}
