//! Aggregator: the per-node owner of one sketch, its durability
//! controller, and the peer table.
//!
//! All sketch mutation funnels through here under a single write lock, so
//! local inserts and merges arriving from either side of a gossip exchange
//! are serialized against each other. Estimates take a read lock: the
//! estimate is a pure function of a momentarily-consistent register
//! snapshot, so readers need no further isolation.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::RwLock;

use countmesh_sketch::{decode, digest, encode, estimate, HllSketch, SketchError};

use crate::config::{DurabilityLevel, NodeConfig, PeerConfig};
use crate::durability::{DurabilityController, SnapshotStore};
use crate::error::NodeError;
use crate::peer::{PeerStatus, PeerTable};

pub struct Aggregator {
    node_id: String,
    sketch_id: String,
    mu: RwLock<HllSketch>,
    durability: DurabilityController,
    peers: Mutex<PeerTable>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("node_id", &self.node_id)
            .field("sketch_id", &self.sketch_id)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// new validates the configuration, recovers the latest durable
    /// snapshot if one exists, and wires up the peer table. Nothing here
    /// touches the network.
    pub async fn new(
        config: &NodeConfig,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let durability = DurabilityController::new(config, store);

        let sketch = match durability.recover().await? {
            Some(bytes) => {
                let recovered = decode(&bytes)?;
                if recovered.precision() != config.precision {
                    return Err(NodeError::Sketch(SketchError::PrecisionMismatch {
                        local: config.precision,
                        remote: recovered.precision(),
                    }));
                }
                recovered
            }
            None => HllSketch::new(config.precision)?,
        };

        Ok(Self {
            node_id: config.node_id.clone(),
            sketch_id: config.sketch_id.clone(),
            mu: RwLock::new(sketch),
            durability,
            peers: Mutex::new(PeerTable::new(config.peers.clone(), config.failure_threshold)),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn sketch_id(&self) -> &str {
        &self.sketch_id
    }

    /// hosts reports whether a wire request names this node's sketch.
    pub fn hosts(&self, sketch_id: &str) -> bool {
        self.sketch_id == sketch_id
    }

    pub fn is_degraded(&self) -> bool {
        self.durability.is_degraded()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.durability.version()
    }

    /// insert adds one element to the local sketch, honoring the
    /// configured durability level before acknowledging.
    pub async fn insert(&self, element: &[u8]) -> Result<(), NodeError> {
        self.durability.admit().await?;
        let mut sketch = self.mu.write().await;
        let changed = sketch.insert(element);
        if changed {
            let snapshot = if self.durability.level() == DurabilityLevel::Sync {
                encode(&sketch)
            } else {
                Vec::new()
            };
            self.durability.after_mutation(&snapshot).await?;
        }
        Ok(())
    }

    /// estimate returns the current cardinality estimate. Read-only; never
    /// waits on the network or the committer.
    pub async fn estimate(&self) -> f64 {
        let sketch = self.mu.read().await;
        estimate(&sketch)
    }

    /// merge_bytes folds a peer's serialized sketch into the local one.
    /// Sketch-algebra failures (precision mismatch, malformed payload) go
    /// back to the caller with the local sketch untouched. Durability
    /// trouble does not reject the merge: a degraded node keeps absorbing
    /// gossip, it only stops acknowledging inserts.
    pub async fn merge_bytes(&self, data: &[u8]) -> Result<bool, NodeError> {
        let remote = decode(data)?;
        let mut sketch = self.mu.write().await;
        let changed = sketch.merge(&remote)?;
        if changed && !self.durability.is_degraded() {
            let snapshot = if self.durability.level() == DurabilityLevel::Sync {
                encode(&sketch)
            } else {
                Vec::new()
            };
            if let Err(e) = self.durability.after_mutation(&snapshot).await {
                tracing::error!(error = %e, "merge applied but flush failed");
            }
        }
        Ok(changed)
    }

    /// digest fingerprints the current registers for the gossip probe.
    pub async fn digest(&self) -> u64 {
        let sketch = self.mu.read().await;
        digest(&sketch)
    }

    /// snapshot_bytes serializes the current sketch state.
    pub async fn snapshot_bytes(&self) -> Vec<u8> {
        let sketch = self.mu.read().await;
        encode(&sketch)
    }

    /// flush persists current state if anything is unflushed. Called by
    /// the interval committer and once more on clean shutdown.
    pub async fn flush(&self) -> Result<bool, NodeError> {
        if !self.durability.level().is_durable() {
            return Ok(false);
        }
        let snapshot = self.snapshot_bytes().await;
        self.durability.flush_if_dirty(&snapshot).await
    }

    /// run_committer drives the async-durability flush interval forever.
    /// The daemon spawns it for `async` durability and aborts it at
    /// shutdown (after a final `flush`).
    pub async fn run_committer(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.flush().await {
                // commit already logged and degraded the node; keep trying
                // so state still lands on disk if the fault clears.
                tracing::debug!(error = %e, "interval flush failed");
            }
        }
    }

    // Peer table access. Membership is only ever changed through here.

    pub fn select_peer(&self) -> Option<(String, std::net::SocketAddr)> {
        let table = self.peers.lock().unwrap();
        table.select(&mut rand::thread_rng())
    }

    pub fn record_peer_success(&self, id: &str) {
        self.peers.lock().unwrap().record_success(id);
    }

    /// record_peer_failure returns true when the peer just crossed into
    /// degraded.
    pub fn record_peer_failure(&self, id: &str) -> bool {
        self.peers.lock().unwrap().record_failure(id)
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        self.peers.lock().unwrap().statuses()
    }

    pub fn set_peers(&self, peers: Vec<PeerConfig>) {
        self.peers.lock().unwrap().set_peers(peers);
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.lock().unwrap().is_empty()
    }
}
