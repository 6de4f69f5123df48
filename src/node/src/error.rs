use std::time::Duration;

use countmesh_sketch::SketchError;

/// Errors surfaced by node-level operations. Sketch-algebra failures are
/// returned to the immediate caller; network failures stay inside a gossip
/// round; only durability exhaustion escalates to node-level state (the
/// read-only gate).
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Sketch(#[from] SketchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Durable flushes exhausted their retries; the node keeps estimating
    /// and merging but stops acknowledging inserts.
    #[error("node is read-only after durability failure")]
    ReadOnly,

    #[error("insert rejected: {0} unflushed mutations pending")]
    Overloaded(u64),

    #[error("durability flush failed: {0}")]
    Durability(String),

    #[error("this node does not host sketch {0:?}")]
    UnknownSketch(String),

    #[error("peer call timed out after {0:?}")]
    Timeout(Duration),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration problems are fatal at startup, before any socket is bound.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("sketch id must not be empty")]
    EmptySketchId,

    #[error("precision {0} out of range 4..=18")]
    InvalidPrecision(u8),

    #[error("invalid peer {0:?}: expected id=host:port")]
    InvalidPeer(String),

    #[error("duplicate peer id {0:?}")]
    DuplicatePeer(String),

    #[error("a sketch file is required with {0} durability")]
    SketchFileRequired(String),

    #[error("atomic replace has no effect with durability level none")]
    AtomicWithoutDurability,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroBound(&'static str),
}
