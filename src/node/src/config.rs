//! Node configuration and its startup validation.
//!
//! Everything tunable about a node lives here: identity, listen address,
//! peer membership (supplied, never discovered), sketch precision, the
//! durability level and its flush/atomicity knobs, and the gossip cadence.
//! Validation runs before any network or file activity so a misconfigured
//! process exits nonzero without side effects.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use countmesh_sketch::hll::{MAX_PRECISION, MIN_PRECISION};

/// DEFAULT_PRECISION trades ~16KiB of registers for a ~0.8% standard error.
pub const DEFAULT_PRECISION: u8 = 14;

/// DurabilityLevel is the strength of the guarantee that an acknowledged
/// mutation survives a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityLevel {
    /// In-memory only; a crash loses everything since startup.
    None,
    /// Mutations are acknowledged immediately and flushed on an interval;
    /// a crash loses at most one interval of mutations.
    Async,
    /// Every mutation is flushed before it is acknowledged.
    Sync,
}

impl DurabilityLevel {
    pub fn is_durable(&self) -> bool {
        !matches!(self, DurabilityLevel::None)
    }
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurabilityLevel::None => write!(f, "none"),
            DurabilityLevel::Async => write!(f, "async"),
            DurabilityLevel::Sync => write!(f, "sync"),
        }
    }
}

impl FromStr for DurabilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(DurabilityLevel::None),
            "async" => Ok(DurabilityLevel::Async),
            "sync" => Ok(DurabilityLevel::Sync),
            other => Err(format!(
                "unknown durability level {:?}, expected none, async or sync",
                other
            )),
        }
    }
}

/// Backpressure is the policy applied to inserts while unflushed mutations
/// have piled past the bound under async durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Wait up to roughly one flush interval for the committer to catch
    /// up, then reject.
    Block,
    /// Reject immediately with an overload error.
    Reject,
}

impl FromStr for Backpressure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Backpressure::Block),
            "reject" => Ok(Backpressure::Reject),
            other => Err(format!(
                "unknown backpressure policy {:?}, expected block or reject",
                other
            )),
        }
    }
}

/// One configured peer. Membership changes are explicit configuration
/// updates, never a discovery protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub addr: SocketAddr,
}

impl FromStr for PeerConfig {
    type Err = ConfigError;

    /// Parses the `id=host:port` form used on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidPeer(s.to_string()))?;
        if id.is_empty() {
            return Err(ConfigError::InvalidPeer(s.to_string()));
        }
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidPeer(s.to_string()))?;
        Ok(PeerConfig {
            id: id.to_string(),
            addr,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    /// Name of the one sketch this node hosts; requests for any other
    /// sketch id are refused.
    pub sketch_id: String,
    pub listen: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub precision: u8,

    pub durability: DurabilityLevel,
    pub sketch_file: Option<PathBuf>,
    /// Write snapshots via temp-file-and-rename so a crash mid-flush never
    /// leaves a torn record. Only meaningful with a durable level.
    pub atomic_replace: bool,
    pub flush_interval: Duration,
    /// Flush attempts before the node degrades to read-only.
    pub flush_retries: u32,
    /// Unflushed-mutation bound that triggers the backpressure policy.
    pub max_pending: u64,
    pub backpressure: Backpressure,

    pub gossip_interval: Duration,
    pub round_timeout: Duration,
    /// Consecutive failures before a peer is deprioritized.
    pub failure_threshold: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            sketch_id: "default".to_string(),
            listen: "127.0.0.1:6000".parse().unwrap(),
            peers: Vec::new(),
            precision: DEFAULT_PRECISION,
            durability: DurabilityLevel::None,
            sketch_file: None,
            atomic_replace: false,
            flush_interval: Duration::from_secs(5),
            flush_retries: 3,
            max_pending: 100_000,
            backpressure: Backpressure::Block,
            gossip_interval: Duration::from_secs(1),
            round_timeout: Duration::from_secs(1),
            failure_threshold: 3,
        }
    }
}

impl NodeConfig {
    /// validate rejects every configuration the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        if self.sketch_id.is_empty() {
            return Err(ConfigError::EmptySketchId);
        }
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&self.precision) {
            return Err(ConfigError::InvalidPrecision(self.precision));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if peer.id.is_empty() {
                return Err(ConfigError::InvalidPeer(format!("{}", peer.addr)));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.id.clone()));
            }
        }
        if self.durability.is_durable() && self.sketch_file.is_none() {
            return Err(ConfigError::SketchFileRequired(self.durability.to_string()));
        }
        if !self.durability.is_durable() && self.atomic_replace {
            return Err(ConfigError::AtomicWithoutDurability);
        }
        if self.gossip_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("gossip interval"));
        }
        if self.round_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("round timeout"));
        }
        if self.durability == DurabilityLevel::Async && self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("flush interval"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroBound("failure threshold"));
        }
        if self.max_pending == 0 {
            return Err(ConfigError::ZeroBound("max pending mutations"));
        }
        Ok(())
    }
}
