#[macro_use]
extern crate async_trait;

pub mod aggregator;
pub mod config;
pub mod durability;
pub mod error;
pub mod gossip;
pub mod peer;
pub mod server;
pub mod transport;
pub mod wire;

pub use aggregator::Aggregator;
pub use config::{Backpressure, DurabilityLevel, NodeConfig, PeerConfig};
pub use error::{ConfigError, NodeError};
pub use gossip::GossipProtocol;
pub use server::RpcServer;
pub use transport::{MemoryTransport, TcpTransport, Transport};
