//! Peer table and health bookkeeping.
//!
//! Membership is whatever configuration says it is. The table only tracks
//! reachability: consecutive failures past a threshold mark a peer
//! degraded, which deprioritizes it for selection but never removes it.
//! A healed partition brings a degraded peer straight back on its next
//! successful exchange.

use std::net::SocketAddr;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::PeerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub id: String,
    pub addr: SocketAddr,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

#[derive(Debug)]
struct PeerEntry {
    id: String,
    addr: SocketAddr,
    consecutive_failures: u32,
    degraded: bool,
}

#[derive(Debug)]
pub struct PeerTable {
    peers: Vec<PeerEntry>,
    failure_threshold: u32,
}

impl PeerTable {
    pub fn new(peers: Vec<PeerConfig>, failure_threshold: u32) -> Self {
        let mut table = Self {
            peers: Vec::new(),
            failure_threshold,
        };
        table.set_peers(peers);
        table
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// set_peers replaces the membership, keeping health bookkeeping for
    /// peers that survive the update.
    pub fn set_peers(&mut self, peers: Vec<PeerConfig>) {
        let old = std::mem::take(&mut self.peers);
        self.peers = peers
            .into_iter()
            .map(|p| {
                let prior = old.iter().find(|e| e.id == p.id && e.addr == p.addr);
                PeerEntry {
                    id: p.id,
                    addr: p.addr,
                    consecutive_failures: prior.map_or(0, |e| e.consecutive_failures),
                    degraded: prior.is_some_and(|e| e.degraded),
                }
            })
            .collect();
    }

    /// select picks one peer uniformly at random, preferring peers that are
    /// not degraded. When every peer is degraded the pick falls back to the
    /// full table so a healed mesh is eventually rediscovered.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(String, SocketAddr)> {
        let healthy: Vec<&PeerEntry> = self.peers.iter().filter(|e| !e.degraded).collect();
        let chosen = if healthy.is_empty() {
            self.peers.iter().collect::<Vec<_>>().choose(rng).copied()?
        } else {
            healthy.choose(rng).copied()?
        };
        Some((chosen.id.clone(), chosen.addr))
    }

    /// record_success clears the failure counter and any degradation.
    pub fn record_success(&mut self, id: &str) {
        if let Some(entry) = self.peers.iter_mut().find(|e| e.id == id) {
            entry.consecutive_failures = 0;
            entry.degraded = false;
        }
    }

    /// record_failure bumps the counter; returns true the moment the peer
    /// crosses the threshold into degraded.
    pub fn record_failure(&mut self, id: &str) -> bool {
        if let Some(entry) = self.peers.iter_mut().find(|e| e.id == id) {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            if !entry.degraded && entry.consecutive_failures >= self.failure_threshold {
                entry.degraded = true;
                return true;
            }
        }
        false
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        self.peers
            .iter()
            .map(|e| PeerStatus {
                id: e.id.clone(),
                addr: e.addr,
                consecutive_failures: e.consecutive_failures,
                degraded: e.degraded,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peers(specs: &[(&str, &str)]) -> Vec<PeerConfig> {
        specs
            .iter()
            .map(|(id, addr)| PeerConfig {
                id: id.to_string(),
                addr: addr.parse().unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_select_skips_degraded() {
        let mut table = PeerTable::new(
            peers(&[("a", "127.0.0.1:1"), ("b", "127.0.0.1:2")]),
            2,
        );
        table.record_failure("a");
        assert!(table.record_failure("a"), "expected a to degrade at 2 failures");

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let (id, _) = table.select(&mut rng).unwrap();
            assert_eq!(id, "b", "selected degraded peer");
        }
    }

    #[test]
    fn test_all_degraded_falls_back_to_full_table() {
        let mut table = PeerTable::new(peers(&[("a", "127.0.0.1:1")]), 1);
        table.record_failure("a");
        let mut rng = StdRng::seed_from_u64(7);
        assert!(table.select(&mut rng).is_some());
    }

    #[test]
    fn test_success_recovers_degraded_peer() {
        let mut table = PeerTable::new(peers(&[("a", "127.0.0.1:1")]), 1);
        table.record_failure("a");
        assert!(table.statuses()[0].degraded);
        table.record_success("a");
        let status = &table.statuses()[0];
        assert!(!status.degraded);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn test_degraded_peer_is_never_removed() {
        let mut table = PeerTable::new(peers(&[("a", "127.0.0.1:1")]), 1);
        for _ in 0..10 {
            table.record_failure("a");
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_set_peers_keeps_health_of_retained() {
        let mut table = PeerTable::new(
            peers(&[("a", "127.0.0.1:1"), ("b", "127.0.0.1:2")]),
            1,
        );
        table.record_failure("a");
        table.set_peers(peers(&[("a", "127.0.0.1:1"), ("c", "127.0.0.1:3")]));
        let statuses = table.statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().find(|s| s.id == "a").unwrap().degraded);
        assert!(!statuses.iter().find(|s| s.id == "c").unwrap().degraded);
    }

    #[test]
    fn test_empty_table_selects_none() {
        let table = PeerTable::new(Vec::new(), 3);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(table.select(&mut rng).is_none());
    }
}
