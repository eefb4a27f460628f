//! Relay ranking.
//!
//! Relays are kept in the order they were configured. Each one carries a
//! health record fed by the pool: the RTT of the last relay ping, how many
//! peer routes its link holds, and failures since it last worked. The
//! selector sorts by a strategy over those signals; the sort is stable, so
//! configured order breaks ties.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use wisp_crypto::PublicKey;

/// RTT charged to a relay that has not answered a ping yet
const UNMEASURED_RTT_MS: u64 = 500;

/// Balanced cost of one route already on a link
const ROUTE_COST_MS: u64 = 4;

/// Balanced cost of one recent failure
const FAILURE_COST_MS: u64 = 2_000;

/// A relay server: where it listens and the key it proves in the handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayInfo {
    /// TCP address
    pub addr: SocketAddr,
    /// Long-term public key
    pub key: PublicKey,
}

impl RelayInfo {
    /// Relay at `addr` with identity `key`
    #[must_use]
    pub fn new(addr: SocketAddr, key: PublicKey) -> Self {
        Self { addr, key }
    }
}

/// How relays are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Fastest relay ping first; unmeasured relays last
    LowestLatency,
    /// Link with the fewest peer routes first
    FewestRoutes,
    /// Configuration order, failing relays last
    Configured,
    /// RTT plus a penalty per route and per failure
    Balanced,
}

#[derive(Debug, Clone, Copy, Default)]
struct Health {
    rtt: Option<Duration>,
    measured_at: Option<Instant>,
    routes: usize,
    failures: u32,
}

/// Ranks known relays for the pool
#[derive(Debug)]
pub struct RelaySelector {
    relays: Vec<RelayInfo>,
    health: HashMap<SocketAddr, Health>,
    strategy: SelectionStrategy,
}

impl RelaySelector {
    /// Empty selector
    #[must_use]
    pub fn with_strategy(strategy: SelectionStrategy) -> Self {
        Self {
            relays: Vec::new(),
            health: HashMap::new(),
            strategy,
        }
    }

    /// Add a relay; a relay already known at the same address is replaced
    /// in place and keeps its health record only if the key is unchanged
    pub fn add_relay(&mut self, relay: RelayInfo) {
        match self.relays.iter_mut().find(|r| r.addr == relay.addr) {
            Some(known) if known.key == relay.key => {}
            Some(known) => {
                self.health.remove(&relay.addr);
                *known = relay;
            }
            None => self.relays.push(relay),
        }
    }

    /// Forget a relay and its health
    pub fn remove_relay(&mut self, addr: &SocketAddr) {
        self.relays.retain(|r| r.addr != *addr);
        self.health.remove(addr);
    }

    /// Known relays in configuration order
    #[must_use]
    pub fn relays(&self) -> &[RelayInfo] {
        &self.relays
    }

    /// Relay at `addr`
    #[must_use]
    pub fn get(&self, addr: &SocketAddr) -> Option<&RelayInfo> {
        self.relays.iter().find(|r| r.addr == *addr)
    }

    /// Number of known relays
    #[must_use]
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// No relays known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Active strategy
    #[must_use]
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// All relays, best first
    #[must_use]
    pub fn ranked(&self) -> Vec<&RelayInfo> {
        let mut relays: Vec<&RelayInfo> = self.relays.iter().collect();
        match self.strategy {
            SelectionStrategy::LowestLatency => {
                relays.sort_by_key(|r| self.health(r).rtt.unwrap_or(Duration::MAX));
            }
            SelectionStrategy::FewestRoutes => {
                relays.sort_by_key(|r| (self.health(r).routes, self.health(r).failures));
            }
            SelectionStrategy::Configured => {
                relays.sort_by_key(|r| self.health(r).failures > 0);
            }
            SelectionStrategy::Balanced => {
                relays.sort_by_key(|r| self.cost(r));
            }
        }
        relays
    }

    /// Best relay, if any is known
    #[must_use]
    pub fn select_best(&self) -> Option<&RelayInfo> {
        self.ranked().into_iter().next()
    }

    fn health(&self, relay: &RelayInfo) -> Health {
        self.health.get(&relay.addr).copied().unwrap_or_default()
    }

    fn cost(&self, relay: &RelayInfo) -> u64 {
        let h = self.health(relay);
        let rtt = h
            .rtt
            .map_or(UNMEASURED_RTT_MS, |rtt| u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX));
        rtt.saturating_add(h.routes as u64 * ROUTE_COST_MS)
            .saturating_add(u64::from(h.failures) * FAILURE_COST_MS)
    }

    /// Relay ping answered after `rtt`
    pub fn update_latency(&mut self, addr: SocketAddr, rtt: Duration, now: Instant) {
        let h = self.health.entry(addr).or_default();
        h.rtt = Some(rtt);
        h.measured_at = Some(now);
    }

    /// Number of peer routes the link to `addr` holds
    pub fn set_routes(&mut self, addr: SocketAddr, routes: usize) {
        self.health.entry(addr).or_default().routes = routes;
    }

    /// Count a failed connect, handshake or send
    pub fn record_failure(&mut self, addr: SocketAddr) {
        let h = self.health.entry(addr).or_default();
        h.failures = h.failures.saturating_add(1);
    }

    /// The relay worked again
    pub fn record_success(&mut self, addr: SocketAddr) {
        if let Some(h) = self.health.get_mut(&addr) {
            h.failures = 0;
        }
    }

    /// Failures since the relay last worked
    #[must_use]
    pub fn failures(&self, addr: &SocketAddr) -> u32 {
        self.health.get(addr).map_or(0, |h| h.failures)
    }

    /// Last measured RTT
    #[must_use]
    pub fn latency(&self, addr: &SocketAddr) -> Option<Duration> {
        self.health.get(addr).and_then(|h| h.rtt)
    }

    /// When the RTT was last measured, if ever
    #[must_use]
    pub fn measured_at(&self, addr: &SocketAddr) -> Option<Instant> {
        self.health.get(addr).and_then(|h| h.measured_at)
    }
}

impl Default for RelaySelector {
    fn default() -> Self {
        Self::with_strategy(SelectionStrategy::Balanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(port: u16) -> RelayInfo {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        RelayInfo::new(addr, PublicKey::from_bytes([port as u8; 32]))
    }

    fn ports(selector: &RelaySelector) -> Vec<u16> {
        selector.ranked().iter().map(|r| r.addr.port()).collect()
    }

    #[test]
    fn test_readd_same_key_keeps_health() {
        let mut selector = RelaySelector::default();
        selector.add_relay(relay(443));
        selector.record_failure(relay(443).addr);
        selector.add_relay(relay(443));
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.failures(&relay(443).addr), 1);
    }

    #[test]
    fn test_readd_new_key_resets_health() {
        let mut selector = RelaySelector::default();
        selector.add_relay(relay(443));
        selector.record_failure(relay(443).addr);

        let rekeyed = RelayInfo::new(relay(443).addr, PublicKey::from_bytes([9; 32]));
        selector.add_relay(rekeyed.clone());
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.get(&rekeyed.addr), Some(&rekeyed));
        assert_eq!(selector.failures(&rekeyed.addr), 0);
    }

    #[test]
    fn test_remove_forgets_health() {
        let mut selector = RelaySelector::default();
        let addr = relay(443).addr;
        selector.add_relay(relay(443));
        selector.record_failure(addr);
        selector.remove_relay(&addr);
        assert!(selector.is_empty());
        assert_eq!(selector.failures(&addr), 0);
        assert!(selector.select_best().is_none());
    }

    #[test]
    fn test_configured_order_with_failures_last() {
        let mut selector = RelaySelector::with_strategy(SelectionStrategy::Configured);
        for port in [443, 444, 445] {
            selector.add_relay(relay(port));
        }
        assert_eq!(ports(&selector), vec![443, 444, 445]);

        selector.record_failure(relay(443).addr);
        assert_eq!(ports(&selector), vec![444, 445, 443]);

        selector.record_success(relay(443).addr);
        assert_eq!(ports(&selector), vec![443, 444, 445]);
    }

    #[test]
    fn test_lowest_latency_puts_unmeasured_last() {
        let now = Instant::now();
        let mut selector = RelaySelector::with_strategy(SelectionStrategy::LowestLatency);
        for port in [443, 444, 445] {
            selector.add_relay(relay(port));
        }
        selector.update_latency(relay(445).addr, Duration::from_millis(80), now);
        selector.update_latency(relay(444).addr, Duration::from_millis(20), now);

        assert_eq!(ports(&selector), vec![444, 445, 443]);
        assert_eq!(selector.latency(&relay(444).addr), Some(Duration::from_millis(20)));
        assert_eq!(selector.measured_at(&relay(444).addr), Some(now));
        assert_eq!(selector.measured_at(&relay(443).addr), None);
    }

    #[test]
    fn test_fewest_routes() {
        let mut selector = RelaySelector::with_strategy(SelectionStrategy::FewestRoutes);
        selector.add_relay(relay(443));
        selector.add_relay(relay(444));
        selector.set_routes(relay(443).addr, 10);
        selector.set_routes(relay(444).addr, 2);
        assert_eq!(selector.select_best().map(|r| r.addr.port()), Some(444));
    }

    #[test]
    fn test_balanced_failures_outweigh_latency() {
        let now = Instant::now();
        let mut selector = RelaySelector::default();
        selector.add_relay(relay(443));
        selector.add_relay(relay(444));
        selector.update_latency(relay(443).addr, Duration::from_millis(10), now);
        selector.update_latency(relay(444).addr, Duration::from_millis(200), now);
        assert_eq!(ports(&selector), vec![443, 444]);

        selector.record_failure(relay(443).addr);
        assert_eq!(ports(&selector), vec![444, 443]);
    }

    #[test]
    fn test_balanced_spreads_routes() {
        let now = Instant::now();
        let mut selector = RelaySelector::default();
        selector.add_relay(relay(443));
        selector.add_relay(relay(444));
        selector.update_latency(relay(443).addr, Duration::from_millis(30), now);
        selector.update_latency(relay(444).addr, Duration::from_millis(40), now);
        selector.set_routes(relay(443).addr, 5);
        assert_eq!(selector.select_best().map(|r| r.addr.port()), Some(444));
    }
}
