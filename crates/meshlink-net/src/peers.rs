//! Peer roster and reachability tracking
//!
//! The table is the authoritative view of the roster the server advertises,
//! plus the liveness state the UDP prober feeds back. A peer is eligible
//! for direct delivery only while its `last_rx` is fresh and it advertises
//! a usable IPv6 endpoint.

use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddrV6};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::net::{parse_ipv6, Cidr};
use crate::payload::PeerDetail;

/// One known peer
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Identity, the primary key within a deployment
    pub identity: String,
    /// Virtual IPv4 address of the peer
    pub private_ip: Option<Ipv4Addr>,
    /// Virtual networks this peer serves as next-hop
    pub cidrs: Vec<Cidr>,
    /// Advertised public IPv6, empty when unknown
    pub ipv6: String,
    /// UDP port of the peer channel
    pub udp_port: u16,
    pub stun_ip: String,
    pub stun_port: u16,
    /// Set when any valid frame from this peer arrived over UDP;
    /// `None` means the direct path is not proved alive
    pub last_rx: Option<Instant>,
    /// Source address of the most recent probe, diagnostic only
    pub last_remote_addr: Option<SocketAddrV6>,
}

impl PeerEntry {
    /// Build an entry from a roster detail; liveness starts cleared.
    ///
    /// Unparseable CIDR strings are logged and skipped rather than
    /// poisoning the rest of the roster.
    pub fn from_detail(detail: &PeerDetail) -> Self {
        let private_ip = match detail.private_ip.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                if !detail.private_ip.is_empty() {
                    warn!(
                        "peer {}: unparseable private_ip {:?}",
                        detail.identity, detail.private_ip
                    );
                }
                None
            }
        };

        let cidrs = detail
            .ciders
            .iter()
            .filter_map(|s| match s.parse::<Cidr>() {
                Ok(cidr) => Some(cidr),
                Err(_) => {
                    warn!("peer {}: skipping malformed cidr {:?}", detail.identity, s);
                    None
                }
            })
            .collect();

        Self {
            identity: detail.identity.clone(),
            private_ip,
            cidrs,
            ipv6: detail.ipv6.clone(),
            udp_port: detail.port,
            stun_ip: detail.stun_ip.clone(),
            stun_port: detail.stun_port,
            last_rx: None,
            last_remote_addr: None,
        }
    }

    /// Direct UDP endpoint from the advertised address, if usable
    pub fn p2p_addr(&self) -> Option<SocketAddrV6> {
        if self.ipv6.is_empty() || self.udp_port == 0 {
            return None;
        }
        let ip = parse_ipv6(&self.ipv6).ok()?;
        Some(SocketAddrV6::new(ip, self.udp_port, 0, 0))
    }

    /// Whether the direct path was proved alive within `threshold`
    pub fn is_active(&self, threshold: Duration) -> bool {
        matches!(self.last_rx, Some(at) if at.elapsed() <= threshold)
    }
}

/// Self-advertisement carried in every outbound keepalive
#[derive(Debug, Clone, Default)]
pub struct SelfAdvert {
    pub ipv6: String,
    pub udp_port: u16,
    pub stun_ip: String,
    pub stun_port: u16,
}

/// Thread-safe roster keyed by identity.
///
/// Lock discipline: one mutex, operations are short and never suspend.
pub struct PeerTable {
    entries: Mutex<HashMap<String, PeerEntry>>,
    advert: Mutex<SelfAdvert>,
    active_threshold: Duration,
}

impl PeerTable {
    pub fn new(active_threshold: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            advert: Mutex::new(SelfAdvert::default()),
            active_threshold,
        }
    }

    /// Liveness window for direct delivery
    pub fn active_threshold(&self) -> Duration {
        self.active_threshold
    }

    /// Atomically replace the whole roster (authoritative handshake reply)
    pub fn rewrite(&self, entries: Vec<PeerEntry>) {
        let mut map = self.entries.lock().unwrap();
        map.clear();
        for entry in entries {
            map.insert(entry.identity.clone(), entry);
        }
        debug!("peer table rewritten, {} peers", map.len());
    }

    /// Merge roster updates by identity (keepalive path).
    ///
    /// A changed, non-empty IPv6 advertisement clears the peer's liveness:
    /// the old path is presumed dead until a probe proves the new one.
    pub fn upsert(&self, entries: Vec<PeerEntry>) {
        let mut map = self.entries.lock().unwrap();
        for incoming in entries {
            match map.get_mut(&incoming.identity) {
                None => {
                    map.insert(incoming.identity.clone(), incoming);
                }
                Some(existing) => {
                    existing.private_ip = incoming.private_ip;
                    existing.cidrs = incoming.cidrs;
                    existing.udp_port = incoming.udp_port;
                    existing.stun_ip = incoming.stun_ip;
                    existing.stun_port = incoming.stun_port;
                    if !incoming.ipv6.is_empty() && incoming.ipv6 != existing.ipv6 {
                        debug!(
                            "peer {} moved to {}, liveness reset",
                            existing.identity, incoming.ipv6
                        );
                        existing.ipv6 = incoming.ipv6;
                        existing.last_rx = None;
                        existing.last_remote_addr = None;
                    }
                }
            }
        }
    }

    /// Record a valid UDP frame from `identity` observed at `src`
    pub fn on_probe_received(&self, identity: &str, src: SocketAddrV6) {
        let mut map = self.entries.lock().unwrap();
        match map.get_mut(identity) {
            Some(entry) => {
                entry.last_rx = Some(Instant::now());
                entry.last_remote_addr = Some(src);
            }
            None => debug!("probe from unknown peer {identity} at {src}"),
        }
    }

    /// Resolve the next-hop peer for a destination address.
    ///
    /// An exact `private_ip` match wins; otherwise the first CIDR match in
    /// iteration order is taken (the roster keeps CIDRs disjoint).
    pub fn find_by_destination_ip(&self, ip: Ipv4Addr) -> Option<PeerEntry> {
        let map = self.entries.lock().unwrap();
        if let Some(entry) = map.values().find(|e| e.private_ip == Some(ip)) {
            return Some(entry.clone());
        }
        map.values()
            .find(|e| e.cidrs.iter().any(|c| c.contains(ip)))
            .cloned()
    }

    /// Whether the peer's direct path is currently proved alive
    pub fn is_active(&self, identity: &str) -> bool {
        let map = self.entries.lock().unwrap();
        map.get(identity)
            .map(|e| e.is_active(self.active_threshold))
            .unwrap_or(false)
    }

    /// Snapshot of all entries
    pub fn peers(&self) -> Vec<PeerEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }

    /// Union of all advertised virtual networks
    pub fn cidr_union(&self) -> BTreeSet<Cidr> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .flat_map(|e| e.cidrs.iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Current self-advertisement
    pub fn advert(&self) -> SelfAdvert {
        self.advert.lock().unwrap().clone()
    }

    /// Update the advertised public IPv6; returns true when it changed
    pub fn set_self_ipv6(&self, ipv6: &str) -> bool {
        let mut advert = self.advert.lock().unwrap();
        if advert.ipv6 == ipv6 {
            return false;
        }
        advert.ipv6 = ipv6.to_string();
        true
    }

    /// Record the bound UDP port of the local peer channel
    pub fn set_self_udp_port(&self, port: u16) {
        self.advert.lock().unwrap().udp_port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(identity: &str, private_ip: &str, ciders: &[&str], ipv6: &str) -> PeerDetail {
        PeerDetail {
            identity: identity.into(),
            private_ip: private_ip.into(),
            ciders: ciders.iter().map(|s| s.to_string()).collect(),
            ipv6: ipv6.into(),
            port: 51820,
            stun_ip: String::new(),
            stun_port: 0,
            last_active: 0,
        }
    }

    fn entry(identity: &str, private_ip: &str, ciders: &[&str], ipv6: &str) -> PeerEntry {
        PeerEntry::from_detail(&detail(identity, private_ip, ciders, ipv6))
    }

    fn src() -> SocketAddrV6 {
        "[fd00::2]:51820".parse().unwrap()
    }

    #[test]
    fn test_rewrite_replaces_roster() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![entry("a", "10.0.0.2", &[], ""), entry("b", "10.0.0.3", &[], "")]);
        assert_eq!(table.len(), 2);

        table.rewrite(vec![entry("c", "10.0.0.4", &[], "")]);
        let peers = table.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].identity, "c");
    }

    #[test]
    fn test_upsert_inserts_with_cleared_liveness() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.upsert(vec![entry("p2", "10.0.0.3", &["10.0.1.0/24"], "fd00::2")]);

        let peers = table.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].last_rx.is_none());
        assert!(peers[0].last_remote_addr.is_none());
    }

    #[test]
    fn test_upsert_same_ipv6_preserves_liveness() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![entry("p2", "10.0.0.3", &[], "fd00::2")]);
        table.on_probe_received("p2", src());
        assert!(table.is_active("p2"));

        table.upsert(vec![entry("p2", "10.0.0.3", &["10.0.1.0/24"], "fd00::2")]);
        assert!(table.is_active("p2"));
        let peer = &table.peers()[0];
        assert_eq!(peer.cidrs, vec!["10.0.1.0/24".parse().unwrap()]);
    }

    #[test]
    fn test_upsert_new_ipv6_resets_liveness() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![entry("p2", "10.0.0.3", &[], "fd00::2")]);
        table.on_probe_received("p2", src());

        table.upsert(vec![entry("p2", "10.0.0.3", &[], "fd00::9")]);
        let peer = &table.peers()[0];
        assert_eq!(peer.ipv6, "fd00::9");
        assert!(peer.last_rx.is_none());
        assert!(peer.last_remote_addr.is_none());
    }

    #[test]
    fn test_upsert_empty_ipv6_keeps_old_path() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![entry("p2", "10.0.0.3", &[], "fd00::2")]);
        table.on_probe_received("p2", src());

        table.upsert(vec![entry("p2", "10.0.0.3", &[], "")]);
        let peer = &table.peers()[0];
        assert_eq!(peer.ipv6, "fd00::2");
        assert!(peer.last_rx.is_some());
    }

    #[test]
    fn test_find_exact_match_wins_over_cidr() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![
            entry("wide", "10.0.0.9", &["10.0.0.0/16"], ""),
            entry("exact", "10.0.0.5", &[], ""),
        ]);

        let found = table
            .find_by_destination_ip(Ipv4Addr::new(10, 0, 0, 5))
            .unwrap();
        assert_eq!(found.identity, "exact");
    }

    #[test]
    fn test_find_by_cidr() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![entry("p2", "10.0.0.3", &["10.0.1.0/24"], "")]);

        let found = table
            .find_by_destination_ip(Ipv4Addr::new(10, 0, 1, 5))
            .unwrap();
        assert_eq!(found.identity, "p2");
        assert!(table
            .find_by_destination_ip(Ipv4Addr::new(10, 0, 2, 5))
            .is_none());
    }

    #[test]
    fn test_is_active_respects_threshold() {
        let table = PeerTable::new(Duration::from_millis(20));
        table.rewrite(vec![entry("p2", "10.0.0.3", &[], "fd00::2")]);

        assert!(!table.is_active("p2"));
        table.on_probe_received("p2", src());
        assert!(table.is_active("p2"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!table.is_active("p2"));
    }

    #[test]
    fn test_probe_from_unknown_identity_is_ignored() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.on_probe_received("ghost", src());
        assert!(table.is_empty());
    }

    #[test]
    fn test_p2p_addr_requires_ipv6_and_port() {
        let mut peer = entry("p2", "10.0.0.3", &[], "fd00::2");
        assert_eq!(peer.p2p_addr(), Some("[fd00::2]:51820".parse().unwrap()));

        peer.udp_port = 0;
        assert!(peer.p2p_addr().is_none());

        peer.udp_port = 51820;
        peer.ipv6.clear();
        assert!(peer.p2p_addr().is_none());
    }

    #[test]
    fn test_p2p_addr_accepts_bracketed_ipv6() {
        let peer = entry("p2", "10.0.0.3", &[], "[fd00::2]");
        assert_eq!(peer.p2p_addr(), Some("[fd00::2]:51820".parse().unwrap()));
    }

    #[test]
    fn test_cidr_union() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.rewrite(vec![
            entry("a", "10.0.0.2", &["10.0.1.0/24", "10.0.2.0/24"], ""),
            entry("b", "10.0.0.3", &["10.0.2.0/24"], ""),
        ]);

        let union = table.cidr_union();
        assert_eq!(union.len(), 2);
        assert!(union.contains(&"10.0.1.0/24".parse().unwrap()));
        assert!(union.contains(&"10.0.2.0/24".parse().unwrap()));
    }

    #[test]
    fn test_malformed_roster_fields_are_skipped() {
        let peer = entry("p2", "not-an-ip", &["bad/99", "10.0.1.0/24"], "");
        assert!(peer.private_ip.is_none());
        assert_eq!(peer.cidrs, vec!["10.0.1.0/24".parse().unwrap()]);
    }

    #[test]
    fn test_self_advert_updates() {
        let table = PeerTable::new(Duration::from_secs(15));
        table.set_self_udp_port(51820);

        assert!(table.set_self_ipv6("2001:db8::1"));
        assert!(!table.set_self_ipv6("2001:db8::1"));

        let advert = table.advert();
        assert_eq!(advert.ipv6, "2001:db8::1");
        assert_eq!(advert.udp_port, 51820);
    }
}
