// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The neighbour cache table and its deterministic parent selectors.
//!
//! Peers are configured once and shared read-mostly; the only mutable peer
//! state the selectors touch are the liveness flag and the round-robin
//! counters, both atomics. Every selector is deterministic given the peer
//! state and the request.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::request::SelectRequest;

/// Role of a neighbour cache for a request.
///
/// Parents may be fetched through on a miss; siblings only serve hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Upstream cache that will fetch on our behalf.
    Parent,
    /// Peer cache that only serves what it already holds.
    Sibling,
}

/// Per-peer configuration options.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Never record this peer as a first (weighted) miss; closest only.
    pub closest_only: bool,
    /// Exempt this peer from client-address spoofing constraints.
    pub no_tproxy: bool,
    /// Never send probe queries to this peer.
    pub no_query: bool,
    /// Administrator-designated default parent.
    pub default_parent: bool,
    /// Participates in round-robin parent selection.
    pub round_robin: bool,
    /// Participates in weighted round-robin parent selection.
    pub weighted_round_robin: bool,
    /// Participates in CARP parent selection.
    pub carp: bool,
    /// Participates in user-hash parent selection.
    pub userhash: bool,
    /// Participates in source-hash parent selection.
    pub sourcehash: bool,
    /// Fixed probe-latency component subtracted from weighted miss RTTs.
    pub basetime_ms: u32,
    /// Selection weight; at least 1.
    pub weight: u32,
    /// Origin domains this peer is willing to serve; empty means all.
    pub domains: Vec<String>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        PeerOptions {
            closest_only: false,
            no_tproxy: false,
            no_query: false,
            default_parent: false,
            round_robin: false,
            weighted_round_robin: false,
            carp: false,
            userhash: false,
            sourcehash: false,
            basetime_ms: 0,
            weight: 1,
            domains: Vec::new(),
        }
    }
}

/// A configured neighbour cache.
#[derive(Debug)]
pub struct Peer {
    name: String,
    host: String,
    addr: IpAddr,
    http_port: u16,
    icp_port: u16,
    kind: PeerKind,
    options: PeerOptions,
    alive: AtomicBool,
    rr_count: AtomicU64,
    digest: Mutex<HashSet<String>>,
}

impl Peer {
    /// Creates a peer; newly configured peers start out alive.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        addr: IpAddr,
        http_port: u16,
        icp_port: u16,
        kind: PeerKind,
        options: PeerOptions,
    ) -> Arc<Self> {
        debug_assert!(options.weight >= 1, "peer weight must be at least 1");
        Arc::new(Peer {
            name: name.into(),
            host: host.into(),
            addr,
            http_port,
            icp_port,
            kind,
            options,
            alive: AtomicBool::new(true),
            rr_count: AtomicU64::new(0),
            digest: Mutex::new(HashSet::new()),
        })
    }

    /// Configured peer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname the peer's HTTP port resolves through.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Probe address of the peer.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// HTTP port of the peer.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Probe (ICP/HTCP) port of the peer.
    pub fn icp_port(&self) -> u16 {
        self.icp_port
    }

    /// Configured role of the peer.
    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Per-peer options.
    pub fn options(&self) -> &PeerOptions {
        &self.options
    }

    /// Whether the peer currently answers probes.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Updates the liveness flag, fed by the probe transport.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Records a URL in the peer's advertised cache digest.
    pub fn digest_insert(&self, url: impl Into<String>) {
        self.digest.lock().expect("lock poisoned").insert(url.into());
    }

    /// Whether the peer's digest claims the given URL.
    pub fn digest_claims(&self, url: &str) -> bool {
        self.digest.lock().expect("lock poisoned").contains(url)
    }
}

/// The configured set of neighbour caches.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<Arc<Peer>>,
}

impl PeerTable {
    /// Creates a table from configured peers, kept in configuration order.
    pub fn new(peers: Vec<Arc<Peer>>) -> Self {
        PeerTable { peers }
    }

    /// All configured peers in table order.
    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    /// Finds a peer by its probe address.
    pub fn peer_by_addr(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.peers.iter().find(|p| p.addr() == addr).cloned()
    }

    /// Role of the peer for this request.
    ///
    /// Today the configured role; per-request overrides hang off this seam.
    pub fn neighbor_kind(&self, peer: &Peer, _request: &SelectRequest) -> PeerKind {
        peer.kind()
    }

    /// Whether the administrator allows this peer for the request.
    pub fn allowed_to_use(&self, peer: &Peer, request: &SelectRequest) -> bool {
        let domains = &peer.options().domains;
        if domains.is_empty() {
            return true;
        }

        let host = request.origin_host();
        domains
            .iter()
            .any(|d| host == d || host.strip_suffix(d.as_str()).is_some_and(|pre| pre.ends_with('.')))
    }

    /// Whether an HTTP fetch through this peer is currently an option.
    pub fn http_okay(&self, peer: &Peer, request: &SelectRequest) -> bool {
        if !peer.is_alive() || !self.allowed_to_use(peer, request) {
            return false;
        }

        // Siblings can only answer hits, which requires a hierarchical
        // request in the first place.
        match self.neighbor_kind(peer, request) {
            PeerKind::Parent => true,
            PeerKind::Sibling => request.flags.hierarchical,
        }
    }

    fn would_ping(&self, peer: &Peer, request: &SelectRequest) -> bool {
        !peer.options().no_query && peer.is_alive() && self.allowed_to_use(peer, request)
    }

    /// Number of neighbours a probe round would query for this request.
    pub fn neighbors_count(&self, request: &SelectRequest) -> usize {
        self.peers
            .iter()
            .filter(|p| self.would_ping(p, request))
            .count()
    }

    /// First peer whose advertised digest claims the request URL.
    pub fn digest_select(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        let url = request.url.as_str();
        self.peers
            .iter()
            .find(|p| p.is_alive() && self.allowed_to_use(p, request) && p.digest_claims(url))
            .cloned()
    }

    /// The administrator-designated default parent.
    pub fn default_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        self.usable_parents(request)
            .find(|p| p.options().default_parent)
    }

    /// Parent chosen by hashing the authenticated user.
    pub fn userhash_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        let user = request.username.as_deref()?;
        self.hash_parent(request, user, |o| o.userhash)
    }

    /// Parent chosen by hashing the client address.
    pub fn sourcehash_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        let key = request.client_addr.to_string();
        self.hash_parent(request, &key, |o| o.sourcehash)
    }

    /// Parent chosen by consistent URL hashing across the CARP array.
    pub fn carp_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        self.hash_parent(request, request.url.as_str(), |o| o.carp)
    }

    /// Round-robin across the flagged parents.
    pub fn round_robin_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        let chosen = self
            .usable_parents(request)
            .filter(|p| p.options().round_robin)
            .min_by_key(|p| p.rr_count.load(Ordering::Relaxed))?;

        chosen.rr_count.fetch_add(1, Ordering::Relaxed);
        Some(chosen)
    }

    /// Weighted round-robin across the flagged parents.
    ///
    /// A peer with weight `w` is selected `w` times as often as a peer with
    /// weight 1.
    pub fn weighted_round_robin_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        let chosen = self
            .usable_parents(request)
            .filter(|p| p.options().weighted_round_robin)
            .min_by(|a, b| {
                let a_score =
                    a.rr_count.load(Ordering::Relaxed) as f64 / f64::from(a.options().weight);
                let b_score =
                    b.rr_count.load(Ordering::Relaxed) as f64 / f64::from(b.options().weight);
                a_score.total_cmp(&b_score)
            })?;

        chosen.rr_count.fetch_add(1, Ordering::Relaxed);
        Some(chosen)
    }

    /// Lowest-indexed responsive parent.
    pub fn first_up_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        self.usable_parents(request).next()
    }

    /// Any configured parent, liveness ignored. Last resort.
    pub fn any_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        self.peers
            .iter()
            .find(|p| {
                self.neighbor_kind(p, request) == PeerKind::Parent
                    && self.allowed_to_use(p, request)
            })
            .cloned()
    }

    /// All alive parents in table order.
    pub fn all_parents(&self, request: &SelectRequest) -> Vec<Arc<Peer>> {
        self.usable_parents(request).collect()
    }

    fn usable_parents<'a>(
        &'a self,
        request: &'a SelectRequest,
    ) -> impl Iterator<Item = Arc<Peer>> + 'a {
        self.peers
            .iter()
            .filter(move |p| {
                self.neighbor_kind(p, request) == PeerKind::Parent && self.http_okay(p, request)
            })
            .cloned()
    }

    /// Rendezvous selection: combine the key hash with each flagged
    /// parent's name hash, scale by its weight share, take the maximum.
    fn hash_parent(
        &self,
        request: &SelectRequest,
        key: &str,
        flagged: impl Fn(&PeerOptions) -> bool,
    ) -> Option<Arc<Peer>> {
        let candidates: Vec<Arc<Peer>> = self
            .usable_parents(request)
            .filter(|p| flagged(p.options()))
            .collect();

        let total_weight: u64 = candidates
            .iter()
            .map(|p| u64::from(p.options().weight))
            .sum();
        if total_weight == 0 {
            return None;
        }

        let key_hash = rendezvous_hash(key);
        candidates
            .into_iter()
            .map(|p| {
                let load_share = f64::from(p.options().weight) / total_weight as f64;
                let score = f64::from(combine_hashes(key_hash, rendezvous_hash(p.name()))) * load_share;
                (p, score)
            })
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(p, _)| p)
    }
}

fn rendezvous_hash(key: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in key.bytes() {
        hash = hash.rotate_left(19).wrapping_add(u32::from(byte));
    }
    hash
}

fn combine_hashes(key_hash: u32, peer_hash: u32) -> u32 {
    let mut combined = key_hash.rotate_left(19) ^ peer_hash;
    combined = combined.wrapping_add(combined.wrapping_mul(0x6253_1965));
    combined.rotate_left(21)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SelectRequest;

    fn request(url: &str) -> SelectRequest {
        let mut req =
            SelectRequest::new("GET", url.parse().unwrap(), "10.0.0.1".parse().unwrap());
        req.flags.hierarchical = true;
        req
    }

    fn parent(name: &str, options: PeerOptions) -> Arc<Peer> {
        let addr = format!("192.0.2.{}", name.len()).parse().unwrap();
        Peer::new(name, format!("{name}.test"), addr, 3128, 3130, PeerKind::Parent, options)
    }

    #[test]
    fn round_robin_rotates_over_flagged_parents() {
        let opts = PeerOptions {
            round_robin: true,
            ..Default::default()
        };
        let table = PeerTable::new(vec![parent("a", opts.clone()), parent("bb", opts)]);
        let req = request("http://example.test/");

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(table.round_robin_parent(&req).unwrap().name().to_string());
        }

        assert_eq!(seen.iter().filter(|n| *n == "a").count(), 2);
        assert_eq!(seen.iter().filter(|n| *n == "bb").count(), 2);
    }

    #[test]
    fn weighted_round_robin_honours_weights() {
        let heavy = PeerOptions {
            weighted_round_robin: true,
            weight: 3,
            ..Default::default()
        };
        let light = PeerOptions {
            weighted_round_robin: true,
            weight: 1,
            ..Default::default()
        };
        let table = PeerTable::new(vec![parent("heavy", heavy), parent("li", light)]);
        let req = request("http://example.test/");

        let picks: Vec<String> = (0..8)
            .map(|_| {
                table
                    .weighted_round_robin_parent(&req)
                    .unwrap()
                    .name()
                    .to_string()
            })
            .collect();

        assert_eq!(picks.iter().filter(|n| *n == "heavy").count(), 6);
        assert_eq!(picks.iter().filter(|n| *n == "li").count(), 2);
    }

    #[test]
    fn carp_is_deterministic_per_url() {
        let opts = PeerOptions {
            carp: true,
            ..Default::default()
        };
        let table = PeerTable::new(vec![
            parent("a", opts.clone()),
            parent("bb", opts.clone()),
            parent("ccc", opts),
        ]);

        let req = request("http://example.test/object");
        let first = table.carp_parent(&req).unwrap();
        for _ in 0..10 {
            assert_eq!(table.carp_parent(&req).unwrap().name(), first.name());
        }
    }

    #[test]
    fn carp_spreads_distinct_urls() {
        let opts = PeerOptions {
            carp: true,
            ..Default::default()
        };
        let table = PeerTable::new(vec![
            parent("a", opts.clone()),
            parent("bb", opts.clone()),
            parent("ccc", opts),
        ]);

        let names: HashSet<String> = (0..64)
            .map(|i| {
                let req = request(&format!("http://example.test/object/{i}"));
                table.carp_parent(&req).unwrap().name().to_string()
            })
            .collect();

        assert!(names.len() > 1, "all URLs hashed to one parent");
    }

    #[test]
    fn first_up_skips_dead_parents_but_any_does_not() {
        let table = PeerTable::new(vec![
            parent("dead", PeerOptions::default()),
            parent("up", PeerOptions::default()),
        ]);
        let req = request("http://example.test/");
        table.peers()[0].set_alive(false);

        assert_eq!(table.first_up_parent(&req).unwrap().name(), "up");
        assert_eq!(table.any_parent(&req).unwrap().name(), "dead");
    }

    #[test]
    fn domain_lists_gate_peer_use() {
        let opts = PeerOptions {
            domains: vec!["example.test".into()],
            ..Default::default()
        };
        let table = PeerTable::new(vec![parent("a", opts)]);
        let peer = &table.peers()[0];

        assert!(table.allowed_to_use(peer, &request("http://example.test/")));
        assert!(table.allowed_to_use(peer, &request("http://cdn.example.test/")));
        assert!(!table.allowed_to_use(peer, &request("http://elsewhere.test/")));
        assert!(!table.allowed_to_use(peer, &request("http://badexample.test/")));
    }

    #[test]
    fn siblings_require_hierarchical_requests() {
        let sibling = Peer::new(
            "sib",
            "sib.test",
            "192.0.2.9".parse().unwrap(),
            3128,
            3130,
            PeerKind::Sibling,
            PeerOptions::default(),
        );
        let table = PeerTable::new(vec![sibling]);

        let mut plain = request("http://example.test/");
        plain.flags.hierarchical = false;

        assert!(!table.http_okay(&table.peers()[0], &plain));
        assert!(table.http_okay(&table.peers()[0], &request("http://example.test/")));
    }

    #[test]
    fn digest_select_prefers_claiming_peer() {
        let table = PeerTable::new(vec![
            parent("a", PeerOptions::default()),
            parent("bb", PeerOptions::default()),
        ]);
        let req = request("http://example.test/object");
        table.peers()[1].digest_insert(req.url.as_str());

        assert_eq!(table.digest_select(&req).unwrap().name(), "bb");
    }
}
