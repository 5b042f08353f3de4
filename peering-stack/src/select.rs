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

//! The peer-selection driver.
//!
//! One [`Selection`] runs per request and moves through fixed phases:
//! resolve the direct mode, short-circuit onto a pinned upstream, pick a
//! neighbour (probing the hierarchy if nothing cheaper answers), run the
//! parent cascade, then resolve every candidate to concrete addresses and
//! deliver the bounded destination list.
//!
//! Every suspension point is an `.await`: access-rule checks, the probe
//! round (a reply channel raced against a one-shot timer), and the strictly
//! sequential host lookups. Cancellation drops the in-flight future; the
//! selection finalizes the cache entry's probe lifecycle and releases its
//! entry lock on drop, so no exit path leaks either.

use std::{
    collections::VecDeque,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    acl::{AclCache, DirectPolicy},
    config::SelectConfig,
    entry::{CacheEntry, EntryLock, PingStatus},
    netdb::Netdb,
    peers::{Peer, PeerKind, PeerTable},
    probe::{ProbeReply, ProbeTransport},
    request::SelectRequest,
    resolve::{HostResolver, LookupDetails},
};

mod ping;

pub use ping::PingStats;
use ping::RoundControl;

/// Why a candidate was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyCode {
    /// No decision; never delivered.
    None,
    /// Fetch from the origin server.
    Direct,
    /// Reuse the request's pinned upstream.
    Pinned,
    /// A parent's cache digest claims the object.
    CdParentHit,
    /// A sibling's cache digest claims the object.
    CdSiblingHit,
    /// The parent measured closest to the origin, chosen without probing.
    ClosestParent,
    /// The probed parent that reported the lowest origin RTT.
    ClosestParentMiss,
    /// The origin itself is closer than any probed parent.
    ClosestDirect,
    /// The probed parent with the best weighted reply RTT.
    FirstParentMiss,
    /// A parent answered the probe with a hit.
    ParentHit,
    /// A sibling answered the probe with a hit.
    SiblingHit,
    /// The administrator-designated default parent.
    DefaultParent,
    /// Parent chosen by user hashing.
    UserhashParent,
    /// Parent chosen by source-address hashing.
    SourcehashParent,
    /// Parent chosen by consistent URL hashing.
    Carp,
    /// Parent chosen by (weighted) round-robin.
    RoundrobinParent,
    /// Lowest-indexed responsive parent.
    FirstupParent,
    /// Any configured parent; last resort.
    AnyOldParent,
}

impl fmt::Display for HierarchyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HierarchyCode::None => "HIER_NONE",
            HierarchyCode::Direct => "HIER_DIRECT",
            HierarchyCode::Pinned => "PINNED",
            HierarchyCode::CdParentHit => "CD_PARENT_HIT",
            HierarchyCode::CdSiblingHit => "CD_SIBLING_HIT",
            HierarchyCode::ClosestParent => "CLOSEST_PARENT",
            HierarchyCode::ClosestParentMiss => "CLOSEST_PARENT_MISS",
            HierarchyCode::ClosestDirect => "CLOSEST_DIRECT",
            HierarchyCode::FirstParentMiss => "FIRST_PARENT_MISS",
            HierarchyCode::ParentHit => "PARENT_HIT",
            HierarchyCode::SiblingHit => "SIBLING_HIT",
            HierarchyCode::DefaultParent => "DEFAULT_PARENT",
            HierarchyCode::UserhashParent => "USERHASH_PARENT",
            HierarchyCode::SourcehashParent => "SOURCEHASH_PARENT",
            HierarchyCode::Carp => "CARP",
            HierarchyCode::RoundrobinParent => "ROUNDROBIN_PARENT",
            HierarchyCode::FirstupParent => "FIRSTUP_PARENT",
            HierarchyCode::AnyOldParent => "ANY_OLD_PARENT",
        };
        f.write_str(s)
    }
}

/// Direct-mode decision for a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direct {
    Unknown,
    No,
    Maybe,
    Yes,
}

impl fmt::Display for Direct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direct::Unknown => "DIRECT_UNKNOWN",
            Direct::No => "DIRECT_NO",
            Direct::Maybe => "DIRECT_MAYBE",
            Direct::Yes => "DIRECT_YES",
        };
        f.write_str(s)
    }
}

/// A tentative selection: a peer (or the origin) and the reason it was
/// chosen. Resolved to concrete addresses before delivery.
#[derive(Debug, Clone)]
struct Candidate {
    peer: Option<Arc<Peer>>,
    code: HierarchyCode,
}

/// A resolved destination handed to the forwarding layer.
#[derive(Debug, Clone)]
pub struct Destination {
    /// Concrete address to connect to.
    pub remote: SocketAddr,
    /// Why this destination was chosen.
    pub code: HierarchyCode,
    /// The peer behind the address, absent for direct fetches.
    pub peer: Option<Arc<Peer>>,
    /// Local address to bind the outgoing connection to, if policy says so.
    pub outgoing: Option<IpAddr>,
}

/// Receives the destination list of a finished selection.
///
/// Held weakly by the engine: when the caller drops its sink the selection
/// finishes silently and nothing is delivered.
pub trait DeliverySink: Send + Sync {
    /// Called exactly once with the selected destinations, in order.
    fn deliver(&self, paths: Vec<Destination>);
}

/// Policy hook choosing a local outgoing address per destination.
pub type OutgoingAddrPolicy = Arc<dyn Fn(&SelectRequest, IpAddr) -> Option<IpAddr> + Send + Sync>;

/// External services the engine consumes.
pub struct SelectServices {
    /// Network-distance database.
    pub netdb: Arc<dyn Netdb>,
    /// Access-rule evaluator for the direct-mode rules.
    pub policy: Arc<dyn DirectPolicy>,
    /// Asynchronous host resolver.
    pub resolver: Arc<dyn HostResolver>,
    /// Probe transport for the peering protocols.
    pub transport: Arc<dyn ProbeTransport>,
    /// Outgoing-address policy, applied per resolved destination.
    pub outgoing: Option<OutgoingAddrPolicy>,
}

struct SelectorInner {
    config: SelectConfig,
    peers: Arc<PeerTable>,
    netdb: Arc<dyn Netdb>,
    policy: Arc<dyn DirectPolicy>,
    resolver: Arc<dyn HostResolver>,
    transport: Arc<dyn ProbeTransport>,
    outgoing: Option<OutgoingAddrPolicy>,
    timeouts: AtomicU64,
}

/// The peer-selection engine. Cheap to clone; all state is per selection.
#[derive(Clone)]
pub struct PeerSelector(Arc<SelectorInner>);

impl PeerSelector {
    /// Creates a selector over the configured peer table and services.
    pub fn new(
        config: SelectConfig,
        peers: Arc<PeerTable>,
        services: SelectServices,
    ) -> Result<Self, &'static str> {
        config.validate()?;

        Ok(PeerSelector(Arc::new(SelectorInner {
            config,
            peers,
            netdb: services.netdb,
            policy: services.policy,
            resolver: services.resolver,
            transport: services.transport,
            outgoing: services.outgoing,
            timeouts: AtomicU64::new(0),
        })))
    }

    /// The engine configuration.
    pub fn config(&self) -> &SelectConfig {
        &self.0.config
    }

    /// Probe rounds that ended by timeout since the selector was created.
    pub fn timeouts(&self) -> u64 {
        self.0.timeouts.load(Ordering::Relaxed)
    }

    /// Runs one selection to completion and returns the destinations.
    pub async fn select(
        &self,
        request: Arc<SelectRequest>,
        entry: Option<Arc<CacheEntry>>,
    ) -> Vec<Destination> {
        Selection::new(self.clone(), request, entry, None).run().await
    }

    /// Runs one selection as a task, delivering through the sink.
    ///
    /// Dropping the returned handle cancels the selection; the sink is only
    /// invoked if it is still alive when selection completes.
    pub fn spawn(
        &self,
        request: Arc<SelectRequest>,
        entry: Option<Arc<CacheEntry>>,
        sink: Weak<dyn DeliverySink>,
    ) -> SelectionHandle {
        let cancel = CancellationToken::new();
        let selection = Selection::new(self.clone(), request, entry, Some(sink.clone()));

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Selection cancelled");
                    }
                    paths = selection.run() => {
                        match sink.upgrade() {
                            Some(sink) => sink.deliver(paths),
                            None => tracing::debug!("Caller went away, dropping selection result"),
                        }
                    }
                }
            })
        };

        SelectionHandle {
            task: Some(task),
            cancel,
        }
    }
}

/// Handle to a spawned selection.
pub struct SelectionHandle {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SelectionHandle {
    /// Cancels the selection; the callback will not run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the selection task to finish without cancelling it.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SelectionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Per-request selection state.
pub(crate) struct Selection {
    selector: PeerSelector,
    request: Arc<SelectRequest>,
    entry: Option<EntryLock>,
    sink: Option<Weak<dyn DeliverySink>>,
    direct: Direct,
    always_direct: AclCache,
    never_direct: AclCache,
    servers: VecDeque<Candidate>,
    paths: Vec<Destination>,
    ping: PingStats,
    hit: Option<(Arc<Peer>, PeerKind)>,
    closest_parent_miss: Option<IpAddr>,
    first_parent_miss: Option<IpAddr>,
    round_open: bool,
}

impl Selection {
    fn new(
        selector: PeerSelector,
        request: Arc<SelectRequest>,
        entry: Option<Arc<CacheEntry>>,
        sink: Option<Weak<dyn DeliverySink>>,
    ) -> Self {
        let entry = entry.as_ref().map(CacheEntry::lock);
        request.hier.lock().expect("lock poisoned").peer_select_start = Some(Instant::now());

        Selection {
            selector,
            request,
            entry,
            sink,
            direct: Direct::Unknown,
            always_direct: AclCache::Untested,
            never_direct: AclCache::Untested,
            servers: VecDeque::new(),
            paths: Vec::new(),
            ping: PingStats::default(),
            hit: None,
            closest_parent_miss: None,
            first_parent_miss: None,
            round_open: false,
        }
    }

    #[tracing::instrument(name = "peer-select", skip_all, fields(url = %self.request.url))]
    async fn run(mut self) -> Vec<Destination> {
        tracing::debug!(
            method = %self.request.method,
            host = %self.request.origin_host(),
            "Selecting peers"
        );

        self.decide_direct().await;
        if self.caller_gone() {
            return Vec::new();
        }

        if self.entry_status().is_none_or(|s| s == PingStatus::None) {
            self.select_pinned();
        }

        if self.entry_status() == Some(PingStatus::None) {
            self.select_neighbor().await;
            if self.caller_gone() {
                return Vec::new();
            }
        }

        self.select_parents();

        self.resolve_destinations().await;
        if self.caller_gone() {
            return Vec::new();
        }

        self.deliver()
    }

    fn caller_gone(&self) -> bool {
        match &self.sink {
            Some(sink) => sink.strong_count() == 0,
            None => false,
        }
    }

    fn entry_status(&self) -> Option<PingStatus> {
        self.entry.as_ref().map(|lock| lock.entry().ping_status())
    }

    fn set_entry_ping(&self, status: PingStatus) {
        if let Some(lock) = &self.entry {
            lock.entry().set_ping_status(status);
        }
    }

    fn add_candidate(&mut self, peer: Option<Arc<Peer>>, code: HierarchyCode) {
        tracing::debug!(
            peer = peer.as_deref().map(Peer::name).unwrap_or("DIRECT"),
            %code,
            "Adding forward candidate"
        );
        self.servers.push_back(Candidate { peer, code });
    }

    /// Resolves the direct mode once per selection.
    ///
    /// Rule evaluations suspend here; each answer restarts the decision
    /// with the answer cached, so every rule list is evaluated at most
    /// once.
    async fn decide_direct(&mut self) {
        if self.direct != Direct::Unknown {
            return;
        }

        loop {
            if self.always_direct == AclCache::Untested
                && let Some(acl) = self.selector.0.config.always_direct.clone()
            {
                let answer = self.selector.0.policy.check(&acl, &self.request).await;
                tracing::debug!(?answer, "always_direct rules evaluated");
                self.always_direct = answer.into();
                continue;
            }

            if self.always_direct == AclCache::Allow {
                self.direct = Direct::Yes;
                break;
            }

            if self.never_direct == AclCache::Untested
                && let Some(acl) = self.selector.0.config.never_direct.clone()
            {
                let answer = self.selector.0.policy.check(&acl, &self.request).await;
                tracing::debug!(?answer, "never_direct rules evaluated");
                self.never_direct = answer.into();
                continue;
            }

            if self.never_direct == AclCache::Allow {
                self.direct = Direct::No;
            } else if self.request.flags.no_direct {
                // Accelerating; the origin is not an option.
                self.direct = Direct::No;
            } else if self.request.flags.loopdetect {
                // In a forwarding loop only the origin is safe.
                self.direct = Direct::Yes;
            } else if self.netdb_says_direct() {
                self.direct = Direct::Yes;
            } else {
                self.direct = Direct::Maybe;
            }

            break;
        }

        tracing::debug!(direct = %self.direct, "Direct mode resolved");
    }

    /// Whether Netdb measurements say the origin is close enough to skip
    /// the hierarchy.
    fn netdb_says_direct(&self) -> bool {
        if self.direct == Direct::No {
            return false;
        }

        let cfg = &self.selector.0.config;
        let host = self.request.origin_host();
        let rtt = self.selector.0.netdb.host_rtt(host);

        tracing::trace!(?rtt, min_ms = cfg.min_direct_rtt_ms, "Netdb origin RTT");
        if let Some(rtt) = rtt
            && rtt <= cfg.min_direct_rtt_ms
        {
            return true;
        }

        let hops = self.selector.0.netdb.host_hops(host);
        tracing::trace!(?hops, min = cfg.min_direct_hops, "Netdb origin hops");
        if let Some(hops) = hops
            && hops <= cfg.min_direct_hops
        {
            return true;
        }

        // After a probe round: is the origin closer than the closest
        // parent miss?
        if let Some(addr) = self.closest_parent_miss
            && self.selector.0.peers.peer_by_addr(addr).is_some()
            && let Some(rtt) = rtt
            && rtt <= self.ping.p_rtt
        {
            tracing::trace!(p_rtt = self.ping.p_rtt, "Origin closer than closest parent miss");
            return true;
        }

        false
    }

    /// Short-circuits onto the request's pinned upstream, if it is still
    /// open and allowed. Skips neighbour probing on success.
    fn select_pinned(&mut self) {
        let Some(pin) = self.request.pinned.clone() else {
            return;
        };

        if !pin.is_open() {
            tracing::debug!("Pinned connection closed, falling through to normal selection");
            return;
        }

        match pin.peer() {
            Some(peer) => {
                if self.selector.0.peers.allowed_to_use(peer, &self.request) {
                    self.add_candidate(Some(Arc::clone(peer)), HierarchyCode::Pinned);
                    self.set_entry_ping(PingStatus::Done);
                }
            }
            None => {
                if self.direct != Direct::No {
                    self.add_candidate(None, HierarchyCode::Pinned);
                    self.set_entry_ping(PingStatus::Done);
                }
            }
        }
    }

    /// Picks a neighbour: cache digests, then the Netdb-closest parent,
    /// then a live probe round over the hierarchy.
    async fn select_neighbor(&mut self) {
        if self.direct == Direct::Yes {
            self.set_entry_ping(PingStatus::Done);
            return;
        }

        let table = Arc::clone(&self.selector.0.peers);

        if let Some(peer) = table.digest_select(&self.request) {
            let code = match table.neighbor_kind(&peer, &self.request) {
                PeerKind::Parent => HierarchyCode::CdParentHit,
                PeerKind::Sibling => HierarchyCode::CdSiblingHit,
            };
            self.add_candidate(Some(peer), code);
        } else if let Some(peer) = self.selector.0.netdb.closest_parent(&self.request) {
            self.add_candidate(Some(peer), HierarchyCode::ClosestParent);
        } else if self.probe_eligible() {
            let entry = self
                .entry
                .as_ref()
                .map(|lock| Arc::clone(lock.entry()))
                .expect("probing requires a cache entry");

            self.ping.start = Some(Instant::now());
            let round = self
                .selector
                .0
                .transport
                .start_queries(&self.request, &entry);
            self.ping.n_sent = round.n_sent;
            self.ping.n_replies_expected = round.n_replies_expected;
            self.ping.timeout = round.timeout;

            if round.n_sent == 0 {
                tracing::warn!("Probe transport sent no queries");
            }
            tracing::debug!(
                n_sent = round.n_sent,
                expected = round.n_replies_expected,
                timeout_ms = round.timeout.as_millis() as u64,
                "Probe round started"
            );

            if round.n_replies_expected > 0 {
                self.set_entry_ping(PingStatus::Waiting);
                self.round_open = true;
                self.await_replies(round.replies).await;
                self.round_open = false;

                self.select_neighbor_replies();
                self.set_entry_ping(PingStatus::Done);
                return;
            }
            // No replies will come; nothing was gathered, fall through.
        }

        self.set_entry_ping(PingStatus::Done);
    }

    /// Whether a probe round may be started for this selection.
    fn probe_eligible(&self) -> bool {
        let Some(lock) = &self.entry else {
            return false;
        };

        if !self.request.flags.hierarchical && self.direct != Direct::No {
            return false;
        }

        if lock.entry().key_private()
            && !self.selector.0.config.neighbors_do_private_keys
            && self.direct != Direct::No
        {
            return false;
        }

        let n = self.selector.0.peers.neighbors_count(&self.request);
        tracing::trace!(neighbors = n, "Counted probe-eligible neighbours");
        n > 0
    }

    /// Collects replies until the round is decided or the timer fires.
    ///
    /// At most one timer exists per selection and it lives exactly as long
    /// as this wait. A closed reply channel stops reply polling but the
    /// round still only ends through the timer: the expected replies are
    /// outstanding until then.
    async fn await_replies(&mut self, mut replies: mpsc::Receiver<ProbeReply>) {
        let timer = tokio::time::sleep(self.ping.timeout);
        tokio::pin!(timer);
        let mut channel_open = true;

        loop {
            tokio::select! {
                _ = &mut timer => {
                    self.selector.0.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.ping.timedout = true;
                    tracing::debug!(
                        n_recv = self.ping.n_recv,
                        expected = self.ping.n_replies_expected,
                        "Probe round timed out"
                    );
                    return;
                }
                reply = replies.recv(), if channel_open => match reply {
                    Some(reply) => {
                        if self.handle_ping_reply(reply) == RoundControl::Resume {
                            return;
                        }
                    }
                    None => {
                        tracing::debug!("Probe transport closed the reply channel");
                        channel_open = false;
                    }
                }
            }
        }
    }

    /// Picks the post-round winner: a hit, the closest measured miss, or
    /// the best weighted miss, in that order. Netdb may instead decide the
    /// origin itself is closest.
    fn select_neighbor_replies(&mut self) {
        debug_assert!(self.direct != Direct::Yes);

        if self.netdb_says_direct() {
            self.add_candidate(None, HierarchyCode::ClosestDirect);
            return;
        }

        let table = Arc::clone(&self.selector.0.peers);
        let (peer, code) = if let Some((peer, kind)) = self.hit.clone() {
            let code = match kind {
                PeerKind::Parent => HierarchyCode::ParentHit,
                PeerKind::Sibling => HierarchyCode::SiblingHit,
            };
            (Some(peer), code)
        } else if let Some(addr) = self.closest_parent_miss {
            (table.peer_by_addr(addr), HierarchyCode::ClosestParentMiss)
        } else if let Some(addr) = self.first_parent_miss {
            (table.peer_by_addr(addr), HierarchyCode::FirstParentMiss)
        } else {
            (None, HierarchyCode::None)
        };

        if let Some(peer) = peer
            && code != HierarchyCode::None
        {
            self.add_candidate(Some(peer), code);
        }
    }

    /// Emits parent and direct candidates according to the direct mode.
    fn select_parents(&mut self) {
        match self.direct {
            Direct::Yes => self.some_direct(),
            Direct::No => {
                self.some_parent();
                self.all_parents();
            }
            Direct::Maybe | Direct::Unknown => {
                let prefer_direct = self.selector.0.config.prefer_direct;
                let nonhierarchical_direct = self.selector.0.config.nonhierarchical_direct;

                if prefer_direct {
                    self.some_direct();
                }

                if self.request.flags.hierarchical || !nonhierarchical_direct {
                    self.some_parent();
                }

                if !prefer_direct {
                    self.some_direct();
                }
            }
        }
    }

    /// Appends the direct candidate, when the origin is reachable and the
    /// protocol can be spoken natively.
    fn some_direct(&mut self) {
        if self.direct == Direct::No {
            return;
        }

        if !self.request.direct_supported() {
            return;
        }

        self.add_candidate(None, HierarchyCode::Direct);
    }

    /// The deterministic parent cascade; emits at most one candidate.
    fn some_parent(&mut self) {
        if self.direct == Direct::Yes {
            return;
        }

        let table = Arc::clone(&self.selector.0.peers);
        let request = Arc::clone(&self.request);

        let (peer, code) = if let Some(p) = table.default_parent(&request) {
            (p, HierarchyCode::DefaultParent)
        } else if let Some(p) = table.userhash_parent(&request) {
            (p, HierarchyCode::UserhashParent)
        } else if let Some(p) = table.sourcehash_parent(&request) {
            (p, HierarchyCode::SourcehashParent)
        } else if let Some(p) = table.carp_parent(&request) {
            (p, HierarchyCode::Carp)
        } else if let Some(p) = table.round_robin_parent(&request) {
            (p, HierarchyCode::RoundrobinParent)
        } else if let Some(p) = table.weighted_round_robin_parent(&request) {
            (p, HierarchyCode::RoundrobinParent)
        } else if let Some(p) = table.first_up_parent(&request) {
            (p, HierarchyCode::FirstupParent)
        } else if let Some(p) = table.any_parent(&request) {
            (p, HierarchyCode::AnyOldParent)
        } else {
            return;
        };

        self.add_candidate(Some(peer), code);
    }

    /// Appends every alive parent, then the default parent as the very
    /// last resort. Used when direct is forbidden; duplicates with the
    /// cascade are allowed, the forwarder dedupes by connecting.
    fn all_parents(&mut self) {
        let table = Arc::clone(&self.selector.0.peers);
        let request = Arc::clone(&self.request);

        for peer in table.all_parents(&request) {
            self.add_candidate(Some(peer), HierarchyCode::AnyOldParent);
        }

        if let Some(peer) = table.default_parent(&request) {
            self.add_candidate(Some(peer), HierarchyCode::DefaultParent);
        }
    }

    /// Drains the candidate queue head-first, resolving each host and
    /// appending destinations until the try budget is spent.
    async fn resolve_destinations(&mut self) {
        while let Some(candidate) = self.servers.pop_front() {
            if self.paths.len() >= self.selector.0.config.forward_max_tries {
                tracing::debug!("Destination budget reached, stopping resolution");
                break;
            }

            // Host label computed before anything advances past this
            // candidate; diagnostics below must not look back into the
            // queue.
            let host = match &candidate.peer {
                Some(peer) => peer.host().to_string(),
                None => self.request.origin_host().to_string(),
            };
            tracing::debug!(%host, code = %candidate.code, "Resolving forward candidate");

            match self.selector.0.resolver.resolve(&host).await {
                Ok(resolved) => {
                    self.record_lookup(&host, None);
                    self.push_destinations(&candidate, resolved.rotated());
                }
                Err(err) => {
                    tracing::debug!(%host, error = %err, "Unknown host, skipping candidate");
                    self.record_lookup(&host, Some(err.to_string()));
                }
            }
        }
    }

    fn record_lookup(&self, host: &str, error: Option<String>) {
        self.request
            .hier
            .lock()
            .expect("lock poisoned")
            .lookups
            .push(LookupDetails {
                host: host.to_string(),
                error,
            });
    }

    fn push_destinations(&mut self, candidate: &Candidate, addrs: impl Iterator<Item = IpAddr>) {
        let max = self.selector.0.config.forward_max_tries;
        let spoofing = self.request.flags.spoof_client_ip;
        let client_is_v4 = self.request.client_addr.is_ipv4();

        for addr in addrs {
            if self.paths.len() >= max {
                break;
            }

            let peer_no_tproxy = candidate
                .peer
                .as_ref()
                .is_some_and(|p| p.options().no_tproxy);
            if spoofing && !peer_no_tproxy && addr.is_ipv4() != client_is_v4 {
                // The client address cannot be spoofed onto a mismatched
                // address family.
                continue;
            }

            let port = candidate
                .peer
                .as_ref()
                .map(|p| p.http_port())
                .unwrap_or_else(|| self.request.origin_port());

            let mut destination = Destination {
                remote: SocketAddr::new(addr, port),
                code: candidate.code,
                peer: candidate.peer.clone(),
                outgoing: None,
            };
            if let Some(policy) = &self.selector.0.outgoing {
                destination.outgoing = policy(&self.request, addr);
            }

            self.paths.push(destination);
        }
    }

    /// Stamps the final statistics into the request and hands the paths
    /// back. An empty list is a valid outcome, not an error.
    fn deliver(&mut self) -> Vec<Destination> {
        self.ping.stop = Some(Instant::now());
        self.set_entry_ping(PingStatus::Done);

        if self.paths.is_empty() {
            tracing::warn!(
                url = %self.request.url,
                always_direct = ?self.always_direct,
                never_direct = ?self.never_direct,
                timedout = self.ping.timedout,
                "Failed to select any destination"
            );
        } else {
            tracing::debug!(n = self.paths.len(), "Selected destinations");
        }

        self.request.hier.lock().expect("lock poisoned").ping = self.ping.clone();

        std::mem::take(&mut self.paths)
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        // Every exit path, including cancellation, leaves the entry in the
        // Done state; the entry lock itself is released by the EntryLock
        // guard.
        self.set_entry_ping(PingStatus::Done);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        collections::HashMap,
        net::IpAddr,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use peering_proto::icp::IcpReply;

    use super::*;
    use crate::{
        acl::{AclAnswer, DirectPolicy},
        config::AclRef,
        netdb::MemNetdb,
        peers::PeerOptions,
        probe::{ProbeReplyBody, ProbeRoundStart},
        resolve::{ResolveError, ResolvedAddrs},
    };

    /// Rule evaluator answering from a fixed table; unknown rules deny.
    pub struct StaticPolicy {
        answers: HashMap<String, AclAnswer>,
        checks: AtomicUsize,
    }

    impl StaticPolicy {
        pub fn new(answers: &[(&str, AclAnswer)]) -> Arc<Self> {
            Arc::new(StaticPolicy {
                answers: answers
                    .iter()
                    .map(|(name, answer)| (name.to_string(), *answer))
                    .collect(),
                checks: AtomicUsize::new(0),
            })
        }

        pub fn checks(&self) -> usize {
            self.checks.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl DirectPolicy for StaticPolicy {
        async fn check(&self, acl: &AclRef, _request: &SelectRequest) -> AclAnswer {
            self.checks.fetch_add(1, Ordering::Relaxed);
            self.answers.get(&acl.0).copied().unwrap_or(AclAnswer::Deny)
        }
    }

    /// Resolver answering from a fixed host map.
    pub struct MapResolver {
        hosts: HashMap<String, Vec<IpAddr>>,
        calls: AtomicUsize,
    }

    impl MapResolver {
        pub fn new(hosts: &[(&str, &[&str])]) -> Arc<Self> {
            Arc::new(MapResolver {
                hosts: hosts
                    .iter()
                    .map(|(host, addrs)| {
                        let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
                        (host.to_string(), addrs)
                    })
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl HostResolver for MapResolver {
        async fn resolve(&self, host: &str) -> Result<ResolvedAddrs, ResolveError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.hosts.get(host) {
                Some(addrs) => Ok(ResolvedAddrs::new(addrs.clone())),
                None => Err(ResolveError::UnknownHost(host.to_string())),
            }
        }
    }

    /// Transport replaying a scripted reply schedule.
    pub struct ScriptTransport {
        script: Mutex<Vec<(Duration, ProbeReply)>>,
        n_sent: u32,
        n_expected: u32,
        timeout: Duration,
        rounds: AtomicUsize,
    }

    impl ScriptTransport {
        pub fn new(
            script: Vec<(Duration, ProbeReply)>,
            n_sent: u32,
            n_expected: u32,
            timeout: Duration,
        ) -> Arc<Self> {
            Arc::new(ScriptTransport {
                script: Mutex::new(script),
                n_sent,
                n_expected,
                timeout,
                rounds: AtomicUsize::new(0),
            })
        }

        pub fn silent(n_sent: u32, n_expected: u32, timeout: Duration) -> Arc<Self> {
            Self::new(Vec::new(), n_sent, n_expected, timeout)
        }

        pub fn rounds(&self) -> usize {
            self.rounds.load(Ordering::Relaxed)
        }
    }

    impl ProbeTransport for ScriptTransport {
        fn start_queries(&self, _request: &SelectRequest, _entry: &CacheEntry) -> ProbeRoundStart {
            self.rounds.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(16);

            for (delay, reply) in self.script.lock().expect("lock poisoned").clone() {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(reply).await;
                });
            }

            ProbeRoundStart {
                n_sent: self.n_sent,
                n_replies_expected: self.n_expected,
                timeout: self.timeout,
                replies: rx,
            }
        }
    }

    /// Counts deliveries and records the delivered paths.
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<Vec<Destination>>>,
    }

    impl DeliverySink for RecordingSink {
        fn deliver(&self, paths: Vec<Destination>) {
            self.delivered.lock().expect("lock poisoned").push(paths);
        }
    }

    pub fn parent_peer(name: &str, octet: u8, options: PeerOptions) -> Arc<Peer> {
        Peer::new(
            name,
            format!("{name}.test"),
            format!("192.0.2.{octet}").parse::<IpAddr>().unwrap(),
            3128,
            3130,
            PeerKind::Parent,
            options,
        )
    }

    pub fn hier_request(url: &str) -> Arc<SelectRequest> {
        let mut request =
            SelectRequest::new("GET", url.parse().unwrap(), "10.0.0.1".parse().unwrap());
        request.flags.hierarchical = true;
        Arc::new(request)
    }

    pub fn selector(
        config: SelectConfig,
        peers: Vec<Arc<Peer>>,
        services: SelectServices,
    ) -> PeerSelector {
        PeerSelector::new(config, Arc::new(PeerTable::new(peers)), services)
            .expect("selector config invalid")
    }

    pub fn services(
        policy: Arc<dyn DirectPolicy>,
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn ProbeTransport>,
        netdb: Arc<dyn Netdb>,
    ) -> SelectServices {
        SelectServices {
            netdb,
            policy,
            resolver,
            transport,
            outgoing: None,
        }
    }

    /// Fixture for driving reply handling directly, without a transport.
    pub(crate) struct SelectionFixture {
        selector: PeerSelector,
        request: Arc<SelectRequest>,
    }

    impl SelectionFixture {
        fn build(peers: Vec<Arc<Peer>>, query_icmp: bool) -> Self {
            let config = SelectConfig {
                query_icmp,
                ..Default::default()
            };
            let selector = selector(
                config,
                peers,
                services(
                    StaticPolicy::new(&[]),
                    MapResolver::new(&[]),
                    ScriptTransport::silent(0, 0, Duration::from_millis(10)),
                    Arc::new(MemNetdb::new()),
                ),
            );

            SelectionFixture {
                selector,
                request: hier_request("http://origin.test/object"),
            }
        }

        pub fn with_parents(names: &[&str]) -> Self {
            let peers = names
                .iter()
                .enumerate()
                .map(|(i, name)| parent_peer(name, i as u8 + 1, PeerOptions::default()))
                .collect();
            Self::build(peers, false)
        }

        pub fn with_parents_and_icmp(names: &[&str]) -> Self {
            let peers = names
                .iter()
                .enumerate()
                .map(|(i, name)| parent_peer(name, i as u8 + 1, PeerOptions::default()))
                .collect();
            Self::build(peers, true)
        }

        pub fn with_closest_only_parent(name: &str) -> Self {
            let options = PeerOptions {
                closest_only: true,
                ..Default::default()
            };
            Self::build(vec![parent_peer(name, 1, options)], false)
        }

        pub fn with_sibling(name: &str) -> Self {
            let sibling = Peer::new(
                name,
                format!("{name}.test"),
                "192.0.2.1".parse::<IpAddr>().unwrap(),
                3128,
                3130,
                PeerKind::Sibling,
                PeerOptions::default(),
            );
            Self::build(vec![sibling], false)
        }

        pub fn selection(&self) -> Selection {
            Selection::new(
                self.selector.clone(),
                Arc::clone(&self.request),
                None,
                None,
            )
        }

        fn peer(&self, name: &str) -> Arc<Peer> {
            self.selector
                .0
                .peers
                .peers()
                .iter()
                .find(|p| p.name() == name)
                .cloned()
                .expect("unknown fixture peer")
        }

        pub fn peer_addr(&self, name: &str) -> IpAddr {
            self.peer(name).addr()
        }

        pub fn icp_reply(&self, name: &str, reply: IcpReply) -> ProbeReply {
            let peer = self.peer(name);
            ProbeReply {
                kind: peer.kind(),
                peer,
                body: ProbeReplyBody::Icp(reply),
            }
        }
    }
}
