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

//! The network-distance database seam.
//!
//! Netdb accumulates measured RTTs and hop counts towards origin hosts,
//! both from the proxy's own probes and from peer-reported hints on probe
//! replies. The engine reads it to decide whether the origin is close
//! enough to skip the hierarchy, and to find the parent measured closest
//! to an origin.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{peers::Peer, request::SelectRequest};

/// Read/update interface of the network-distance database.
pub trait Netdb: Send + Sync {
    /// Measured RTT from this proxy to the host, in milliseconds.
    fn host_rtt(&self, host: &str) -> Option<u32>;

    /// Measured hop count from this proxy to the host.
    fn host_hops(&self, host: &str) -> Option<u32>;

    /// The parent measured closest to the request's origin, if any.
    fn closest_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>>;

    /// Records a peer-reported measurement towards the request's origin.
    ///
    /// Updates are idempotent; replaying a measurement leaves the database
    /// unchanged.
    fn update_peer(&self, request: &SelectRequest, peer: &Arc<Peer>, rtt_ms: u32, hops: u32);
}

/// A Netdb that knows nothing and records nothing.
///
/// Used when ICMP measurement is disabled.
#[derive(Debug, Default)]
pub struct NullNetdb;

impl Netdb for NullNetdb {
    fn host_rtt(&self, _host: &str) -> Option<u32> {
        None
    }

    fn host_hops(&self, _host: &str) -> Option<u32> {
        None
    }

    fn closest_parent(&self, _request: &SelectRequest) -> Option<Arc<Peer>> {
        None
    }

    fn update_peer(&self, _request: &SelectRequest, _peer: &Arc<Peer>, _rtt_ms: u32, _hops: u32) {}
}

#[derive(Debug, Clone, Copy)]
struct HostMetrics {
    rtt_ms: u32,
    hops: u32,
}

/// In-memory Netdb.
///
/// Single-writer under the event loop; reads are lock-free in spirit (a
/// short RwLock read section).
#[derive(Debug, Default)]
pub struct MemNetdb {
    hosts: RwLock<HashMap<String, HostMetrics>>,
    closest: RwLock<HashMap<String, (Arc<Peer>, u32)>>,
}

impl MemNetdb {
    /// Creates an empty database.
    pub fn new() -> Self {
        MemNetdb::default()
    }

    /// Records the proxy's own measurement towards a host.
    pub fn record_host(&self, host: impl Into<String>, rtt_ms: u32, hops: u32) {
        self.hosts
            .write()
            .expect("lock poisoned")
            .insert(host.into(), HostMetrics { rtt_ms, hops });
    }
}

impl Netdb for MemNetdb {
    fn host_rtt(&self, host: &str) -> Option<u32> {
        self.hosts
            .read()
            .expect("lock poisoned")
            .get(host)
            .map(|m| m.rtt_ms)
            .filter(|rtt| *rtt > 0)
    }

    fn host_hops(&self, host: &str) -> Option<u32> {
        self.hosts
            .read()
            .expect("lock poisoned")
            .get(host)
            .map(|m| m.hops)
            .filter(|hops| *hops > 0)
    }

    fn closest_parent(&self, request: &SelectRequest) -> Option<Arc<Peer>> {
        self.closest
            .read()
            .expect("lock poisoned")
            .get(request.origin_host())
            .map(|(peer, _)| Arc::clone(peer))
    }

    fn update_peer(&self, request: &SelectRequest, peer: &Arc<Peer>, rtt_ms: u32, _hops: u32) {
        let mut closest = self.closest.write().expect("lock poisoned");
        match closest.get(request.origin_host()) {
            Some((_, best)) if *best <= rtt_ms => {}
            _ => {
                closest.insert(request.origin_host().to_string(), (Arc::clone(peer), rtt_ms));
            }
        }
    }
}
