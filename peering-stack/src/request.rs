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

//! Per-request inputs to peer selection.
//!
//! The selection engine borrows the request for the lifetime of one
//! selection and leaves its trace in the [`HierarchyNote`]: when selection
//! started, the final probe-round statistics, and every DNS lookup made
//! while resolving candidates.

use std::{
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use url::Url;

use crate::{peers::Peer, resolve::LookupDetails, select::PingStats};

/// Request flags consulted during selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    /// The administrator permits this request to involve peers.
    pub hierarchical: bool,
    /// Accelerator mode; fetching from the origin is not an option.
    pub no_direct: bool,
    /// A forwarding loop was detected; the request must go direct.
    pub loopdetect: bool,
    /// The proxy spoofs the client address on the outgoing connection.
    pub spoof_client_ip: bool,
}

/// An existing upstream connection affinitized to this client.
///
/// `peer` is absent when the pin points at the origin itself. The owner of
/// the connection flips `open` when it closes; selection only short-circuits
/// onto a pin that is still open.
#[derive(Debug, Clone)]
pub struct PinnedConnection {
    peer: Option<Arc<Peer>>,
    open: Arc<AtomicBool>,
}

impl PinnedConnection {
    /// Pin to an upstream peer.
    pub fn to_peer(peer: Arc<Peer>) -> Self {
        PinnedConnection {
            peer: Some(peer),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Pin to the origin server.
    pub fn direct() -> Self {
        PinnedConnection {
            peer: None,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The pinned peer, absent for an origin pin.
    pub fn peer(&self) -> Option<&Arc<Peer>> {
        self.peer.as_ref()
    }

    /// Whether the pinned connection is still open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the pinned connection as closed.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Trace of one selection, stashed back into the request at delivery.
#[derive(Debug, Default)]
pub struct HierarchyNote {
    /// When selection started for this request.
    pub peer_select_start: Option<Instant>,
    /// Final probe-round statistics.
    pub ping: PingStats,
    /// DNS lookups performed while resolving candidates.
    pub lookups: Vec<LookupDetails>,
}

/// The slice of an HTTP request that peer selection consumes.
#[derive(Debug)]
pub struct SelectRequest {
    /// Request method, for diagnostics only.
    pub method: String,
    /// Request URL; selection keys hashing and digest lookups off it.
    pub url: Url,
    /// Address of the requesting client.
    pub client_addr: IpAddr,
    /// Selection-relevant request flags.
    pub flags: RequestFlags,
    /// Authenticated user, when present; feeds the user-hash selector.
    pub username: Option<String>,
    /// Upstream connection this request is affinitized to, if any.
    pub pinned: Option<PinnedConnection>,
    /// Selection trace, filled in at delivery.
    pub hier: Mutex<HierarchyNote>,
}

impl SelectRequest {
    /// Creates a request with default flags.
    pub fn new(method: impl Into<String>, url: Url, client_addr: IpAddr) -> Self {
        SelectRequest {
            method: method.into(),
            url,
            client_addr,
            flags: RequestFlags::default(),
            username: None,
            pinned: None,
            hier: Mutex::new(HierarchyNote::default()),
        }
    }

    /// Host part of the origin URL.
    pub fn origin_host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Port of the origin URL, falling back to the scheme default.
    pub fn origin_port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// Whether the proxy can speak the request's protocol to the origin.
    ///
    /// Legacy gateway-only protocols must go through a parent.
    pub fn direct_supported(&self) -> bool {
        !matches!(self.url.scheme(), "wais")
    }
}
