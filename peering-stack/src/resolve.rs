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

//! The host-resolution seam.
//!
//! Candidate hosts resolve strictly one at a time; the engine never has two
//! lookups in flight for the same selection. The resolver's address cache
//! rotates a cursor so consecutive lookups of the same host start at
//! different addresses; iteration here respects that cursor and still
//! covers every address exactly once.

use std::net::IpAddr;

use async_trait::async_trait;

/// What happened during one host lookup, recorded in the request's
/// hierarchy note.
#[derive(Debug, Clone)]
pub struct LookupDetails {
    /// The host that was resolved.
    pub host: String,
    /// Resolution failure, if the lookup failed.
    pub error: Option<String>,
}

/// Host resolution errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    /// The host does not resolve.
    #[error("unknown host {0}")]
    UnknownHost(String),

    /// The lookup itself failed.
    #[error("lookup failed: {0}")]
    Failed(String),
}

/// Addresses of a resolved host, with the cache's rotation cursor.
#[derive(Debug, Clone)]
pub struct ResolvedAddrs {
    /// Resolved addresses in cache order.
    pub addrs: Vec<IpAddr>,
    /// Index iteration starts at.
    pub cur: usize,
}

impl ResolvedAddrs {
    /// Wraps addresses with the cursor at the start.
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        ResolvedAddrs { addrs, cur: 0 }
    }

    /// Iterates every address once, starting at the cursor and wrapping.
    pub fn rotated(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let len = self.addrs.len();
        (0..len).map(move |n| self.addrs[(self.cur + n) % len])
    }
}

/// Asynchronous, non-blocking host resolver.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolves a host to its addresses.
    async fn resolve(&self, host: &str) -> Result<ResolvedAddrs, ResolveError>;
}
