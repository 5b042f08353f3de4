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

//! The probe-transport seam.
//!
//! The transport owns the UDP sockets and the query encoding for both
//! peering protocols. Starting a round fans a query out to every eligible
//! neighbour and hands the engine a reply channel; the engine owns the
//! round timeout and closes the channel by dropping the receiver.

use std::{sync::Arc, time::Duration};

use peering_proto::{htcp::HtcpReply, icp::IcpReply};
use tokio::sync::mpsc;

use crate::{
    entry::CacheEntry,
    peers::{Peer, PeerKind},
    request::SelectRequest,
};

/// Protocol-tagged body of a probe reply.
#[derive(Debug, Clone)]
pub enum ProbeReplyBody {
    /// An ICP reply header.
    Icp(IcpReply),
    /// An HTCP reply summary.
    Htcp(HtcpReply),
}

/// One reply collected during a probe round.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    /// The neighbour that answered.
    pub peer: Arc<Peer>,
    /// The neighbour's role for this request.
    pub kind: PeerKind,
    /// The protocol-level reply.
    pub body: ProbeReplyBody,
}

/// Result of fanning out one round of probe queries.
#[derive(Debug)]
pub struct ProbeRoundStart {
    /// Queries actually sent.
    pub n_sent: u32,
    /// Subset of queried neighbours expected to answer.
    pub n_replies_expected: u32,
    /// Per-request bound on the reply wait.
    pub timeout: Duration,
    /// Replies as they arrive; closed when the transport gives up.
    pub replies: mpsc::Receiver<ProbeReply>,
}

/// Fan-out side of the ICP/HTCP transports.
pub trait ProbeTransport: Send + Sync {
    /// Queries every eligible neighbour about the entry.
    fn start_queries(&self, request: &SelectRequest, entry: &CacheEntry) -> ProbeRoundStart;
}
