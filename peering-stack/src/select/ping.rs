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

//! Probe-round bookkeeping.
//!
//! Replies fold into the selection one at a time: hits terminate the round
//! immediately, parent misses compete for the closest-measured and the
//! weighted-first slots. The fold is purely synchronous; the driver wires
//! the reply channel and the one-shot timer around it.

use std::time::{Duration, Instant};

use peering_proto::{htcp::HtcpReply, icp::IcpReply};

use crate::{
    peers::{Peer, PeerKind},
    probe::{ProbeReply, ProbeReplyBody},
};

use super::Selection;

/// Statistics of one probe round, stashed into the request's hierarchy
/// note at delivery.
#[derive(Debug, Clone, Default)]
pub struct PingStats {
    /// When the queries went out.
    pub start: Option<Instant>,
    /// When selection finished.
    pub stop: Option<Instant>,
    /// Queries sent.
    pub n_sent: u32,
    /// Replies received.
    pub n_recv: u32,
    /// Replies the transport expected to arrive.
    pub n_replies_expected: u32,
    /// Configured bound on the reply wait.
    pub timeout: Duration,
    /// Whether the round ended by timeout.
    pub timedout: bool,
    /// Best weighted parent-miss RTT seen.
    pub w_rtt: u32,
    /// RTT of the closest parent miss.
    pub p_rtt: u32,
}

/// Whether the round keeps collecting replies or resumes the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoundControl {
    /// Keep waiting for more replies.
    Continue,
    /// The round is decided; resume selection.
    Resume,
}

impl Selection {
    /// Folds one probe reply into the round.
    ///
    /// Replies arriving after the round has closed are discarded without
    /// side effects.
    pub(crate) fn handle_ping_reply(&mut self, reply: ProbeReply) -> RoundControl {
        if !self.round_open {
            tracing::trace!(peer = reply.peer.name(), "Discarding probe reply outside a round");
            return RoundControl::Continue;
        }

        self.ping.n_recv += 1;

        match &reply.body {
            ProbeReplyBody::Icp(icp) => {
                tracing::trace!(peer = reply.peer.name(), opcode = ?icp.opcode, "ICP reply");

                if icp.opcode.is_hit() {
                    self.hit = Some((reply.peer, reply.kind));
                    return RoundControl::Resume;
                }

                if icp.opcode.is_miss() && reply.kind == PeerKind::Parent {
                    self.icp_parent_miss(&reply.peer, icp);
                }
            }
            ProbeReplyBody::Htcp(htcp) => {
                tracing::trace!(peer = reply.peer.name(), hit = htcp.hit, "HTCP reply");

                if htcp.hit {
                    self.hit = Some((reply.peer, reply.kind));
                    return RoundControl::Resume;
                }

                if reply.kind == PeerKind::Parent {
                    self.htcp_parent_miss(&reply.peer, htcp);
                }
            }
        }

        if self.ping.n_recv >= self.ping.n_replies_expected {
            return RoundControl::Resume;
        }

        RoundControl::Continue
    }

    fn icp_parent_miss(&mut self, peer: &std::sync::Arc<Peer>, reply: &IcpReply) {
        if self.selector.0.config.query_icmp
            && let Some(rtt) = reply.src_rtt()
        {
            let hops = reply.src_hops().unwrap_or(0);
            self.selector
                .0
                .netdb
                .update_peer(&self.request, peer, rtt, hops);
            self.note_closest_miss(peer, rtt);
        }

        self.note_weighted_miss(peer);
    }

    fn htcp_parent_miss(&mut self, peer: &std::sync::Arc<Peer>, reply: &HtcpReply) {
        if self.selector.0.config.query_icmp
            && let Some(cto) = reply.cache_to_origin
            && let Some(rtt) = cto.rtt_ms()
        {
            self.selector
                .0
                .netdb
                .update_peer(&self.request, peer, rtt, cto.hops_scaled());
            self.note_closest_miss(peer, rtt);
        }

        self.note_weighted_miss(peer);
    }

    fn note_closest_miss(&mut self, peer: &Peer, rtt: u32) {
        if self.ping.p_rtt == 0 || rtt < self.ping.p_rtt {
            self.closest_parent_miss = Some(peer.addr());
            self.ping.p_rtt = rtt;
        }
    }

    /// Records the peer as a first-miss candidate by weighted probe RTT.
    ///
    /// Once a closest miss is measured it wins outright; the weighted slot
    /// is only kept while no peer reported an origin RTT.
    fn note_weighted_miss(&mut self, peer: &Peer) {
        if peer.options().closest_only {
            return;
        }

        if self.closest_parent_miss.is_some() {
            return;
        }

        let elapsed_ms = self
            .ping
            .start
            .map(|start| start.elapsed().as_millis() as i64)
            .unwrap_or(0);
        let weighted = (elapsed_ms - i64::from(peer.options().basetime_ms))
            / i64::from(peer.options().weight.max(1));
        let weighted = weighted.max(1) as u32;

        if self.first_parent_miss.is_none() || weighted < self.ping.w_rtt {
            self.first_parent_miss = Some(peer.addr());
            self.ping.w_rtt = weighted;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use peering_proto::icp::{ICP_FLAG_SRC_RTT, IcpOpcode, IcpReply};

    use super::*;
    use crate::select::test_support::*;

    fn miss_with_rtt(rtt: u32) -> IcpReply {
        IcpReply {
            opcode: IcpOpcode::Miss,
            version: 2,
            length: 20,
            reqnum: 1,
            flags: ICP_FLAG_SRC_RTT,
            pad: rtt,
        }
    }

    fn plain_miss() -> IcpReply {
        IcpReply {
            opcode: IcpOpcode::Miss,
            version: 2,
            length: 20,
            reqnum: 1,
            flags: 0,
            pad: 0,
        }
    }

    #[test]
    fn replies_outside_a_round_are_no_ops() {
        let fixture = SelectionFixture::with_parents(&["a", "bb"]);
        let mut selection = fixture.selection();
        selection.round_open = false;

        let reply = fixture.icp_reply("a", IcpReply { opcode: IcpOpcode::Hit, ..plain_miss() });
        let control = selection.handle_ping_reply(reply);

        assert_eq!(control, RoundControl::Continue);
        assert_eq!(selection.ping.n_recv, 0);
        assert!(selection.hit.is_none());
        assert!(selection.servers.is_empty());
    }

    #[test]
    fn hit_terminates_the_round_early() {
        let fixture = SelectionFixture::with_parents(&["a", "bb"]);
        let mut selection = fixture.selection();
        selection.round_open = true;
        selection.ping.n_replies_expected = 2;

        let reply = fixture.icp_reply("bb", IcpReply { opcode: IcpOpcode::Hit, ..plain_miss() });
        let control = selection.handle_ping_reply(reply);

        assert_eq!(control, RoundControl::Resume);
        assert_eq!(selection.hit.as_ref().unwrap().0.name(), "bb");
        assert_eq!(selection.ping.n_recv, 1);
    }

    #[test]
    fn closest_miss_suppresses_the_weighted_slot() {
        let fixture = SelectionFixture::with_parents_and_icmp(&["far", "near"]);
        let mut selection = fixture.selection();
        selection.round_open = true;
        selection.ping.n_replies_expected = 2;
        selection.ping.start = Some(Instant::now());

        let control = selection.handle_ping_reply(fixture.icp_reply("far", miss_with_rtt(40)));
        assert_eq!(control, RoundControl::Continue);
        assert_eq!(selection.ping.p_rtt, 40);

        let control = selection.handle_ping_reply(fixture.icp_reply("near", miss_with_rtt(10)));
        assert_eq!(control, RoundControl::Resume);

        assert_eq!(selection.ping.p_rtt, 10);
        assert_eq!(selection.closest_parent_miss, Some(fixture.peer_addr("near")));
        assert_eq!(selection.first_parent_miss, None);
        assert_eq!(selection.ping.w_rtt, 0);
    }

    #[test]
    fn unmeasured_misses_compete_for_the_weighted_slot() {
        let fixture = SelectionFixture::with_parents(&["a", "bb"]);
        let mut selection = fixture.selection();
        selection.round_open = true;
        selection.ping.n_replies_expected = 2;
        selection.ping.start = Some(Instant::now());

        selection.handle_ping_reply(fixture.icp_reply("a", plain_miss()));

        assert_eq!(selection.first_parent_miss, Some(fixture.peer_addr("a")));
        assert!(selection.ping.w_rtt >= 1, "weighted RTT is clamped at 1");
        assert_eq!(selection.closest_parent_miss, None);
    }

    #[test]
    fn closest_only_peers_never_take_the_weighted_slot() {
        let fixture = SelectionFixture::with_closest_only_parent("co");
        let mut selection = fixture.selection();
        selection.round_open = true;
        selection.ping.n_replies_expected = 1;
        selection.ping.start = Some(Instant::now());

        selection.handle_ping_reply(fixture.icp_reply("co", plain_miss()));

        assert_eq!(selection.first_parent_miss, None);
        assert_eq!(selection.ping.w_rtt, 0);
    }

    #[test]
    fn sibling_misses_count_but_do_not_select() {
        let fixture = SelectionFixture::with_sibling("sib");
        let mut selection = fixture.selection();
        selection.round_open = true;
        selection.ping.n_replies_expected = 2;

        let control = selection.handle_ping_reply(fixture.icp_reply("sib", plain_miss()));

        assert_eq!(control, RoundControl::Continue);
        assert_eq!(selection.ping.n_recv, 1);
        assert_eq!(selection.first_parent_miss, None);
        assert_eq!(selection.closest_parent_miss, None);
    }

    #[test]
    fn replay_after_the_round_closed_changes_nothing() {
        let fixture = SelectionFixture::with_parents(&["a"]);
        let mut selection = fixture.selection();
        selection.round_open = true;
        selection.ping.n_replies_expected = 1;
        selection.ping.start = Some(Instant::now());

        let reply = fixture.icp_reply("a", plain_miss());
        assert_eq!(selection.handle_ping_reply(reply.clone()), RoundControl::Resume);
        selection.round_open = false;

        let before_recv = selection.ping.n_recv;
        let before_first = selection.first_parent_miss;
        assert_eq!(selection.handle_ping_reply(reply), RoundControl::Continue);
        assert_eq!(selection.ping.n_recv, before_recv);
        assert_eq!(selection.first_parent_miss, before_first);
    }
}
