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

//! HTCP reply summary.
//!
//! HTCP is the richer of the two peering protocols; the transport parses
//! the full TST response and hands the selection engine only what it needs:
//! the hit verdict and, when the peer measured the origin, the
//! cache-to-origin RTT and hop count.

/// Cache-to-origin measurements attached to an HTCP reply.
///
/// Values are in seconds on the wire; the engine works in millisecond-like
/// units throughout, so both are scaled by 1000 before use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheToOrigin {
    /// Round-trip time from the answering peer to the origin, in seconds.
    pub rtt_secs: f64,
    /// Hop count from the answering peer to the origin.
    pub hops: f64,
}

impl CacheToOrigin {
    /// RTT scaled to milliseconds, absent when the peer reported none.
    pub fn rtt_ms(&self) -> Option<u32> {
        if self.rtt_secs > 0.0 {
            Some((self.rtt_secs * 1000.0) as u32)
        } else {
            None
        }
    }

    /// Hop count scaled by 1000, matching the RTT units.
    pub fn hops_scaled(&self) -> u32 {
        (self.hops * 1000.0) as u32
    }
}

/// A parsed HTCP reply, reduced to what peer selection consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HtcpReply {
    /// Whether the peer holds a fresh copy of the object.
    pub hit: bool,
    /// Origin measurements, when the peer runs its own probes.
    pub cache_to_origin: Option<CacheToOrigin>,
}

impl HtcpReply {
    /// A plain hit or miss with no origin measurements.
    pub fn plain(hit: bool) -> Self {
        HtcpReply {
            hit,
            cache_to_origin: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_rtt_to_milliseconds() {
        let cto = CacheToOrigin {
            rtt_secs: 0.042,
            hops: 3.0,
        };

        assert_eq!(cto.rtt_ms(), Some(42));
        assert_eq!(cto.hops_scaled(), 3000);
    }

    #[test]
    fn zero_rtt_is_absent() {
        let cto = CacheToOrigin {
            rtt_secs: 0.0,
            hops: 0.0,
        };

        assert_eq!(cto.rtt_ms(), None);
    }

    #[test]
    fn plain_reply_has_no_measurements() {
        let reply = HtcpReply::plain(true);

        assert!(reply.hit);
        assert!(reply.cache_to_origin.is_none());
    }
}
