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

//! ICP reply header.
//!
//! An ICP message carries a fixed 20-byte header followed by an opaque
//! payload. Replies of interest here are HIT, MISS and the dumb-echo
//! variants; a reply may additionally carry a source-RTT hint packed into
//! the pad field when the peer measured the origin.

use bytes::Buf;

/// Size of the fixed ICP message header in bytes.
pub const ICP_HEADER_LEN: usize = 20;

/// ICP protocol version spoken by current peers.
pub const ICP_VERSION: u8 = 2;

/// Flag: the reply carries a source RTT measurement in the pad field.
pub const ICP_FLAG_SRC_RTT: u32 = 0x4000_0000;

/// Flag: the reply carries the object itself (hit-object extension).
pub const ICP_FLAG_HIT_OBJ: u32 = 0x8000_0000;

/// ICP message opcodes.
///
/// Only the subset exchanged between current cache peers is represented;
/// anything else fails to decode and the datagram is dropped by the
/// transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcpOpcode {
    /// Query for an object.
    Query = 1,
    /// The peer has a fresh copy.
    Hit = 2,
    /// The peer does not have the object.
    Miss = 3,
    /// The peer failed to parse or answer the query.
    Err = 4,
    /// Source echo (query bounced off the origin's UDP echo port).
    Secho = 10,
    /// Dumb echo (query bounced off a non-ICP peer's echo port).
    Decho = 11,
    /// The peer does not have the object and does not want to fetch it.
    MissNoFetch = 21,
    /// The peer refuses to answer for this client.
    Denied = 22,
    /// Hit carrying the object payload.
    HitObj = 23,
}

impl IcpOpcode {
    fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => IcpOpcode::Query,
            2 => IcpOpcode::Hit,
            3 => IcpOpcode::Miss,
            4 => IcpOpcode::Err,
            10 => IcpOpcode::Secho,
            11 => IcpOpcode::Decho,
            21 => IcpOpcode::MissNoFetch,
            22 => IcpOpcode::Denied,
            23 => IcpOpcode::HitObj,
            _ => return None,
        })
    }

    /// True for the opcodes that report a cache hit.
    pub fn is_hit(self) -> bool {
        matches!(self, IcpOpcode::Hit | IcpOpcode::HitObj)
    }

    /// True for the opcodes a parent's miss handling applies to.
    ///
    /// A dumb echo means the query bounced back unanswered, which is
    /// treated like a miss from that peer.
    pub fn is_miss(self) -> bool {
        matches!(self, IcpOpcode::Miss | IcpOpcode::Decho)
    }
}

/// ICP reply decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IcpDecodeError {
    /// The datagram is shorter than the fixed header.
    #[error("truncated ICP header: {0} bytes")]
    Truncated(usize),

    /// The opcode is not one we exchange with peers.
    #[error("unknown ICP opcode {0}")]
    UnknownOpcode(u8),
}

/// A decoded ICP reply header.
///
/// Field order and widths follow the wire layout: opcode, version, message
/// length, request number, flags, pad, sender host id. All multi-byte
/// fields are big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcpReply {
    /// Reply opcode.
    pub opcode: IcpOpcode,
    /// Protocol version of the sender.
    pub version: u8,
    /// Total message length including the header.
    pub length: u16,
    /// Opaque request number echoed from the query.
    pub reqnum: u32,
    /// Option flags (`ICP_FLAG_*`).
    pub flags: u32,
    /// Option data; carries `(hops << 16) | rtt` when `ICP_FLAG_SRC_RTT`
    /// is set.
    pub pad: u32,
}

impl IcpReply {
    /// Decodes the fixed header from the start of a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, IcpDecodeError> {
        if buf.len() < ICP_HEADER_LEN {
            return Err(IcpDecodeError::Truncated(buf.len()));
        }

        let mut buf = buf;
        let raw_opcode = buf.get_u8();
        let opcode =
            IcpOpcode::from_wire(raw_opcode).ok_or(IcpDecodeError::UnknownOpcode(raw_opcode))?;
        let version = buf.get_u8();
        let length = buf.get_u16();
        let reqnum = buf.get_u32();
        let flags = buf.get_u32();
        let pad = buf.get_u32();
        // sender host id, unused by the selection engine
        let _shostid = buf.get_u32();

        Ok(IcpReply {
            opcode,
            version,
            length,
            reqnum,
            flags,
            pad,
        })
    }

    /// The peer's measured RTT to the origin in milliseconds, if present.
    ///
    /// Zero and the all-ones placeholder are reported as absent; peers use
    /// both to mean "not measured".
    pub fn src_rtt(&self) -> Option<u32> {
        if self.flags & ICP_FLAG_SRC_RTT == 0 {
            return None;
        }

        match self.pad & 0xFFFF {
            0 | 0xFFFF => None,
            rtt => Some(rtt),
        }
    }

    /// The peer's measured hop count to the origin, if present.
    pub fn src_hops(&self) -> Option<u32> {
        if self.flags & ICP_FLAG_SRC_RTT == 0 {
            return None;
        }

        match (self.pad >> 16) & 0xFFFF {
            0 => None,
            hops => Some(hops),
        }
    }
}
