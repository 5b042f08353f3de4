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

//! Peer selection for the cache hierarchy.
//!
//! For each client request the engine decides where the proxy should fetch
//! from: directly from the origin, from a neighbour cache discovered via
//! the peering protocols, or from a statically configured parent chosen by
//! a deterministic cascade. The output is an ordered, bounded list of
//! resolved destinations the forwarding layer tries in sequence.
//!
//! The engine consumes its collaborators through seams: access-rule
//! evaluation ([`acl`]), host resolution ([`resolve`]), the probe
//! transports ([`probe`]) and the network-distance database ([`netdb`]).
//! [`select::PeerSelector`] ties them together and runs one
//! selection per request, either awaited in place or spawned with a
//! cancellable handle.

pub mod acl;
pub mod config;
pub mod entry;
pub mod netdb;
pub mod peers;
pub mod probe;
pub mod request;
pub mod resolve;
pub mod select;
