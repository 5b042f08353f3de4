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

//! Wire formats of the cache peering protocols.
//!
//! Cache peers answer probe queries over two UDP protocol families: ICP and
//! HTCP. This crate holds the reply-side representations the selection
//! engine consumes — the ICP reply header with its source-RTT hint, and the
//! HTCP reply summary with its cache-to-origin measurements.
//!
//! Query encoding and socket handling belong to the probe transport and are
//! not part of this crate.

pub mod htcp;
pub mod icp;
