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

//! Selection engine configuration.

use serde::Deserialize;

/// Reference to an administrator-defined access rule list.
///
/// Rule contents live with the configuration loader; the engine only hands
/// the reference to the [`DirectPolicy`](crate::acl::DirectPolicy)
/// evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AclRef(pub String);

impl AclRef {
    /// Creates a reference from a rule list name.
    pub fn named(name: impl Into<String>) -> Self {
        AclRef(name.into())
    }
}

/// Configuration for the peer-selection engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectConfig {
    /// Upper bound on resolved destinations handed to the forwarder.
    pub forward_max_tries: usize,
    /// Origins measured at or below this RTT are fetched directly.
    pub min_direct_rtt_ms: u32,
    /// Origins measured at or below this hop count are fetched directly.
    pub min_direct_hops: u32,
    /// Emit the direct candidate before the parent cascade.
    pub prefer_direct: bool,
    /// Send non-hierarchical requests directly instead of via parents.
    pub nonhierarchical_direct: bool,
    /// Consider peer-reported RTT/hops hints on probe replies.
    pub query_icmp: bool,
    /// Access rules forcing direct fetches.
    pub always_direct: Option<AclRef>,
    /// Access rules forbidding direct fetches.
    pub never_direct: Option<AclRef>,
    /// Allow probing neighbours for privately-keyed cache entries.
    pub neighbors_do_private_keys: bool,
}

impl Default for SelectConfig {
    fn default() -> Self {
        SelectConfig {
            forward_max_tries: 25,
            min_direct_rtt_ms: 0,
            min_direct_hops: 0,
            prefer_direct: false,
            nonhierarchical_direct: true,
            query_icmp: false,
            always_direct: None,
            never_direct: None,
            neighbors_do_private_keys: true,
        }
    }
}

impl SelectConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.forward_max_tries == 0 {
            return Err("forward_max_tries must be at least 1");
            // Otherwise no destination could ever be delivered
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SelectConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_try_budget() {
        let cfg = SelectConfig {
            forward_max_tries: 0,
            ..Default::default()
        };

        assert!(cfg.validate().is_err());
    }
}
