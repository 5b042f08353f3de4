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

//! The access-rule evaluation seam.
//!
//! Rule evaluation may consult external helpers and must never run inline
//! with the selection driver; the async boundary here is the suspension
//! point. The engine caches each answer on the selection so a rule list is
//! evaluated at most once per request.

use async_trait::async_trait;

use crate::{config::AclRef, request::SelectRequest};

/// Verdict of an access-rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAnswer {
    /// The rules match; the guarded behavior applies.
    Allow,
    /// The rules do not match.
    Deny,
}

/// Cached tri-state of a per-selection rule evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AclCache {
    /// The rule list was not evaluated yet.
    #[default]
    Untested,
    /// The rules matched.
    Allow,
    /// The rules did not match.
    Deny,
}

impl From<AclAnswer> for AclCache {
    fn from(answer: AclAnswer) -> Self {
        match answer {
            AclAnswer::Allow => AclCache::Allow,
            AclAnswer::Deny => AclCache::Deny,
        }
    }
}

/// Non-blocking evaluator for the direct-mode access rules.
#[async_trait]
pub trait DirectPolicy: Send + Sync {
    /// Evaluates the referenced rule list against the request.
    async fn check(&self, acl: &AclRef, request: &SelectRequest) -> AclAnswer;
}
