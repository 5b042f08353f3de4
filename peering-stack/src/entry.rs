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

//! Handle to the shared cache-index entry.
//!
//! The cache index itself is external; the selection engine only needs the
//! entry's probe lifecycle and its lock count. A selection holds exactly one
//! lock for its whole lifetime, modelled as the RAII [`EntryLock`], and
//! drives the ping status through its one-way lifecycle.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU32, Ordering},
};

/// Probe lifecycle of a cache entry.
///
/// Advances only forward: `None → Waiting → Done` or `None → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PingStatus {
    /// No probe round was started for this entry yet.
    None,
    /// A probe round is in flight; replies are being collected.
    Waiting,
    /// Probing finished (or was skipped); the entry will not be probed again.
    Done,
}

/// The selection-relevant view of a shared cache-index entry.
#[derive(Debug)]
pub struct CacheEntry {
    url: String,
    key_private: bool,
    status: Mutex<PingStatus>,
    locks: AtomicU32,
}

impl CacheEntry {
    /// Creates an entry handle for the given object URL.
    pub fn new(url: impl Into<String>, key_private: bool) -> Arc<Self> {
        Arc::new(CacheEntry {
            url: url.into(),
            key_private,
            status: Mutex::new(PingStatus::None),
            locks: AtomicU32::new(0),
        })
    }

    /// URL of the cached object, for diagnostics.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the entry key is private to one client.
    pub fn key_private(&self) -> bool {
        self.key_private
    }

    /// Current probe lifecycle state.
    pub fn ping_status(&self) -> PingStatus {
        *self.status.lock().expect("lock poisoned")
    }

    /// Advances the probe lifecycle.
    ///
    /// Backwards transitions are ignored; the lifecycle is one-way.
    pub fn set_ping_status(&self, next: PingStatus) {
        let mut status = self.status.lock().expect("lock poisoned");

        if next < *status {
            debug_assert!(false, "ping status may not move backwards");
            tracing::warn!(url = %self.url, from = ?*status, to = ?next, "Ignoring backwards ping status transition");
            return;
        }

        *status = next;
    }

    /// Current lock count, observable for lifecycle checks.
    pub fn lock_count(&self) -> u32 {
        self.locks.load(Ordering::Acquire)
    }

    /// Takes one lock on the entry, released when the guard drops.
    pub fn lock(self: &Arc<Self>) -> EntryLock {
        self.locks.fetch_add(1, Ordering::AcqRel);
        EntryLock {
            entry: Arc::clone(self),
        }
    }
}

/// RAII guard for one lock count on a [`CacheEntry`].
#[derive(Debug)]
pub struct EntryLock {
    entry: Arc<CacheEntry>,
}

impl EntryLock {
    /// The locked entry.
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let before = self.entry.locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "entry lock count underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_status_only_moves_forward() {
        let entry = CacheEntry::new("http://example.test/", false);

        assert_eq!(entry.ping_status(), PingStatus::None);
        entry.set_ping_status(PingStatus::Waiting);
        assert_eq!(entry.ping_status(), PingStatus::Waiting);
        entry.set_ping_status(PingStatus::Done);
        assert_eq!(entry.ping_status(), PingStatus::Done);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn backwards_transition_is_ignored() {
        let entry = CacheEntry::new("http://example.test/", false);

        entry.set_ping_status(PingStatus::Done);
        entry.set_ping_status(PingStatus::Waiting);
        assert_eq!(entry.ping_status(), PingStatus::Done);
    }

    #[test]
    fn skipping_the_waiting_state_is_allowed() {
        let entry = CacheEntry::new("http://example.test/", false);

        entry.set_ping_status(PingStatus::Done);
        assert_eq!(entry.ping_status(), PingStatus::Done);
    }

    #[test]
    fn lock_guard_balances_the_count() {
        let entry = CacheEntry::new("http://example.test/", false);
        assert_eq!(entry.lock_count(), 0);

        let lock = entry.lock();
        let second = entry.lock();
        assert_eq!(entry.lock_count(), 2);

        drop(lock);
        assert_eq!(entry.lock_count(), 1);
        drop(second);
        assert_eq!(entry.lock_count(), 0);
    }
}
