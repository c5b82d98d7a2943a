//! Ordering guards for at-least-once delivery.
//!
//! # Purpose
//! Two independent guards protect state against redelivery and reordering:
//! - [`StalenessGuard`] admits an observed-state update only when its broker
//!   timestamp is strictly newer than the last one applied for the same key.
//! - [`VersionGate`] enforces that outbound record versions strictly increase
//!   per key.
//!
//! # Key invariants
//! - Admission and watermark update happen under the same per-key entry lock,
//!   so two concurrent deliveries for one key cannot both be admitted with
//!   out-of-order timestamps.
//! - Deletes leave a tombstone watermark; an older update arriving afterwards
//!   is rejected instead of resurrecting the resource.
//!
//! # Memory
//! Neither guard forgets a key on its own. Tombstones can be dropped with
//! [`StalenessGuard::prune_tombstones`] once redelivery of anything older is
//! no longer possible (after the consumer's ack window). [`VersionGate`]
//! keeps one `u64` per key for the life of the process.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Stale { last_applied: DateTime<Utc> },
}

impl Admission {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Admission::Fresh)
    }
}

#[derive(Debug, Clone, Copy)]
struct Watermark {
    applied_at: DateTime<Utc>,
    deleted: bool,
}

/// Last-write-wins guard keyed by resource identity.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use tether_common::StalenessGuard;
///
/// let guard = StalenessGuard::new();
/// let t1 = Utc.timestamp_opt(100, 0).unwrap();
/// let t2 = Utc.timestamp_opt(200, 0).unwrap();
/// assert!(guard.admit("app/web", t2).is_fresh());
/// assert!(!guard.admit("app/web", t1).is_fresh());
/// ```
#[derive(Debug)]
pub struct StalenessGuard<K: Eq + Hash> {
    watermarks: DashMap<K, Watermark>,
}

impl<K: Eq + Hash> Default for StalenessGuard<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> StalenessGuard<K> {
    pub fn new() -> Self {
        Self {
            watermarks: DashMap::new(),
        }
    }

    /// Admit an update observed at `observed_at`, recording it when fresh.
    pub fn admit(&self, key: K, observed_at: DateTime<Utc>) -> Admission {
        self.advance(key, observed_at, false)
    }

    /// Admit a delete; on success the key keeps a tombstone watermark.
    pub fn admit_delete(&self, key: K, observed_at: DateTime<Utc>) -> Admission {
        self.advance(key, observed_at, true)
    }

    pub fn is_deleted(&self, key: &K) -> bool {
        self.watermarks
            .get(key)
            .map(|entry| entry.deleted)
            .unwrap_or(false)
    }

    pub fn last_applied(&self, key: &K) -> Option<DateTime<Utc>> {
        self.watermarks.get(key).map(|entry| entry.applied_at)
    }

    /// Drop tombstones whose delete was observed before `before`.
    /// Returns how many were removed. Live watermarks are kept.
    pub fn prune_tombstones(&self, before: DateTime<Utc>) -> usize {
        let len = self.watermarks.len();
        self.watermarks
            .retain(|_, entry| !(entry.deleted && entry.applied_at < before));
        len.saturating_sub(self.watermarks.len())
    }

    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }

    fn advance(&self, key: K, observed_at: DateTime<Utc>, deleted: bool) -> Admission {
        let mut entry = self.watermarks.entry(key).or_insert(Watermark {
            applied_at: DateTime::<Utc>::MIN_UTC,
            deleted: false,
        });
        if observed_at <= entry.applied_at {
            return Admission::Stale {
                last_applied: entry.applied_at,
            };
        }
        entry.applied_at = observed_at;
        entry.deleted = deleted;
        Admission::Fresh
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("record version {requested} is not newer than {last}")]
pub struct StaleVersion {
    pub last: u64,
    pub requested: u64,
}

/// Strictly increasing version gate keyed by resource identity.
#[derive(Debug)]
pub struct VersionGate<K: Eq + Hash> {
    versions: DashMap<K, u64>,
}

impl<K: Eq + Hash> Default for VersionGate<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> VersionGate<K> {
    pub fn new() -> Self {
        Self {
            versions: DashMap::new(),
        }
    }

    /// Record `version` for `key` if it is strictly greater than the last one.
    /// Returns the version it replaced (0 when unseen).
    pub fn advance(&self, key: K, version: u64) -> Result<u64, StaleVersion> {
        let mut entry = self.versions.entry(key).or_insert(0);
        if version <= *entry {
            return Err(StaleVersion {
                last: *entry,
                requested: version,
            });
        }
        Ok(std::mem::replace(&mut *entry, version))
    }

    /// Undo an [`advance`](Self::advance) of `key` to `version`, restoring
    /// `previous`. No-op when a later version has been recorded since.
    pub fn revert(&self, key: &K, version: u64, previous: u64) {
        if previous == 0 {
            self.versions.remove_if(key, |_, current| *current == version);
        } else if let Some(mut current) = self.versions.get_mut(key)
            && *current == version
        {
            *current = previous;
        }
    }

    /// Version that `advance` would accept next for `key` (1 when unseen).
    /// Nothing is reserved.
    pub fn next(&self, key: &K) -> u64 {
        self.versions
            .get(key)
            .map_or(1, |entry| entry.saturating_add(1))
    }

    pub fn current(&self, key: &K) -> Option<u64> {
        self.versions.get(key).map(|entry| *entry)
    }
}
