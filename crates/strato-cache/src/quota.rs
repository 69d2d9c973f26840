//! Quota collaborator interface.
//!
//! The cache notifies the quota manager about inserts, pins, touches and
//! removals; the quota manager owns the eviction policy and may delete
//! committed entries at any time (open descriptors stay unaffected).

use strato_hash::ContentHash;

/// Eviction/accounting collaborator consumed by the cache manager.
pub trait QuotaManager: Send + Sync {
    /// Largest object the managed cache accepts.
    fn max_file_size(&self) -> u64;

    /// Managed capacity in bytes; 0 means capacity is unknown or unmanaged.
    fn capacity(&self) -> u64;

    /// Evict until usage is at or below `target_bytes`. Returns false when
    /// the target could not be reached.
    fn cleanup(&self, target_bytes: u64) -> bool;

    /// Register a committed object in the regular eviction order.
    fn insert(&self, id: &ContentHash, size: u64, description: &str);

    /// Register a committed object as preferred-to-evict.
    fn insert_volatile(&self, id: &ContentHash, size: u64, description: &str);

    /// Exempt an object from eviction. Returns false when pinning would
    /// overcommit the pinned set.
    fn pin(&self, id: &ContentHash, size: u64, description: &str, is_catalog: bool) -> bool;

    /// Access-time bookkeeping on a cache hit.
    fn touch(&self, id: &ContentHash);

    /// Drop an object from the accounting (e.g. after a failed commit).
    fn remove(&self, id: &ContentHash);

    /// Return a pinned object to the eviction order.
    fn unpin(&self, id: &ContentHash);
}

/// Trivial quota manager used when no quota management is configured and
/// after the read-only drain.
#[derive(Debug, Default)]
pub struct NoopQuotaManager;

impl QuotaManager for NoopQuotaManager {
    fn max_file_size(&self) -> u64 {
        u64::MAX
    }

    fn capacity(&self) -> u64 {
        0
    }

    fn cleanup(&self, _target_bytes: u64) -> bool {
        true
    }

    fn insert(&self, _id: &ContentHash, _size: u64, _description: &str) {}

    fn insert_volatile(&self, _id: &ContentHash, _size: u64, _description: &str) {}

    fn pin(&self, _id: &ContentHash, _size: u64, _description: &str, _is_catalog: bool) -> bool {
        true
    }

    fn touch(&self, _id: &ContentHash) {}

    fn remove(&self, _id: &ContentHash) {}

    fn unpin(&self, _id: &ContentHash) {}
}
