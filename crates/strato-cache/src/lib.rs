//! # strato-cache
//!
//! Transactional, content-addressed local object store with file-descriptor
//! read semantics.
//!
//! The [`CacheManager`] trait is the capability seam: one required backend
//! ([`PosixCacheManager`], a local directory tree) ships here, further
//! backends plug in by implementing the same trait. Reads hand out plain
//! file descriptors that stay valid until closed, no matter what happens to
//! the backing entry in the meantime. Writes are staged in a transaction and
//! only become visible after an atomic commit, so a canonical cache name
//! always refers to a complete, verified object.
//!
//! Eviction is delegated to a [`QuotaManager`] collaborator; the
//! [`NoopQuotaManager`] stands in when no quota management is configured.
//!
//! ## Tear-down
//!
//! A mounted tree winds down by draining its loader and fetcher call guards
//! (see [`drain::CallCounter`]) and then calling
//! [`PosixCacheManager::teardown_to_readonly`], after which writes are
//! refused with the read-only error while existing descriptors keep working.

pub mod drain;
pub mod manager;
pub mod posix;
pub mod quota;

pub use manager::{CacheError, CacheManager, ObjectType, Result};
pub use posix::{PosixCacheManager, PosixTransaction};
pub use quota::{NoopQuotaManager, QuotaManager};
