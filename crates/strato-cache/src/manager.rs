//! Abstract cache manager contract.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use strato_hash::ContentHash;

/// Errors surfaced by cache operations.
///
/// The enum mirrors the POSIX error contract of the store: every variant has
/// a stable errno rendition so results can cross thread hand-off channels as
/// plain integers and come back unchanged.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No object with the requested hash is committed.
    #[error("object not found in cache")]
    NotFound,

    /// Write attempted after the cache drained to read-only.
    #[error("cache is read-only")]
    ReadOnly,

    /// The quota cannot accommodate the object or its pin.
    #[error("no space left for object")]
    NoSpace,

    /// The object failed its size or transport integrity check.
    #[error("object data failed verification")]
    BadData,

    /// The cache directory holds an unsupported legacy layout.
    #[error("unsupported legacy cache layout")]
    LegacyLayout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// The (positive) errno value encoding this error.
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::NotFound => libc::ENOENT,
            CacheError::ReadOnly => libc::EROFS,
            CacheError::NoSpace => libc::ENOSPC,
            CacheError::BadData => libc::EIO,
            CacheError::LegacyLayout => libc::EINVAL,
            CacheError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Inverse of [`CacheError::errno`], used when an error comes back over
    /// an integer channel.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => CacheError::NotFound,
            libc::EROFS => CacheError::ReadOnly,
            libc::ENOSPC => CacheError::NoSpace,
            libc::EIO => CacheError::BadData,
            other => CacheError::Io(io::Error::from_raw_os_error(other)),
        }
    }

    pub(crate) fn last_os() -> Self {
        CacheError::Io(io::Error::last_os_error())
    }
}

/// Object classification handed to the quota collaborator at commit time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ObjectType {
    /// Inserted into the regular eviction order.
    #[default]
    Regular,
    /// Pinned until explicitly unpinned; flagged as a catalog.
    Catalog,
    /// Pinned until explicitly unpinned.
    Pinned,
    /// Inserted with higher eviction priority (evicted first).
    Volatile,
}

impl ObjectType {
    /// Whether commit must secure a pin before publishing the object.
    pub fn is_pinned(self) -> bool {
        matches!(self, ObjectType::Catalog | ObjectType::Pinned)
    }
}

/// Transactional object-store capability.
///
/// Reads follow POSIX descriptor semantics: a descriptor returned by
/// [`open`](CacheManager::open) serves the object's original content until
/// [`close`](CacheManager::close), even if the entry is evicted or the cache
/// drains to read-only in between.
///
/// Writes go through a caller-owned transaction value: at most one staging
/// file exists per live transaction, and the object appears under its
/// canonical name only when [`commit_txn`](CacheManager::commit_txn)
/// succeeds. [`open_from_txn`](CacheManager::open_from_txn) gives race-free
/// read access to the staged bytes before the commit.
pub trait CacheManager: Send + Sync {
    /// Backend-specific transaction state, owned by the caller between
    /// `start_txn` and `commit_txn`/`abort_txn`.
    type Txn: Send;

    /// Open a committed object read-only.
    fn open(&self, id: &ContentHash) -> Result<RawFd>;

    /// Size in bytes of the object behind `fd`.
    fn get_size(&self, fd: RawFd) -> Result<u64>;

    /// Positioned read; short reads at EOF are normal, interrupted reads are
    /// retried internally.
    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Independent cursor on the same object.
    fn dup(&self, fd: RawFd) -> Result<RawFd>;

    fn close(&self, fd: RawFd) -> Result<()>;

    /// Begin a transaction targeting `id`. `expected_size` of `None` means
    /// the size is unknown and the commit-time size contract is waived.
    fn start_txn(&self, id: &ContentHash, expected_size: Option<u64>) -> Result<Self::Txn>;

    /// Record description and object type; callable any time before commit.
    fn ctrl_txn(&self, txn: &mut Self::Txn, description: &str, object_type: ObjectType);

    /// Append bytes. Small writes are buffered; a known expected size is
    /// enforced (overshooting fails with the no-space error and only
    /// `reset`/`abort_txn` make further progress).
    fn write(&self, txn: &mut Self::Txn, buf: &[u8]) -> Result<usize>;

    /// Rewind the staging file to empty. Descriptors previously obtained
    /// from `open_from_txn` observe the truncation.
    fn reset(&self, txn: &mut Self::Txn) -> Result<()>;

    /// Flush pending bytes and open the staging file read-only.
    fn open_from_txn(&self, txn: &mut Self::Txn) -> Result<RawFd>;

    /// Discard the transaction; never leaves a staging file behind. The
    /// returned error reflects only the staging unlink.
    fn abort_txn(&self, txn: Self::Txn) -> Result<()>;

    /// Flush, verify the size contract, hand off to the quota collaborator
    /// and atomically publish the staged object under its canonical name.
    fn commit_txn(&self, txn: Self::Txn) -> Result<()>;

    /// Read a whole committed object into memory.
    fn open_mem(&self, id: &ContentHash) -> Result<Vec<u8>> {
        let fd = self.open(id)?;
        let result = (|| {
            let size = self.get_size(fd)? as usize;
            let mut buf = vec![0u8; size];
            let mut done = 0;
            while done < size {
                let n = self.pread(fd, &mut buf[done..], done as u64)?;
                if n == 0 {
                    return Err(CacheError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "object truncated while reading",
                    )));
                }
                done += n;
            }
            Ok(buf)
        })();
        let _ = self.close(fd);
        result
    }

    /// Commit a memory blob under `id` in one step. The caller guarantees
    /// that the hash and the bytes match; used for small objects such as
    /// certificates.
    fn commit_from_mem(&self, id: &ContentHash, data: &[u8], description: &str) -> Result<()> {
        let mut txn = self.start_txn(id, Some(data.len() as u64))?;
        self.ctrl_txn(&mut txn, description, ObjectType::Regular);
        match self.write(&mut txn, data) {
            Ok(n) if n == data.len() => self.commit_txn(txn),
            Ok(_) => {
                let _ = self.abort_txn(txn);
                Err(CacheError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short write into staging file",
                )))
            }
            Err(err) => {
                let _ = self.abort_txn(txn);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_roundtrip() {
        for err in [
            CacheError::NotFound,
            CacheError::ReadOnly,
            CacheError::NoSpace,
            CacheError::BadData,
        ] {
            let errno = err.errno();
            assert_eq!(CacheError::from_errno(errno).errno(), errno);
        }
    }

    #[test]
    fn test_io_errors_keep_their_errno() {
        let err = CacheError::Io(io::Error::from_raw_os_error(libc::EMFILE));
        assert_eq!(err.errno(), libc::EMFILE);
        assert_eq!(CacheError::from_errno(libc::EMFILE).errno(), libc::EMFILE);
    }

    #[test]
    fn test_pinned_types() {
        assert!(ObjectType::Catalog.is_pinned());
        assert!(ObjectType::Pinned.is_pinned());
        assert!(!ObjectType::Regular.is_pinned());
        assert!(!ObjectType::Volatile.is_pinned());
    }
}
