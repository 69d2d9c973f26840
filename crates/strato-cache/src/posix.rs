//! Cache manager backed by a local directory tree.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/00 .. <root>/ff      object prefix directories
//! <root>/txn/                 staging files (unique temp names)
//! <root>/quarantaine/         forensic copies of size-mismatched downloads
//! <root>/running.<repo>       liveness marker, removed on read-only drain
//! ```
//!
//! Objects are staged under `txn/` and atomically renamed into their
//! hash-derived name at commit, so a canonical name never exposes a partial
//! write. An *alien* cache is a directory shared between hosts: it is
//! created group-accessible, committed files are made group-readable, and
//! when the directory sits on NFS the atomic rename is replaced by
//! link+unlink with peer commits of identical content treated as success.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use strato_hash::ContentHash;

use crate::manager::{CacheError, CacheManager, ObjectType, Result};
use crate::quota::{NoopQuotaManager, QuotaManager};

/// Objects at least this large trigger an opportunistic cleanup round
/// before their transaction is opened.
pub const BIG_FILE_BYTES: u64 = 25 * 1024 * 1024;

const TXN_BUFFER_BYTES: usize = 4096;
const LEGACY_MARKER: &str = "cvmfscatalog.cache";
const DRAIN_POLL: Duration = Duration::from_millis(50);

#[cfg(target_os = "linux")]
const NFS_SUPER_MAGIC: i64 = 0x6969;

/// Caller-owned state of one staged write.
///
/// Exactly one staging file exists per live transaction. Dropping the value
/// without committing closes the staging descriptor and unlinks the staging
/// file, so `txn/` stays clean across error paths.
pub struct PosixTransaction {
    id: ContentHash,
    final_path: PathBuf,
    tmp_path: PathBuf,
    fd: RawFd,
    expected_size: Option<u64>,
    size: u64,
    object_type: ObjectType,
    description: String,
    buffer: Box<[u8; TXN_BUFFER_BYTES]>,
    buf_pos: usize,
    staged: bool,
    _inflight: InflightGuard,
}

impl Drop for PosixTransaction {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
        if self.staged {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

struct InflightGuard(Arc<AtomicI32>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cache manager over a POSIX directory tree.
pub struct PosixCacheManager {
    root: PathBuf,
    repo_name: String,
    alien_cache: bool,
    alien_cache_on_nfs: bool,
    reports_correct_filesize: bool,
    read_only: AtomicBool,
    inflight_txns: Arc<AtomicI32>,
    quota_mgr: RwLock<Box<dyn QuotaManager>>,
}

impl PosixCacheManager {
    /// Create the directory layout and the liveness marker, refusing legacy
    /// cache directories. `alien_cache` relaxes permissions for cross-host
    /// sharing and enables the NFS rename strategy when applicable.
    pub fn create(root: impl Into<PathBuf>, repo_name: &str, alien_cache: bool) -> Result<Self> {
        let root = root.into();
        let dir_mode = if alien_cache { 0o770 } else { 0o700 };
        make_cache_directories(&root, dir_mode)?;
        debug!(root = %root.display(), "cache directory structure created");

        if root.join(LEGACY_MARKER).exists() {
            warn!(root = %root.display(), "refusing legacy cache directory");
            return Err(CacheError::LegacyLayout);
        }

        let alien_cache_on_nfs = alien_cache && is_on_nfs(&root);
        if alien_cache_on_nfs {
            info!(root = %root.display(), "alien cache is on NFS");
        }

        fs::write(root.join(format!("running.{}", repo_name)), b"")?;

        Ok(Self {
            root,
            repo_name: repo_name.to_string(),
            alien_cache,
            alien_cache_on_nfs,
            reports_correct_filesize: !alien_cache,
            read_only: AtomicBool::new(false),
            inflight_txns: Arc::new(AtomicI32::new(0)),
            quota_mgr: RwLock::new(Box::new(NoopQuotaManager)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    pub fn alien_cache(&self) -> bool {
        self.alien_cache
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Absolute canonical path of a (committed or future) object.
    pub fn object_path(&self, id: &ContentHash) -> PathBuf {
        self.root.join(id.cache_path())
    }

    /// Install an eviction policy. Replaces the no-op default.
    pub fn set_quota_manager(&self, quota_mgr: Box<dyn QuotaManager>) {
        *self.quota_mgr.write().unwrap() = quota_mgr;
    }

    /// Shared access to the active quota manager.
    pub fn quota(&self) -> RwLockReadGuard<'_, Box<dyn QuotaManager>> {
        self.quota_mgr.read().unwrap()
    }

    /// Move a file within the cache, honouring the alien-on-NFS strategy:
    /// there `rename` becomes link+unlink, a racing byte-identical commit
    /// from another host (`EEXIST` on the link) counts as success, and a
    /// failed unlink of the old name is reported but does not invalidate
    /// the move.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if !self.alien_cache_on_nfs {
            return fs::rename(from, to).map_err(CacheError::Io);
        }
        match fs::hard_link(from, to) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %to.display(), "already present, keeping peer copy");
            }
            Err(err) => return Err(CacheError::Io(err)),
        }
        if let Err(err) = fs::remove_file(from) {
            warn!(path = %from.display(), error = %err, "stale staging name left behind");
        }
        Ok(())
    }

    /// One-way transition into read-only mode: refuse new transactions,
    /// wait for in-flight ones, neutralise the quota collaborator and drop
    /// the liveness marker. Existing read descriptors stay valid.
    pub fn teardown_to_readonly(&self) {
        self.read_only.store(true, Ordering::SeqCst);
        while self.inflight_txns.load(Ordering::SeqCst) != 0 {
            thread::sleep(DRAIN_POLL);
        }
        *self.quota_mgr.write().unwrap() = Box::new(NoopQuotaManager);
        let _ = fs::remove_file(self.root.join(format!("running.{}", self.repo_name)));
        info!(repo = %self.repo_name, "switched to read-only cache mode");
    }

    fn create_staging_file(&self) -> Result<(RawFd, PathBuf)> {
        let template = self.root.join("txn").join("fetchXXXXXX");
        let ctemplate = path_to_cstring(&template)?;
        let raw = ctemplate.into_raw();
        let fd = unsafe { libc::mkstemp(raw) };
        let ctemplate = unsafe { CString::from_raw(raw) };
        if fd < 0 {
            return Err(CacheError::last_os());
        }
        let path = PathBuf::from(std::ffi::OsString::from_vec(ctemplate.into_bytes()));
        Ok((fd, path))
    }

    fn flush(txn: &mut PosixTransaction) -> Result<()> {
        if txn.buf_pos == 0 {
            return Ok(());
        }
        write_all_fd(txn.fd, &txn.buffer[..txn.buf_pos])?;
        txn.buf_pos = 0;
        Ok(())
    }

    fn quarantine(&self, txn: &PosixTransaction) {
        let target = self.root.join("quarantaine").join(txn.id.to_hex());
        if let Err(err) = fs::copy(&txn.tmp_path, &target) {
            warn!(path = %txn.tmp_path.display(), error = %err,
                  "failed to move staging file to quarantaine");
        }
    }
}

impl CacheManager for PosixCacheManager {
    type Txn = PosixTransaction;

    fn open(&self, id: &ContentHash) -> Result<RawFd> {
        let path = self.object_path(id);
        match open_rdonly(&path) {
            Ok(fd) => {
                debug!(path = %path.display(), fd, "hit");
                self.quota().touch(id);
                Ok(fd)
            }
            Err(err) => {
                debug!(path = %path.display(), errno = err.errno(), "miss");
                Err(err)
            }
        }
    }

    fn get_size(&self, fd: RawFd) -> Result<u64> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let retval = unsafe { libc::fstat(fd, &mut st) };
        if retval != 0 {
            return Err(CacheError::last_os());
        }
        assert!(st.st_size >= 0);
        Ok(st.st_size as u64)
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> Result<usize> {
        loop {
            let n = unsafe {
                libc::pread(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(CacheError::Io(err));
        }
    }

    fn dup(&self, fd: RawFd) -> Result<RawFd> {
        let new_fd = unsafe { libc::dup(fd) };
        if new_fd < 0 {
            return Err(CacheError::last_os());
        }
        Ok(new_fd)
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        let retval = unsafe { libc::close(fd) };
        if retval != 0 {
            return Err(CacheError::last_os());
        }
        Ok(())
    }

    fn start_txn(&self, id: &ContentHash, expected_size: Option<u64>) -> Result<PosixTransaction> {
        // Increment before the mode check: a drain that observes zero must
        // be sure no transaction can slip in behind its back.
        self.inflight_txns.fetch_add(1, Ordering::SeqCst);
        let inflight = InflightGuard(Arc::clone(&self.inflight_txns));

        if self.read_only.load(Ordering::SeqCst) {
            return Err(CacheError::ReadOnly);
        }

        if let Some(size) = expected_size {
            let quota = self.quota();
            if size > quota.max_file_size() {
                debug!(
                    requested = size,
                    max = quota.max_file_size(),
                    "object too big for managed cache"
                );
                return Err(CacheError::NoSpace);
            }
            if size > BIG_FILE_BYTES {
                let capacity = quota.capacity();
                if capacity >= size && capacity > 0 {
                    quota.cleanup(capacity - size);
                }
            }
        }

        let (fd, tmp_path) = self.create_staging_file()?;
        debug!(path = %tmp_path.display(), fd, "start transaction");
        Ok(PosixTransaction {
            id: *id,
            final_path: self.object_path(id),
            tmp_path,
            fd,
            expected_size,
            size: 0,
            object_type: ObjectType::Regular,
            description: String::new(),
            buffer: Box::new([0u8; TXN_BUFFER_BYTES]),
            buf_pos: 0,
            staged: true,
            _inflight: inflight,
        })
    }

    fn ctrl_txn(&self, txn: &mut PosixTransaction, description: &str, object_type: ObjectType) {
        txn.description = description.to_string();
        txn.object_type = object_type;
    }

    fn write(&self, txn: &mut PosixTransaction, buf: &[u8]) -> Result<usize> {
        if let Some(expected) = txn.expected_size {
            if txn.size + buf.len() as u64 > expected {
                return Err(CacheError::NoSpace);
            }
        }
        let mut written = 0;
        while written < buf.len() {
            if txn.buf_pos == TXN_BUFFER_BYTES {
                if let Err(err) = Self::flush(txn) {
                    txn.size += written as u64;
                    if written > 0 {
                        return Ok(written);
                    }
                    return Err(err);
                }
            }
            let batch = (buf.len() - written).min(TXN_BUFFER_BYTES - txn.buf_pos);
            txn.buffer[txn.buf_pos..txn.buf_pos + batch]
                .copy_from_slice(&buf[written..written + batch]);
            txn.buf_pos += batch;
            written += batch;
        }
        txn.size += written as u64;
        Ok(written)
    }

    fn reset(&self, txn: &mut PosixTransaction) -> Result<()> {
        txn.buf_pos = 0;
        txn.size = 0;
        let retval = unsafe { libc::lseek(txn.fd, 0, libc::SEEK_SET) };
        if retval < 0 {
            return Err(CacheError::last_os());
        }
        let retval = unsafe { libc::ftruncate(txn.fd, 0) };
        if retval < 0 {
            return Err(CacheError::last_os());
        }
        Ok(())
    }

    fn open_from_txn(&self, txn: &mut PosixTransaction) -> Result<RawFd> {
        Self::flush(txn)?;
        open_rdonly(&txn.tmp_path)
    }

    fn abort_txn(&self, mut txn: PosixTransaction) -> Result<()> {
        debug!(path = %txn.tmp_path.display(), "abort transaction");
        unsafe { libc::close(txn.fd) };
        txn.fd = -1;
        txn.staged = false;
        fs::remove_file(&txn.tmp_path).map_err(CacheError::Io)
    }

    fn commit_txn(&self, mut txn: PosixTransaction) -> Result<()> {
        debug!(
            final_path = %txn.final_path.display(),
            tmp_path = %txn.tmp_path.display(),
            "commit transaction"
        );

        let flushed = Self::flush(&mut txn);
        unsafe { libc::close(txn.fd) };
        txn.fd = -1;
        flushed?;

        if let Some(expected) = txn.expected_size {
            if txn.size != expected && (self.reports_correct_filesize || txn.size != 0) {
                warn!(
                    id = %txn.id,
                    expected,
                    got = txn.size,
                    "size check failure"
                );
                self.quarantine(&txn);
                return Err(CacheError::BadData);
            }
        }

        if txn.object_type.is_pinned() {
            let pinned = self.quota().pin(
                &txn.id,
                txn.size,
                &txn.description,
                txn.object_type == ObjectType::Catalog,
            );
            if !pinned {
                debug!(id = %txn.id, "commit failed: cannot pin");
                return Err(CacheError::NoSpace);
            }
        }

        if self.alien_cache {
            if let Err(err) = fs::set_permissions(&txn.tmp_path, fs::Permissions::from_mode(0o660))
            {
                if txn.object_type.is_pinned() {
                    self.quota().remove(&txn.id);
                }
                return Err(CacheError::Io(err));
            }
        }

        match self.rename(&txn.tmp_path, &txn.final_path) {
            Ok(()) => {
                txn.staged = false;
                match txn.object_type {
                    ObjectType::Regular => {
                        self.quota().insert(&txn.id, txn.size, &txn.description);
                    }
                    ObjectType::Volatile => {
                        self.quota()
                            .insert_volatile(&txn.id, txn.size, &txn.description);
                    }
                    ObjectType::Catalog | ObjectType::Pinned => {}
                }
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "commit failed");
                if txn.object_type.is_pinned() {
                    self.quota().remove(&txn.id);
                }
                Err(err)
            }
        }
    }
}

fn make_cache_directories(root: &Path, mode: u32) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(mode);
    builder.create(root)?;
    fs::set_permissions(root, fs::Permissions::from_mode(mode))?;

    let mut subdirs: Vec<String> = vec!["txn".into(), "quarantaine".into()];
    subdirs.extend((0..=0xffu32).map(|i| format!("{:02x}", i)));
    for sub in subdirs {
        let dir = root.join(sub);
        if !dir.exists() {
            let mut builder = fs::DirBuilder::new();
            builder.mode(mode);
            builder.create(&dir)?;
        }
    }
    Ok(())
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| CacheError::Io(io::Error::from(io::ErrorKind::InvalidInput)))
}

fn open_rdonly(path: &Path) -> Result<RawFd> {
    let cpath = path_to_cstring(path)?;
    loop {
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd >= 0 {
            return Ok(fd);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ENOENT) => return Err(CacheError::NotFound),
            _ => return Err(CacheError::Io(err)),
        }
    }
}

fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(CacheError::Io(err));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn is_on_nfs(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let retval = unsafe { libc::statfs(cpath.as_ptr(), &mut buf) };
    retval == 0 && buf.f_type as i64 == NFS_SUPER_MAGIC
}

#[cfg(not(target_os = "linux"))]
fn is_on_nfs(_path: &Path) -> bool {
    false
}
