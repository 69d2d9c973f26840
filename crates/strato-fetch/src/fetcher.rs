//! Concurrent download deduplication.
//!
//! One process-wide table maps in-flight content hashes to the list of
//! threads waiting for them. The owning thread downloads into a cache
//! transaction and, once the object is committed, hands a duplicated
//! descriptor (or its error code) to every waiter through that waiter's
//! pipe. A waiter therefore never observes success before the cache entry
//! is visible under its canonical name.
//!
//! Per-thread pipes are created lazily and registered with the fetcher so
//! nothing leaks regardless of thread-exit ordering: the pipe pair is closed
//! when the owning thread ends, and a pipe enqueued in a waiter list is kept
//! alive by the list itself until the hand-off happened.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use strato_cache::drain::CallCounter;
use strato_cache::{CacheError, CacheManager, ObjectType, Result};
use strato_hash::ContentHash;

use crate::download::{DownloadJob, DownloadManager};

static NEXT_FETCHER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// One rendezvous pipe per (thread, fetcher) pair, created on first use.
    static WAIT_PIPES: RefCell<HashMap<usize, Arc<WaitPipe>>> = RefCell::new(HashMap::new());
}

/// A unidirectional rendezvous channel carrying one `i64` per hand-off:
/// a file descriptor when non-negative, a negated errno otherwise.
struct WaitPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WaitPipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let retval = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if retval != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    fn send(&self, value: i64) -> io::Result<()> {
        let bytes = value.to_ne_bytes();
        let mut done = 0;
        while done < bytes.len() {
            let n = unsafe {
                libc::write(
                    self.write_fd,
                    bytes[done..].as_ptr() as *const libc::c_void,
                    bytes.len() - done,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            done += n as usize;
        }
        Ok(())
    }

    fn recv(&self) -> io::Result<i64> {
        let mut bytes = [0u8; 8];
        let mut done = 0;
        while done < bytes.len() {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    bytes[done..].as_mut_ptr() as *mut libc::c_void,
                    bytes.len() - done,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "rendezvous pipe closed",
                ));
            }
            done += n as usize;
        }
        Ok(i64::from_ne_bytes(bytes))
    }
}

impl Drop for WaitPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Deduplicating fetch front-end over a cache manager and a download
/// collaborator.
pub struct Fetcher<C: CacheManager> {
    id: usize,
    cache_mgr: Arc<C>,
    download_mgr: Arc<dyn DownloadManager>,
    /// Hashes currently being downloaded, mapped to the pipes of the
    /// threads queued behind the owner.
    inflight: Mutex<HashMap<ContentHash, Vec<Arc<WaitPipe>>>>,
    /// All pipes handed out to threads, reclaimed on drop for threads that
    /// outlive the fetcher and pruned as threads exit.
    registry: Mutex<Vec<Weak<WaitPipe>>>,
    num_downloads: AtomicU64,
    calls: CallCounter,
}

impl<C: CacheManager> Fetcher<C> {
    pub fn new(cache_mgr: Arc<C>, download_mgr: Arc<dyn DownloadManager>) -> Self {
        Self {
            id: NEXT_FETCHER_ID.fetch_add(1, Ordering::Relaxed),
            cache_mgr,
            download_mgr,
            inflight: Mutex::new(HashMap::new()),
            registry: Mutex::new(Vec::new()),
            num_downloads: AtomicU64::new(0),
            calls: CallCounter::new(),
        }
    }

    pub fn cache_mgr(&self) -> &Arc<C> {
        &self.cache_mgr
    }

    /// Number of downloads this fetcher has performed.
    pub fn num_downloads(&self) -> u64 {
        self.num_downloads.load(Ordering::Relaxed)
    }

    /// Wait until every fetch call that is currently in flight has
    /// finished. One-way; used on the path to a read-only cache.
    pub fn drain(&self) {
        self.calls.drain();
        self.registry
            .lock()
            .unwrap()
            .retain(|pipe| pipe.upgrade().is_some());
    }

    /// Return a read-only descriptor for `id`, downloading on a miss.
    ///
    /// `expected_size` of `None` waives the size contract (catalog sizes
    /// are not always known up front). All concurrent callers for the same
    /// hash observe the same outcome.
    pub fn fetch(
        &self,
        id: &ContentHash,
        expected_size: Option<u64>,
        description: &str,
        object_type: ObjectType,
    ) -> Result<RawFd> {
        let _call = self.calls.guard();

        match self.cache_mgr.open(id) {
            Ok(fd) => return Ok(fd),
            Err(CacheError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let pipe = self.thread_pipe()?;
        {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(waiters) = inflight.get_mut(id) {
                waiters.push(Arc::clone(&pipe));
                drop(inflight);
                debug!(%id, info = description, "waiting for download by peer");
                let value = pipe.recv().map_err(CacheError::Io)?;
                debug!(%id, value, "received result from peer thread");
                return if value >= 0 {
                    Ok(value as RawFd)
                } else {
                    Err(CacheError::from_errno(-value as i32))
                };
            }
            // First for this hash; a prior owner may have committed between
            // the open above and taking the lock.
            match self.cache_mgr.open(id) {
                Ok(fd) => return Ok(fd),
                Err(CacheError::NotFound) => {}
                Err(err) => return Err(err),
            }
            inflight.insert(*id, Vec::new());
        }

        let result = self.download_into_cache(id, expected_size, description, object_type);
        self.signal_waiting_threads(id, &result);
        result
    }

    /// Owner path: stage, download, commit, reopen.
    fn download_into_cache(
        &self,
        id: &ContentHash,
        expected_size: Option<u64>,
        description: &str,
        object_type: ObjectType,
    ) -> Result<RawFd> {
        let mut txn = self.cache_mgr.start_txn(id, expected_size)?;
        self.cache_mgr.ctrl_txn(&mut txn, description, object_type);

        self.num_downloads.fetch_add(1, Ordering::Relaxed);
        let job = DownloadJob {
            url: id.url_path(),
            expected_hash: Some(id),
            extra_info: description,
            compressed: true,
            probe_hosts: true,
        };
        debug!(url = %job.url, info = description, "miss, downloading");

        let downloaded = {
            let mut sink = TxnSink {
                cache_mgr: self.cache_mgr.as_ref(),
                txn: &mut txn,
            };
            self.download_mgr.fetch(&job, &mut sink)
        };
        if let Err(err) = downloaded {
            warn!(%id, info = description, error = %err, "failed to fetch");
            if let Err(abort_err) = self.cache_mgr.abort_txn(txn) {
                warn!(%id, error = %abort_err, "failed to clean up transaction");
            }
            return Err(CacheError::BadData);
        }

        self.cache_mgr.commit_txn(txn)?;
        self.cache_mgr.open(id)
    }

    /// Hand the outcome to every queued waiter and retire the table entry.
    fn signal_waiting_threads(&self, id: &ContentHash, result: &Result<RawFd>) {
        let value = match result {
            Ok(fd) => *fd as i64,
            Err(err) => -(err.errno() as i64),
        };
        let mut inflight = self.inflight.lock().unwrap();
        let waiters = inflight.remove(id).unwrap_or_default();
        for waiter in waiters {
            let handoff = if value >= 0 {
                match self.cache_mgr.dup(value as RawFd) {
                    Ok(dup_fd) => dup_fd as i64,
                    Err(err) => -(err.errno() as i64),
                }
            } else {
                value
            };
            if let Err(err) = waiter.send(handoff) {
                debug!(%id, error = %err, "waiter vanished before hand-off");
                if handoff >= 0 {
                    let _ = self.cache_mgr.close(handoff as RawFd);
                }
            }
        }
    }

    /// The calling thread's rendezvous pipe for this fetcher.
    fn thread_pipe(&self) -> Result<Arc<WaitPipe>> {
        WAIT_PIPES.with(|pipes| {
            let mut pipes = pipes.borrow_mut();
            if let Some(pipe) = pipes.get(&self.id) {
                return Ok(Arc::clone(pipe));
            }
            let pipe = Arc::new(WaitPipe::new().map_err(CacheError::Io)?);
            let mut registry = self.registry.lock().unwrap();
            registry.retain(|entry| entry.upgrade().is_some());
            registry.push(Arc::downgrade(&pipe));
            drop(registry);
            pipes.insert(self.id, Arc::clone(&pipe));
            Ok(pipe)
        })
    }
}

/// Adapter sinking downloaded bytes into the open transaction.
struct TxnSink<'a, C: CacheManager> {
    cache_mgr: &'a C,
    txn: &'a mut C::Txn,
}

impl<C: CacheManager> io::Write for TxnSink<'_, C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cache_mgr
            .write(self.txn, buf)
            .map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
