//! Root catalog location and catalog cache management.
//!
//! The loader owns three duties:
//!
//! 1. Locate the current root: read the local checksum hint, fetch and
//!    verify the signed manifest ensemble, and decide between the cached
//!    copy and a fresh download.
//! 2. Load catalogs by hash into the cache, pinned so the eviction policy
//!    never pulls a mounted catalog away.
//! 3. Fall back to the cached root when the network is gone, flagging
//!    offline mode.
//!
//! On a successful root switch the persisted checksum is updated atomically
//! and the signing certificate is cached, so later sessions verify
//! manifests without an extra round trip.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use strato_cache::drain::CallCounter;
use strato_cache::{CacheError, CacheManager, ObjectType, PosixCacheManager};
use strato_fetch::{DownloadJob, DownloadManager, Fetcher};
use strato_hash::{ContentHash, Suffix};

use crate::manifest::{ManifestEnsemble, SignatureVerifier};

/// URL of the signed manifest relative to the repository base.
pub const MANIFEST_URL: &str = "/.cvmfspublished";

/// Persisted checksum hint: `<root>/cvmfschecksum.<repo>` holding
/// `<hex-digest>T<unix-ts>\n`.
pub const CHECKSUM_FILE_PREFIX: &str = "cvmfschecksum";

/// Successful catalog load outcomes; both carry the local catalog path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogLoad {
    /// A catalog not previously attached was placed in the cache.
    New(PathBuf),
    /// The cached copy is current and stays attached.
    Up2Date(PathBuf),
}

impl CatalogLoad {
    pub fn path(&self) -> &Path {
        match self {
            CatalogLoad::New(path) | CatalogLoad::Up2Date(path) => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// The quota cannot pin the catalog.
    #[error("no space to pin catalog")]
    NoSpace,

    /// Neither the network nor the cache can provide the catalog.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Loads and pins catalogs through the cache manager and the fetcher.
pub struct CatalogLoader {
    repo_name: String,
    cache_mgr: Arc<PosixCacheManager>,
    fetcher: Arc<Fetcher<PosixCacheManager>>,
    download_mgr: Arc<dyn DownloadManager>,
    verifier: Arc<dyn SignatureVerifier>,
    calls: CallCounter,
    offline_mode: AtomicBool,
    n_certificate_hits: AtomicU64,
    n_certificate_misses: AtomicU64,
    backoff: Mutex<BackoffThrottle>,
}

impl CatalogLoader {
    pub fn new(
        repo_name: &str,
        fetcher: Arc<Fetcher<PosixCacheManager>>,
        download_mgr: Arc<dyn DownloadManager>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            repo_name: repo_name.to_string(),
            cache_mgr: Arc::clone(fetcher.cache_mgr()),
            fetcher,
            download_mgr,
            verifier,
            calls: CallCounter::new(),
            offline_mode: AtomicBool::new(false),
            n_certificate_hits: AtomicU64::new(0),
            n_certificate_misses: AtomicU64::new(0),
            backoff: Mutex::new(BackoffThrottle::new()),
        }
    }

    /// Whether the last root load fell back to the cached copy for lack of
    /// a verifiable remote manifest.
    pub fn offline_mode(&self) -> bool {
        self.offline_mode.load(Ordering::SeqCst)
    }

    pub fn n_certificate_hits(&self) -> u64 {
        self.n_certificate_hits.load(Ordering::Relaxed)
    }

    pub fn n_certificate_misses(&self) -> u64 {
        self.n_certificate_misses.load(Ordering::Relaxed)
    }

    /// Wait for in-flight loader calls; used on the path to a read-only
    /// cache.
    pub fn drain(&self) {
        self.calls.drain();
    }

    /// Locate and load the current root catalog.
    pub fn load_root(&self) -> Result<CatalogLoad> {
        let _call = self.calls.guard();
        let hint = self.read_checksum_hint();

        let ensemble = match self.fetch_manifest() {
            Ok(ensemble) => ensemble,
            Err(reason) => {
                debug!(error = %reason, "failed to fetch manifest");
                if let Some((cache_hash, _)) = hint {
                    let path = self.cache_mgr.object_path(&cache_hash);
                    self.pin_cached_root(&cache_hash, &path)?;
                    self.offline_mode.store(true, Ordering::SeqCst);
                    warn!(
                        repo = %self.repo_name,
                        "no usable manifest, mounting cached root catalog"
                    );
                    return Ok(CatalogLoad::Up2Date(path));
                }
                return Err(CatalogError::Unavailable(reason));
            }
        };
        self.offline_mode.store(false, Ordering::SeqCst);
        debug!(remote = %ensemble.catalog_hash, "remote checksum");

        if let Some((cache_hash, _)) = hint {
            if cache_hash == ensemble.catalog_hash {
                let path = self.cache_mgr.object_path(&cache_hash);
                self.pin_cached_root(&cache_hash, &path)?;
                return Ok(CatalogLoad::Up2Date(path));
            }
        }

        let description = format!(
            "file catalog at {}:/ ({})",
            self.repo_name, ensemble.catalog_hash
        );
        let load = self.load_catalog_cas(&ensemble.catalog_hash, &description)?;

        // Keep the certificate around for signature checks in later
        // sessions; failure to cache it costs a round trip, nothing more.
        if let Err(err) = self.cache_mgr.commit_from_mem(
            &ensemble.certificate_hash,
            &ensemble.certificate,
            &format!("certificate for {}", self.repo_name),
        ) {
            debug!(error = %err, "failed to cache certificate");
        }
        if let Err(err) = self.persist_checksum(&ensemble) {
            warn!(error = %err, "failed to persist checksum");
            let _ = fs::remove_file(self.checksum_path());
        }
        Ok(load)
    }

    /// Load a catalog by hash: cached copies are pinned in place, misses
    /// are fetched as pinned catalog objects.
    pub fn load_catalog_cas(&self, hash: &ContentHash, description: &str) -> Result<CatalogLoad> {
        let _call = self.calls.guard();
        debug_assert_eq!(hash.suffix(), Suffix::Catalog);
        let cache_path = self.cache_mgr.object_path(hash);

        if self.cache_mgr.alien_cache() {
            // Shared caches are unmanaged; an existing file is taken as-is.
            if cache_path.exists() {
                debug!(%hash, "found catalog in alien cache");
                return Ok(CatalogLoad::New(cache_path));
            }
        } else {
            // Rename-in-place detects a concurrent eviction: once moved
            // aside and pinned, the catalog cannot vanish under us.
            let probe_path = {
                let mut os = cache_path.clone().into_os_string();
                os.push("T");
                PathBuf::from(os)
            };
            if self.cache_mgr.rename(&cache_path, &probe_path).is_ok() {
                debug!(%hash, "found catalog in cache");
                if !self.cache_mgr.is_read_only() {
                    let size = fs::metadata(&probe_path)
                        .map_err(CacheError::Io)?
                        .len();
                    let pinned = self
                        .cache_mgr
                        .quota()
                        .pin(hash, size, description, true);
                    if !pinned {
                        self.cache_mgr.quota().remove(hash);
                        let _ = fs::remove_file(&probe_path);
                        warn!(%hash, "failed to pin cached copy of catalog");
                        return Err(CatalogError::NoSpace);
                    }
                }
                self.cache_mgr.rename(&probe_path, &cache_path)?;
                return Ok(CatalogLoad::New(cache_path));
            }
        }

        if self.cache_mgr.is_read_only() {
            return Err(CatalogError::Unavailable("cache is read-only".into()));
        }

        match self
            .fetcher
            .fetch(hash, None, description, ObjectType::Catalog)
        {
            Ok(fd) => {
                let _ = self.cache_mgr.close(fd);
                self.backoff.lock().unwrap().reset();
                Ok(CatalogLoad::New(cache_path))
            }
            Err(CacheError::NoSpace) => {
                warn!(%hash, "failed to load catalog (no space)");
                self.backoff.lock().unwrap().throttle();
                Err(CatalogError::NoSpace)
            }
            Err(err) => {
                warn!(%hash, error = %err, "unable to load catalog");
                self.backoff.lock().unwrap().throttle();
                Err(err.into())
            }
        }
    }

    /// Release the pin of an unmounted catalog.
    pub fn unload_catalog(&self, hash: &ContentHash) {
        debug!(%hash, "unloading catalog");
        if !self.cache_mgr.is_read_only() {
            self.cache_mgr.quota().unpin(hash);
        }
    }

    fn fetch_manifest(&self) -> std::result::Result<ManifestEnsemble, String> {
        let job = DownloadJob {
            url: MANIFEST_URL.to_string(),
            expected_hash: None,
            extra_info: "manifest",
            compressed: false,
            probe_hosts: true,
        };
        let mut bytes = Vec::new();
        self.download_mgr
            .fetch(&job, &mut bytes)
            .map_err(|err| err.to_string())?;

        let mut cert_lookup = |hash: &ContentHash| match self.cache_mgr.open_mem(hash) {
            Ok(buf) => {
                self.n_certificate_hits.fetch_add(1, Ordering::Relaxed);
                Some(buf)
            }
            Err(_) => {
                self.n_certificate_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        };
        self.verifier
            .verify_manifest(&bytes, &mut cert_lookup)
            .map_err(|err| err.to_string())
    }

    /// Pin a root catalog that is already in the cache (fast path and
    /// offline fallback). Pinning is a no-op once the cache is read-only.
    fn pin_cached_root(&self, hash: &ContentHash, path: &Path) -> Result<()> {
        if self.cache_mgr.is_read_only() {
            return Ok(());
        }
        let size = fs::metadata(path).map_err(CacheError::Io)?.len();
        let description = format!("file catalog at {}:/", self.repo_name);
        if !self.cache_mgr.quota().pin(hash, size, &description, true) {
            warn!(repo = %self.repo_name, "failed to pin cached root catalog");
            return Err(CatalogError::NoSpace);
        }
        Ok(())
    }

    fn checksum_path(&self) -> PathBuf {
        self.cache_mgr
            .root()
            .join(format!("{}.{}", CHECKSUM_FILE_PREFIX, self.repo_name))
    }

    /// The locally persisted `<hex>T<unix-ts>` hint, validated against the
    /// cache: a hint whose catalog is gone is worthless.
    fn read_checksum_hint(&self) -> Option<(ContentHash, u64)> {
        let raw = fs::read_to_string(self.checksum_path()).ok()?;
        let raw = raw.trim_end();
        let (hex, timestamp) = match raw.split_once('T') {
            Some((hex, ts)) => (hex, ts.parse().unwrap_or(0)),
            None => (raw, 0),
        };
        let hash = ContentHash::from_hex(hex, Suffix::Catalog).ok()?;
        if !self.cache_mgr.object_path(&hash).exists() {
            debug!("found checksum hint without catalog");
            return None;
        }
        debug!(published = timestamp, "cached copy publish date");
        Some((hash, timestamp))
    }

    fn persist_checksum(&self, ensemble: &ManifestEnsemble) -> io::Result<()> {
        let tmp_path = self
            .cache_mgr
            .root()
            .join("txn")
            .join(format!("checksum.{}", std::process::id()));
        fs::write(
            &tmp_path,
            format!(
                "{}T{}\n",
                ensemble.catalog_hash.to_hex(),
                ensemble.publish_timestamp
            ),
        )?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp_path, self.checksum_path())
    }
}

/// Randomized exponential backoff applied between failed catalog
/// downloads, so a remount loop does not hammer the stratum.
struct BackoffThrottle {
    delay_ms: u64,
}

impl BackoffThrottle {
    const INIT_MS: u64 = 100;
    const MAX_MS: u64 = 2000;

    fn new() -> Self {
        Self { delay_ms: 0 }
    }

    fn throttle(&mut self) {
        if self.delay_ms == 0 {
            self.delay_ms = Self::INIT_MS;
        }
        let jittered = rand::thread_rng().gen_range(self.delay_ms / 2..=self.delay_ms);
        thread::sleep(Duration::from_millis(jittered));
        self.delay_ms = (self.delay_ms * 2).min(Self::MAX_MS);
    }

    fn reset(&mut self) {
        self.delay_ms = 0;
    }
}
