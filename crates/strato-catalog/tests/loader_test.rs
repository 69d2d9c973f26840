//! Catalog loader behaviour: root location, checksum persistence,
//! certificate caching and the offline fallback.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use strato_cache::{CacheManager, PosixCacheManager, QuotaManager};
use strato_catalog::loader::{CHECKSUM_FILE_PREFIX, MANIFEST_URL};
use strato_catalog::{
    CatalogError, CatalogLoad, CatalogLoader, ManifestEnsemble, ManifestError, SignatureVerifier,
};
use strato_fetch::{DownloadError, DownloadJob, DownloadManager, Fetcher};
use strato_hash::{ContentHash, Suffix};

/// Transport stub serving canned payloads keyed by URL.
struct MockTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn serve(self, url: &str, payload: Vec<u8>) -> Self {
        self.objects.lock().unwrap().insert(url.to_string(), payload);
        self
    }
}

impl DownloadManager for MockTransport {
    fn fetch(&self, job: &DownloadJob<'_>, sink: &mut dyn Write) -> Result<(), DownloadError> {
        match self.objects.lock().unwrap().get(&job.url) {
            Some(payload) => {
                sink.write_all(payload)?;
                Ok(())
            }
            None => Err(DownloadError::Transport(format!(
                "no such object: {}",
                job.url
            ))),
        }
    }
}

/// Verifier stub that accepts any non-empty manifest blob and resolves the
/// certificate through the loader's cache lookup first.
struct MockVerifier {
    catalog_hash: ContentHash,
    certificate_hash: ContentHash,
    certificate: Vec<u8>,
    publish_timestamp: u64,
}

impl SignatureVerifier for MockVerifier {
    fn verify_manifest(
        &self,
        bytes: &[u8],
        cert_lookup: &mut dyn FnMut(&ContentHash) -> Option<Vec<u8>>,
    ) -> Result<ManifestEnsemble, ManifestError> {
        if bytes.is_empty() {
            return Err(ManifestError::Malformed);
        }
        let certificate =
            cert_lookup(&self.certificate_hash).unwrap_or_else(|| self.certificate.clone());
        Ok(ManifestEnsemble {
            catalog_hash: self.catalog_hash,
            certificate_hash: self.certificate_hash,
            certificate,
            publish_timestamp: self.publish_timestamp,
        })
    }
}

/// Quota stub that records pins and can refuse them.
struct PinRecorder {
    refuse: AtomicBool,
    pins: Mutex<Vec<(ContentHash, bool)>>,
}

impl PinRecorder {
    fn new() -> Self {
        Self {
            refuse: AtomicBool::new(false),
            pins: Mutex::new(Vec::new()),
        }
    }
}

impl QuotaManager for PinRecorder {
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
    fn pin(&self, id: &ContentHash, _size: u64, _description: &str, is_catalog: bool) -> bool {
        self.pins.lock().unwrap().push((*id, is_catalog));
        !self.refuse.load(Ordering::SeqCst)
    }
    fn touch(&self, _id: &ContentHash) {}
    fn remove(&self, _id: &ContentHash) {}
    fn unpin(&self, _id: &ContentHash) {}
}

struct Fixture {
    cache: Arc<PosixCacheManager>,
    quota: Arc<PinRecorder>,
    catalog_hash: ContentHash,
    certificate_hash: ContentHash,
    certificate: Vec<u8>,
    catalog_payload: Vec<u8>,
}

impl Fixture {
    fn new(dir: &TempDir) -> Self {
        let catalog_payload = b"root catalog payload".to_vec();
        let catalog_hash = ContentHash::digest_of(&catalog_payload).with_suffix(Suffix::Catalog);
        let certificate = b"-----BEGIN CERTIFICATE-----".to_vec();
        let certificate_hash =
            ContentHash::digest_of(&certificate).with_suffix(Suffix::Certificate);

        let cache = Arc::new(
            PosixCacheManager::create(dir.path().join("cache"), "cataltest", false).unwrap(),
        );
        let quota = Arc::new(PinRecorder::new());
        cache.set_quota_manager(Box::new(SharedQuota(Arc::clone(&quota))));

        Self {
            cache,
            quota,
            catalog_hash,
            certificate_hash,
            certificate,
            catalog_payload,
        }
    }

    fn online_transport(&self) -> Arc<MockTransport> {
        Arc::new(
            MockTransport::new()
                .serve(MANIFEST_URL, b"signed manifest blob".to_vec())
                .serve(&self.catalog_hash.url_path(), self.catalog_payload.clone()),
        )
    }

    fn offline_transport(&self) -> Arc<MockTransport> {
        Arc::new(MockTransport::new())
    }

    fn loader(&self, transport: Arc<MockTransport>) -> CatalogLoader {
        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&self.cache),
            Arc::clone(&transport) as Arc<dyn DownloadManager>,
        ));
        let verifier = Arc::new(MockVerifier {
            catalog_hash: self.catalog_hash,
            certificate_hash: self.certificate_hash,
            certificate: self.certificate.clone(),
            publish_timestamp: 1_700_000_000,
        });
        CatalogLoader::new(
            "cataltest",
            fetcher,
            transport as Arc<dyn DownloadManager>,
            verifier,
        )
    }
}

/// Forwarding wrapper so the test keeps a handle on the installed quota.
struct SharedQuota(Arc<PinRecorder>);

impl QuotaManager for SharedQuota {
    fn max_file_size(&self) -> u64 {
        self.0.max_file_size()
    }
    fn capacity(&self) -> u64 {
        self.0.capacity()
    }
    fn cleanup(&self, target_bytes: u64) -> bool {
        self.0.cleanup(target_bytes)
    }
    fn insert(&self, id: &ContentHash, size: u64, description: &str) {
        self.0.insert(id, size, description)
    }
    fn insert_volatile(&self, id: &ContentHash, size: u64, description: &str) {
        self.0.insert_volatile(id, size, description)
    }
    fn pin(&self, id: &ContentHash, size: u64, description: &str, is_catalog: bool) -> bool {
        self.0.pin(id, size, description, is_catalog)
    }
    fn touch(&self, id: &ContentHash) {
        self.0.touch(id)
    }
    fn remove(&self, id: &ContentHash) {
        self.0.remove(id)
    }
    fn unpin(&self, id: &ContentHash) {
        self.0.unpin(id)
    }
}

#[test]
fn test_fresh_mount_loads_new_root() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    let loader = fixture.loader(fixture.online_transport());

    let path = match loader.load_root().unwrap() {
        CatalogLoad::New(path) => path,
        other => panic!("expected a new root catalog, got {:?}", other),
    };
    assert_eq!(std::fs::read(&path).unwrap(), fixture.catalog_payload);
    assert!(!loader.offline_mode());

    // The catalog went in pinned as a catalog.
    assert_eq!(
        fixture.quota.pins.lock().unwrap().as_slice(),
        &[(fixture.catalog_hash, true)]
    );

    // First session: the certificate was not cached yet.
    assert_eq!(loader.n_certificate_misses(), 1);
    assert_eq!(loader.n_certificate_hits(), 0);
    assert_eq!(
        fixture.cache.open_mem(&fixture.certificate_hash).unwrap(),
        fixture.certificate
    );

    // The checksum hint was persisted atomically.
    let checksum = std::fs::read_to_string(
        fixture
            .cache
            .root()
            .join(format!("{}.cataltest", CHECKSUM_FILE_PREFIX)),
    )
    .unwrap();
    assert_eq!(
        checksum,
        format!("{}T1700000000\n", fixture.catalog_hash.to_hex())
    );
}

#[test]
fn test_remount_uses_cached_root_and_certificate() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    let first = fixture.loader(fixture.online_transport());
    first.load_root().unwrap();

    let second = fixture.loader(fixture.online_transport());
    let load = second.load_root().unwrap();
    assert!(matches!(load, CatalogLoad::Up2Date(_)));
    assert_eq!(
        std::fs::read(load.path()).unwrap(),
        fixture.catalog_payload
    );
    assert!(!second.offline_mode());
    // This time the certificate came from the cache.
    assert_eq!(second.n_certificate_hits(), 1);
    assert_eq!(second.n_certificate_misses(), 0);
}

#[test]
fn test_offline_fallback_pins_cached_root() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    fixture.loader(fixture.online_transport()).load_root().unwrap();

    let offline = fixture.loader(fixture.offline_transport());
    let load = offline.load_root().unwrap();
    assert!(matches!(load, CatalogLoad::Up2Date(_)));
    assert!(offline.offline_mode());
    assert_eq!(
        std::fs::read(load.path()).unwrap(),
        fixture.catalog_payload
    );
}

#[test]
fn test_stale_hint_without_catalog_is_discarded() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    // A hint that points at an object the cache no longer has.
    let bogus = ContentHash::digest_of(b"evicted root").with_suffix(Suffix::Catalog);
    std::fs::write(
        fixture
            .cache
            .root()
            .join(format!("{}.cataltest", CHECKSUM_FILE_PREFIX)),
        format!("{}T1699999999\n", bogus.to_hex()),
    )
    .unwrap();

    let offline = fixture.loader(fixture.offline_transport());
    assert!(matches!(
        offline.load_root(),
        Err(CatalogError::Unavailable(_))
    ));
    assert!(!offline.offline_mode());
}

#[test]
fn test_cached_catalog_is_pinned_on_hit() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    // Pre-populate the cache with the catalog object.
    fixture
        .cache
        .commit_from_mem(&fixture.catalog_hash, &fixture.catalog_payload, "warm")
        .unwrap();

    let loader = fixture.loader(fixture.offline_transport());
    let load = loader
        .load_catalog_cas(&fixture.catalog_hash, "nested catalog")
        .unwrap();
    assert!(matches!(load, CatalogLoad::New(_)));
    assert!(load.path().exists());
    assert_eq!(
        fixture.quota.pins.lock().unwrap().as_slice(),
        &[(fixture.catalog_hash, true)]
    );
}

#[test]
fn test_pin_refusal_evicts_cached_catalog() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    fixture
        .cache
        .commit_from_mem(&fixture.catalog_hash, &fixture.catalog_payload, "warm")
        .unwrap();
    fixture.quota.refuse.store(true, Ordering::SeqCst);

    let loader = fixture.loader(fixture.offline_transport());
    assert!(matches!(
        loader.load_catalog_cas(&fixture.catalog_hash, "nested catalog"),
        Err(CatalogError::NoSpace)
    ));
    // The unpinnable copy was dropped from the cache.
    assert!(!fixture.cache.object_path(&fixture.catalog_hash).exists());
}

#[test]
fn test_missing_catalog_is_fetched_pinned() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    let loader = fixture.loader(fixture.online_transport());

    let load = loader
        .load_catalog_cas(&fixture.catalog_hash, "root catalog")
        .unwrap();
    assert!(matches!(load, CatalogLoad::New(_)));
    assert_eq!(std::fs::read(load.path()).unwrap(), fixture.catalog_payload);
    assert_eq!(
        fixture.quota.pins.lock().unwrap().as_slice(),
        &[(fixture.catalog_hash, true)]
    );
}

#[test]
fn test_read_only_cache_serves_hits_without_pinning() {
    let dir = TempDir::new().unwrap();
    let fixture = Fixture::new(&dir);
    fixture
        .cache
        .commit_from_mem(&fixture.catalog_hash, &fixture.catalog_payload, "warm")
        .unwrap();

    let loader = fixture.loader(fixture.offline_transport());
    loader.drain();
    fixture.cache.teardown_to_readonly();

    let load = loader
        .load_catalog_cas(&fixture.catalog_hash, "after drain")
        .unwrap();
    assert!(matches!(load, CatalogLoad::New(_)));
    // The drained cache swapped in a no-op quota manager; no pin recorded.
    assert!(fixture.quota.pins.lock().unwrap().is_empty());

    // A miss cannot be repaired in read-only mode.
    let missing = ContentHash::digest_of(b"missing catalog").with_suffix(Suffix::Catalog);
    assert!(loader.load_catalog_cas(&missing, "missing").is_err());
}
