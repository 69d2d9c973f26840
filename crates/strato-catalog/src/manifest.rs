//! Signed manifest ensemble and the signature collaborator interface.

use thiserror::Error;

use strato_hash::ContentHash;

/// Outcome of verifying a signed manifest blob: the references a client
/// needs to mount the tree, plus the certificate that vouched for them.
#[derive(Debug, Clone)]
pub struct ManifestEnsemble {
    /// Root file catalog (catalog-suffixed reference).
    pub catalog_hash: ContentHash,
    /// Signing certificate (certificate-suffixed reference).
    pub certificate_hash: ContentHash,
    /// Certificate bytes, from cache or from the wire.
    pub certificate: Vec<u8>,
    /// Publication time of the manifest, seconds since the epoch.
    pub publish_timestamp: u64,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is malformed")]
    Malformed,

    #[error("manifest signature verification failed")]
    BadSignature,

    #[error("certificate unavailable")]
    NoCertificate,
}

/// Signature collaborator consumed by the catalog loader.
pub trait SignatureVerifier: Send + Sync {
    /// Parse and verify a signed manifest blob.
    ///
    /// `cert_lookup` resolves a certificate hash from the local cache;
    /// implementations call it before fetching the certificate remotely,
    /// which is how the loader keeps its certificate hit/miss counters.
    fn verify_manifest(
        &self,
        bytes: &[u8],
        cert_lookup: &mut dyn FnMut(&ContentHash) -> Option<Vec<u8>>,
    ) -> Result<ManifestEnsemble, ManifestError>;
}
