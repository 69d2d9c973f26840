//! Download collaborator interface.
//!
//! The transport engine lives outside this crate; the cache core only
//! depends on the one-call contract below. An implementation is expected to
//! honour on-the-wire decompression, verify the expected content hash while
//! streaming, and probe between mirror hosts on its own.

use std::io::Write;

use thiserror::Error;

use strato_hash::ContentHash;

/// Failure modes reported by a download collaborator.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network- or server-side failure after host probing gave up.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Streamed bytes did not match the expected content hash.
    #[error("content hash mismatch")]
    HashMismatch,

    /// The destination sink refused bytes.
    #[error("sink error: {0}")]
    Sink(#[from] std::io::Error),
}

/// One fetch request handed to the download collaborator.
pub struct DownloadJob<'a> {
    /// Object URL relative to the repository base, e.g. `/data/ab/cd...C`.
    pub url: String,
    /// Hash the payload must verify against; `None` for unaddressed blobs
    /// such as the signed manifest.
    pub expected_hash: Option<&'a ContentHash>,
    /// Human-readable origin of the request (mount path), for diagnostics.
    pub extra_info: &'a str,
    /// Whether the payload is compressed on the wire.
    pub compressed: bool,
    /// Whether the transport may probe between mirror hosts.
    pub probe_hosts: bool,
}

/// Transport capability consumed by the fetcher and the catalog loader.
pub trait DownloadManager: Send + Sync {
    /// Stream the object named by `job` into `sink`, decompressing and hash
    /// verifying on the fly. The call may block for as long as the transport
    /// needs; timeouts are the implementation's business.
    fn fetch(&self, job: &DownloadJob<'_>, sink: &mut dyn Write) -> Result<(), DownloadError>;
}
