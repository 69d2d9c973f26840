//! # strato-fetch
//!
//! The fetcher mediates between the cache manager, the quota manager and a
//! download collaborator: it turns a content hash into a read-only file
//! descriptor, downloading and committing the object on a cache miss.
//!
//! Concurrent requests for the same hash are collapsed. The first thread
//! becomes the *owner* and performs the download; every other thread parks
//! on a per-thread pipe and receives the owner's outcome: an independently
//! duplicated descriptor, or the identical error code.

pub mod download;
pub mod fetcher;

pub use download::{DownloadError, DownloadJob, DownloadManager};
pub use fetcher::Fetcher;
