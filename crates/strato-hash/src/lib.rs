//! # strato-hash
//!
//! Content hash value type for the stratofs client cache.
//!
//! Every object in the cache is named by the cryptographic digest of its
//! (decompressed) bytes. A one-byte suffix discriminates the payload kind on
//! the wire; it takes part in hash equality but not in cache path derivation.
//!
//! ## Path layout
//!
//! The hex digest is split after the first byte, which spreads objects over
//! up to 256 prefix directories:
//!
//! ```text
//! ab/cdef0123...        # cache-relative path
//! /data/ab/cdef0123...C # object URL (suffix letter appended when present)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of the digest in bytes.
pub const DIGEST_BYTES: usize = 32;

/// Errors from parsing a hex rendition of a hash.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashError {
    #[error("digest must be {} hex characters, got {0}", DIGEST_BYTES * 2)]
    BadLength(usize),

    #[error("digest contains a non-hex character")]
    BadDigit,
}

pub type Result<T> = std::result::Result<T, HashError>;

/// Payload kind discriminator appended to object names on the wire.
///
/// The suffix letter is part of the object URL but never of the cache path:
/// a catalog and a regular blob with the same digest share one cache entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Suffix {
    /// Regular data object.
    #[default]
    None,
    /// File catalog.
    Catalog,
    /// Signing certificate.
    Certificate,
    /// Partial file chunk.
    Partial,
}

impl Suffix {
    /// Wire letter for this suffix, if any.
    pub fn as_char(self) -> Option<char> {
        match self {
            Suffix::None => None,
            Suffix::Catalog => Some('C'),
            Suffix::Certificate => Some('X'),
            Suffix::Partial => Some('P'),
        }
    }
}

/// A content hash: fixed-width digest plus payload-kind suffix.
///
/// Equality and ordering are byte-wise over the digest first; the suffix
/// participates in equality so a catalog reference never compares equal to a
/// plain data reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash {
    digest: [u8; DIGEST_BYTES],
    suffix: Suffix,
}

impl ContentHash {
    pub fn new(digest: [u8; DIGEST_BYTES], suffix: Suffix) -> Self {
        Self { digest, suffix }
    }

    /// Digest of `data`, with no suffix. The cache itself never recomputes
    /// digests; this is for callers that produce or verify objects.
    pub fn digest_of(data: &[u8]) -> Self {
        Self {
            digest: *blake3::hash(data).as_bytes(),
            suffix: Suffix::None,
        }
    }

    pub fn digest(&self) -> &[u8; DIGEST_BYTES] {
        &self.digest
    }

    pub fn suffix(&self) -> Suffix {
        self.suffix
    }

    /// Same digest, different payload kind.
    pub fn with_suffix(&self, suffix: Suffix) -> Self {
        Self {
            digest: self.digest,
            suffix,
        }
    }

    /// Lower-case hex rendition of the digest, without the suffix letter.
    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(DIGEST_BYTES * 2);
        for byte in &self.digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    /// Parse a hex digest. `suffix` tags the payload kind of the reference.
    pub fn from_hex(hex: &str, suffix: Suffix) -> Result<Self> {
        if hex.len() != DIGEST_BYTES * 2 {
            return Err(HashError::BadLength(hex.len()));
        }
        let mut digest = [0u8; DIGEST_BYTES];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).map_err(|_| HashError::BadDigit)?;
            digest[i] = u8::from_str_radix(s, 16).map_err(|_| HashError::BadDigit)?;
        }
        Ok(Self { digest, suffix })
    }

    /// Cache-relative path: first byte as directory, remainder as file name.
    /// The suffix never shows up here.
    pub fn cache_path(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}", &hex[..2], &hex[2..])
    }

    /// Object URL as requested from the remote store, suffix letter included.
    pub fn url_path(&self) -> String {
        let mut url = format!("/data/{}", self.cache_path());
        if let Some(letter) = self.suffix.as_char() {
            url.push(letter);
        }
        url
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())?;
        if let Some(letter) = self.suffix.as_char() {
            write!(f, "{}", letter)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}
