//! Registry access and offline image packaging for ferry.
//!
//! This crate resolves image references to content digests over the OCI
//! distribution API (`HttpRegistry`), offers an in-memory `MockRegistry` for
//! tests, and packages every distinct digest of a merged document into one
//! OCI-layout tar per digest (`package_images`), fanning out retrievals over
//! a bounded worker pool.

pub mod config;
pub mod http;
pub mod mock;
pub mod oci;
pub mod package;
pub mod reference;

pub use config::{RegistryAuth, RegistryConfig};
pub use http::HttpRegistry;
pub use mock::MockRegistry;
pub use oci::{Platform, MEDIA_TYPES_ACCEPTED};
pub use package::{
    package_images, ImageDigestMap, ImageFailure, PackageOptions, PackagedImage,
};
pub use reference::ImageRef;

use ferry_schema::Digest;
use sha2::{Digest as _, Sha256};
use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("malformed registry response: {0}")]
    Malformed(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("no manifest for platform {platform} in {reference}")]
    PlatformNotFound { platform: String, reference: String },
    #[error("digest mismatch for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("timed out after {secs}s retrieving {reference}")]
    Timeout { reference: String, secs: u64 },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("{} image(s) could not be packaged: {}", .0.len(), summarize(.0))]
    Images(Vec<ImageFailure>),
    #[error("packaging I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packaging cancelled")]
    Cancelled,
}

fn summarize(failures: &[ImageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Manifest bytes exactly as served, with the media type the registry reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedManifest {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Trait for registry backends.
pub trait RegistryClient: Send + Sync {
    /// Resolve the reference's tag to the digest it currently points at.
    fn resolve(&self, image: &ImageRef) -> Result<Digest, RegistryError>;

    /// Retrieve a manifest or index by digest.
    fn fetch_manifest(&self, image: &ImageRef, digest: &Digest) -> Result<FetchedManifest, RegistryError>;

    /// Stream a config or layer blob into `dest`, returning the bytes written.
    ///
    /// The content is not verified here; wrap `dest` in a [`DigestWriter`]
    /// to check it against `digest`.
    fn fetch_blob(
        &self,
        image: &ImageRef,
        digest: &Digest,
        dest: &mut dyn Write,
    ) -> Result<u64, RegistryError>;
}

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> Digest {
    Digest::new(format!("sha256:{}", hex::encode(Sha256::digest(data))))
}

fn require_sha256(key: &str, expected: &Digest) -> Result<(), RegistryError> {
    if expected.algorithm() == "sha256" {
        return Ok(());
    }
    Err(RegistryError::UnsupportedMediaType(format!(
        "cannot verify {} digest for {key}",
        expected.algorithm()
    )))
}

fn compare_digest(key: &str, expected: &Digest, actual: &Digest) -> Result<(), RegistryError> {
    if actual != expected {
        return Err(RegistryError::IntegrityFailure {
            key: key.to_owned(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Check `data` against `expected`. Only sha256 content is verifiable here.
pub fn verify_digest(key: &str, expected: &Digest, data: &[u8]) -> Result<(), RegistryError> {
    require_sha256(key, expected)?;
    compare_digest(key, expected, &sha256_digest(data))
}

/// Writer that hashes everything it forwards, so a blob can be verified
/// while it is spooled to disk.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Check the forwarded bytes against `expected`; returns the inner writer
    /// and the byte count.
    pub fn verify(self, key: &str, expected: &Digest) -> Result<(W, u64), RegistryError> {
        require_sha256(key, expected)?;
        let actual = Digest::new(format!("sha256:{}", hex::encode(self.hasher.finalize())));
        compare_digest(key, expected, &actual)?;
        Ok((self.inner, self.written))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_digest(b"test").as_str(),
            "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn digest_writer_checks_streamed_bytes() {
        let expected = sha256_digest(b"layer-bytes");
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"layer-").unwrap();
        writer.write_all(b"bytes").unwrap();
        let (inner, size) = writer.verify("k", &expected).unwrap();
        assert_eq!(inner, b"layer-bytes");
        assert_eq!(size, 11);

        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"other").unwrap();
        assert!(matches!(
            writer.verify("k", &expected),
            Err(RegistryError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn verify_detects_mismatch() {
        let d = sha256_digest(b"a");
        assert!(verify_digest("k", &d, b"a").is_ok());
        assert!(matches!(
            verify_digest("k", &d, b"b"),
            Err(RegistryError::IntegrityFailure { .. })
        ));
    }
}
