//! Retrieval and verification of conversation packages: download from the
//! S3-compatible store, tar+gzip extraction with traversal and size
//! guards, and the three-level checksum chain.

mod extract;
mod fetch;
mod integrity;

pub use extract::{extract_archive, ExtractedPackage};
pub use fetch::{ObjectStore, ObjectStoreConfig};
pub use integrity::{
    file_sha256_hex, parse_manifest, verify_archive_checksum, verify_manifest, ManifestEntry,
};

use models::ErrorCode;

/// Individual archive members are capped at 2 GiB.
pub const MAX_MEMBER_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// The archive and its uncompressed total are capped at 5 GiB.
pub const MAX_TOTAL_BYTES: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object {key:?} not found in bucket {bucket:?}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object store request failed")]
    StoreUnavailable(#[source] anyhow::Error),
    #[error("{what} is {actual} bytes, exceeding the {limit} byte cap")]
    PayloadTooLarge {
        what: &'static str,
        actual: u64,
        limit: u64,
    },
    #[error("archive violates the package contract: {0}")]
    MalformedArchive(String),
    #[error("archive digest {actual} does not match envelope digest {expected}")]
    ArchiveChecksumMismatch { expected: String, actual: String },
    #[error("checksums.sha256 line {line} is malformed: {content:?}")]
    MalformedManifestLine { line: usize, content: String },
    #[error("checksums.sha256 problem: {0}")]
    ManifestViolation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ObjectNotFound { .. } => ErrorCode::ObjectNotFound,
            Error::StoreUnavailable(_) => ErrorCode::ObjectStoreUnavailable,
            Error::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Error::MalformedArchive(_) => ErrorCode::ValidationError,
            Error::ArchiveChecksumMismatch { .. }
            | Error::MalformedManifestLine { .. }
            | Error::ManifestViolation(_) => ErrorCode::ChecksumMismatch,
            // Local disk trouble is worth another attempt elsewhere.
            Error::Io(_) => ErrorCode::ProcessingFailure,
        }
    }
}
