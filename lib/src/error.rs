//! Failures surfaced by resolution and extraction.

use std::path::PathBuf;

use derive_more::derive::Display;

use crate::Digest;

/// The underlying cause of an [`Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Typed failures from [`crate::resolve::Resolver`] and [`crate::extract::Extractor`].
///
/// None of these are retried; the caller decides whether to exit.
/// The message of each variant describes what was being attempted,
/// the cause is available through [`std::error::Error::source`].
#[derive(Debug, Display)]
pub enum Error {
    /// The input is not a valid `oci://` reference. No registry call was made.
    #[display("invalid reference {input:?}")]
    InvalidReference { input: String, cause: BoxError },

    /// The registry could not tell us which digest a tag points at.
    #[display("resolve digest for {reference}: head check failed ({head}), then manifest fetch failed")]
    DigestResolution {
        reference: String,
        head: String,
        cause: BoxError,
    },

    /// The manifest could not be fetched.
    #[display("fetch manifest for {reference}")]
    ManifestFetch { reference: String, cause: BoxError },

    /// The manifest lists no layers.
    #[display("manifest for {reference} has no layers")]
    NoLayers { reference: String },

    /// The layer blob could not be read to completion.
    #[display("read blob {digest}")]
    BlobRead { digest: String, cause: BoxError },

    /// The layer blob does not hash to the digest advertised in the manifest.
    #[display("blob digest mismatch: manifest advertised {expected}, content hashed to {actual}")]
    DigestMismatch { expected: String, actual: Digest },

    /// The output could not be written.
    #[display("write {}", path.display())]
    Write { path: PathBuf, cause: std::io::Error },
}

impl Error {
    pub(crate) fn invalid_reference(input: &str, cause: impl Into<BoxError>) -> Self {
        Self::InvalidReference {
            input: input.to_string(),
            cause: cause.into(),
        }
    }

    pub(crate) fn blob_read(digest: &str, cause: impl Into<BoxError>) -> Self {
        Self::BlobRead {
            digest: digest.to_string(),
            cause: cause.into(),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, cause: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            cause,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidReference { cause, .. }
            | Error::DigestResolution { cause, .. }
            | Error::ManifestFetch { cause, .. }
            | Error::BlobRead { cause, .. } => Some(&**cause as &(dyn std::error::Error + 'static)),
            Error::Write { cause, .. } => Some(cause),
            Error::NoLayers { .. } | Error::DigestMismatch { .. } => None,
        }
    }
}
