//! Turns `oci://` strings into references pinned to a digest.

use std::str::FromStr;

use bon::Builder;
use derive_more::derive::Display;
use tracing::{debug, info, warn};

use crate::{
    registry::Distribution,
    Digest, Error, Reference, Version,
};

/// How the digest of a [`ResolvedReference`] was determined.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum ResolutionPath {
    /// The registry reported the digest for the tag without serving the manifest.
    #[display("head check")]
    HeadCheck,

    /// The head check failed, so the manifest was fetched to learn its digest.
    #[display("manifest fallback")]
    ManifestFallback,

    /// The reference already named a digest.
    #[display("digest given")]
    DigestGiven,
}

/// A reference together with the digest the registry reports for it.
///
/// The digest is authoritative: everything downstream addresses the artifact by it,
/// so a tag moving mid-run has no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    /// The reference as the user wrote it.
    pub reference: Reference,

    /// The digest the reference resolved to.
    pub digest: Digest,

    /// How the digest was determined.
    pub path: ResolutionPath,
}

impl ResolvedReference {
    /// Human readable revision: `<tag>@<digest>` for tags, the digest alone otherwise.
    ///
    /// ```
    /// # use ocilayer_lib::{Digest, Reference};
    /// # use ocilayer_lib::resolve::{ResolvedReference, ResolutionPath};
    /// let resolved = ResolvedReference {
    ///     reference: Reference::builder().host("reg.example.com").repository("app").tag("v1").build(),
    ///     digest: Digest::sha256(b"manifest"),
    ///     path: ResolutionPath::HeadCheck,
    /// };
    /// assert_eq!(resolved.revision(), format!("v1@{}", Digest::sha256(b"manifest")));
    /// ```
    pub fn revision(&self) -> String {
        match &self.reference.version {
            Version::Tag(tag) => format!("{tag}@{}", self.digest),
            Version::Digest(_) => self.digest.to_string(),
        }
    }

    /// The reference rewritten to address the resolved digest.
    pub fn pinned(&self) -> Reference {
        Reference::builder()
            .host(&self.reference.host)
            .repository(&self.reference.repository)
            .digest(self.digest.clone())
            .build()
    }
}

/// Resolves references against a registry.
#[derive(Debug, Builder)]
pub struct Resolver<D> {
    /// The registry to resolve against.
    registry: D,
}

impl<D: Distribution> Resolver<D> {
    /// Parse the reference and determine the digest it points at.
    ///
    /// Invalid input fails before the registry is contacted.
    /// The tag list is advisory: a missing tag or a failed listing only warns.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, raw: &str) -> Result<ResolvedReference, Error> {
        debug!(input = raw, "checking image");
        let reference =
            Reference::from_str(raw).map_err(|err| Error::invalid_reference(raw, err))?;
        debug!(repository = %reference.name(), version = %reference.version, "parsed reference");

        self.check_tags(&reference).await;

        let (digest, path) = match &reference.version {
            Version::Digest(digest) => (digest.clone(), ResolutionPath::DigestGiven),
            Version::Tag(_) => self.resolve_tag(&reference).await?,
        };
        debug!(%digest, %path, "resolved digest");

        let resolved = ResolvedReference {
            reference,
            digest,
            path,
        };
        info!("pulling image {}", resolved.revision());
        Ok(resolved)
    }

    async fn check_tags(&self, reference: &Reference) {
        let tags = match self.registry.list_tags(reference).await {
            Ok(tags) => tags,
            Err(err) => {
                warn!(?err, "unable to list tags");
                return;
            }
        };
        debug!(?tags, "listed tags");

        if let Version::Tag(tag) = &reference.version {
            if !tags.iter().any(|listed| listed == tag) {
                warn!(%tag, "tag not found in repository");
            }
        }
    }

    async fn resolve_tag(&self, reference: &Reference) -> Result<(Digest, ResolutionPath), Error> {
        let head = match self.registry.head(reference).await {
            Ok(digest) => return Ok((digest, ResolutionPath::HeadCheck)),
            Err(err) => err,
        };
        warn!(err = ?head, "head check failed; fetching manifest");

        match self.registry.manifest_digest(reference).await {
            Ok(digest) => Ok((digest, ResolutionPath::ManifestFallback)),
            Err(cause) => Err(Error::DigestResolution {
                reference: reference.to_string(),
                head: format!("{head:#}"),
                cause: cause.into(),
            }),
        }
    }
}
