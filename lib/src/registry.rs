//! Interacts with remote OCI registries.

use std::{pin::Pin, str::FromStr};

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use color_eyre::eyre::{Context, Result};
use derive_more::Debug;
use futures_lite::Stream;
use oci_client::{
    client::ClientConfig,
    manifest::{ImageIndexEntry, OciDescriptor},
    secrets::RegistryAuth,
    Client, Reference as OciReference,
};
use tracing::debug;

use crate::{Authentication, Digest, Layer, Platform, Reference, Version};

/// Convenience alias for a chunk of bytes in a stream.
pub type Chunk = Result<Bytes, std::io::Error>;

/// The compressed content of a blob, as served by the registry.
pub type BlobStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// An image manifest: its digest and its layers, in registry order.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Manifest {
    /// The digest of the manifest document.
    pub digest: Digest,

    /// Layers from the base to the top of the image.
    #[builder(default)]
    pub layers: Vec<Layer>,
}

/// The registry operations the resolver and extractor need.
///
/// Implementations carry their own credentials.
#[async_trait]
pub trait Distribution: Send + Sync {
    /// List the tags in the reference's repository.
    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>>;

    /// Look up the manifest digest for the reference without downloading the manifest.
    async fn head(&self, reference: &Reference) -> Result<Digest>;

    /// Download the manifest the reference points at and report its digest.
    ///
    /// Unlike [`Distribution::manifest`] this does not select a platform out of an index:
    /// the digest is the one the tag maps to, the same one [`Distribution::head`] reports.
    async fn manifest_digest(&self, reference: &Reference) -> Result<Digest>;

    /// Download the image manifest for the reference,
    /// selecting a platform if the reference points at an index.
    async fn manifest(&self, reference: &Reference) -> Result<Manifest>;

    /// Open the content of a layer blob.
    async fn blob(&self, reference: &Reference, layer: &Layer) -> Result<BlobStream>;
}

#[async_trait]
impl<D: Distribution + ?Sized> Distribution for &D {
    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>> {
        (**self).list_tags(reference).await
    }

    async fn head(&self, reference: &Reference) -> Result<Digest> {
        (**self).head(reference).await
    }

    async fn manifest_digest(&self, reference: &Reference) -> Result<Digest> {
        (**self).manifest_digest(reference).await
    }

    async fn manifest(&self, reference: &Reference) -> Result<Manifest> {
        (**self).manifest(reference).await
    }

    async fn blob(&self, reference: &Reference, layer: &Layer) -> Result<BlobStream> {
        (**self).blob(reference, layer).await
    }
}

/// A remote OCI registry, accessed through `oci-client`.
#[derive(Debug)]
pub struct Registry {
    #[debug(skip)]
    client: Client,

    #[debug(skip)]
    auth: RegistryAuth,

    /// The platform selected out of multi-platform indexes.
    platform: Option<Platform>,
}

#[bon::bon]
impl Registry {
    /// Create a new registry client.
    #[builder]
    pub fn new(
        /// The platform to select out of multi-platform indexes.
        /// If unset, the best match for the host platform is used.
        platform: Option<Platform>,

        /// Credentials for the registry. Defaults to anonymous access.
        auth: Option<Authentication>,
    ) -> Self {
        let config = ClientConfig {
            platform_resolver: Some(platform_resolver(platform.clone())),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: auth.as_ref().map(RegistryAuth::from).unwrap_or(RegistryAuth::Anonymous),
            platform,
        }
    }
}

#[async_trait]
impl Distribution for Registry {
    #[tracing::instrument(skip(self), fields(%reference))]
    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>> {
        let oci_ref = OciReference::from(reference);
        self.client
            .list_tags(&oci_ref, &self.auth, None, None)
            .await
            .with_context(|| format!("list tags: {oci_ref}"))
            .map(|response| response.tags)
    }

    #[tracing::instrument(skip(self), fields(%reference))]
    async fn head(&self, reference: &Reference) -> Result<Digest> {
        let oci_ref = OciReference::from(reference);
        let digest = self
            .client
            .fetch_manifest_digest(&oci_ref, &self.auth)
            .await
            .with_context(|| format!("fetch manifest digest: {oci_ref}"))?;
        Digest::from_str(&digest).context("parse manifest digest")
    }

    #[tracing::instrument(skip(self), fields(%reference))]
    async fn manifest_digest(&self, reference: &Reference) -> Result<Digest> {
        let oci_ref = OciReference::from(reference);
        let (_, digest) = self
            .client
            .pull_manifest(&oci_ref, &self.auth)
            .await
            .with_context(|| format!("pull manifest: {oci_ref}"))?;
        Digest::from_str(&digest).context("parse manifest digest")
    }

    #[tracing::instrument(skip(self), fields(%reference, platform = ?self.platform))]
    async fn manifest(&self, reference: &Reference) -> Result<Manifest> {
        let oci_ref = OciReference::from(reference);
        let (manifest, digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth)
            .await
            .with_context(|| format!("pull image manifest: {oci_ref}"))?;
        debug!(%digest, layers = manifest.layers.len(), "pulled manifest");

        Ok(Manifest {
            digest: Digest::from_str(&digest).context("parse manifest digest")?,
            layers: manifest
                .layers
                .into_iter()
                .map(|layer| Layer {
                    digest: layer.digest,
                    media_type: layer.media_type,
                    size: layer.size,
                })
                .collect(),
        })
    }

    #[tracing::instrument(skip(self), fields(%reference, %layer))]
    async fn blob(&self, reference: &Reference, layer: &Layer) -> Result<BlobStream> {
        let oci_ref = OciReference::from(reference);
        let descriptor = OciDescriptor {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
            size: layer.size,
            ..Default::default()
        };
        let stream = self
            .client
            .pull_blob_stream(&oci_ref, &descriptor)
            .await
            .with_context(|| format!("pull blob {} from {oci_ref}", layer.digest))?;
        Ok(Box::pin(stream))
    }
}

impl From<&Reference> for OciReference {
    fn from(reference: &Reference) -> Self {
        match &reference.version {
            Version::Tag(tag) => Self::with_tag(
                reference.host.clone(),
                reference.repository.clone(),
                tag.clone(),
            ),
            Version::Digest(digest) => Self::with_digest(
                reference.host.clone(),
                reference.repository.clone(),
                digest.to_string(),
            ),
        }
    }
}

/// Pick the manifest out of an index: the requested platform if any,
/// otherwise the best ranked entry for the host.
fn platform_resolver(
    target: Option<Platform>,
) -> Box<dyn Fn(&[ImageIndexEntry]) -> Option<String> + Send + Sync> {
    match target {
        Some(target) => Box::new(move |entries: &[ImageIndexEntry]| {
            entries
                .iter()
                .find(|entry| {
                    entry.platform.as_ref().is_some_and(|p| {
                        target.matches(&p.os, &p.architecture, p.variant.as_deref())
                    })
                })
                .map(|entry| entry.digest.clone())
        }),
        None => {
            let host = Platform::host();
            Box::new(move |entries: &[ImageIndexEntry]| {
                entries
                    .iter()
                    .min_by_key(|entry| {
                        let candidate = entry
                            .platform
                            .as_ref()
                            .map(|p| (p.os.as_str(), p.architecture.as_str()));
                        host.host_preference(candidate)
                    })
                    .map(|entry| entry.digest.clone())
            })
        }
    }
}
