//! Writes the first layer of a resolved artifact to disk.

use std::path::{Path, PathBuf};

use bon::Builder;
use color_eyre::eyre::{eyre, Context, Result};
use futures_lite::StreamExt;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    registry::Distribution, resolve::ResolvedReference, Digest, Error, Layer, Reference,
};

/// The name of the file the layer is written to.
pub const FILENAME: &str = "layer.tar.gz";

/// The prefix of the directory created for each extraction.
pub const DIR_PREFIX: &str = "layer";

/// Unwraps the result, or logs the error at error level and runs the action.
macro_rules! unwrap_log {
    ($expr:expr, $action:expr) => {
        unwrap_log!($expr, $action,)
    };
    ($expr:expr, $action:expr, $($msg:tt)*) => {
        match $expr {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = ?e, $($msg)*);
                $action;
            }
        }
    };
}

/// What an extraction produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    /// The reference as requested.
    pub reference: Reference,

    /// The resolved revision, e.g. `v1@sha256:...`.
    pub revision: String,

    /// The digest of the manifest the layer came from.
    pub digest: Digest,

    /// The layer that was written.
    pub layer: Layer,

    /// The file the layer was written to.
    pub path: PathBuf,
}

impl Report {
    /// Render the report as pretty printed JSON.
    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("render report")
    }
}

/// Extracts the first layer of an artifact.
#[derive(Debug, Builder)]
pub struct Extractor<D> {
    /// The registry the artifact is pulled from.
    registry: D,

    /// The directory under which a fresh `layer*` directory is created.
    /// Created, along with its parents, if it does not exist.
    #[builder(into, default = std::env::temp_dir())]
    output_root: PathBuf,

    /// Whether the layer content must hash to the digest the manifest advertises.
    ///
    /// [`Registry`](crate::registry::Registry) streams are already checked against the
    /// layer digest by `oci-client`; this adds the check for any [`Distribution`].
    #[builder(default)]
    verify_digest: bool,
}

impl<D: Distribution> Extractor<D> {
    /// Fetch the manifest for the resolved digest and write its first layer
    /// to `<output root>/layer<random>/layer.tar.gz`.
    ///
    /// The first layer is used regardless of its media type;
    /// the content is written as the registry serves it, without decompression.
    /// Nothing is left on disk if extraction fails.
    #[tracing::instrument(skip_all, fields(revision = %resolved.revision()))]
    pub async fn extract(&self, resolved: &ResolvedReference) -> Result<Report, Error> {
        let pinned = resolved.pinned();
        let manifest = self
            .registry
            .manifest(&pinned)
            .await
            .map_err(|cause| Error::ManifestFetch {
                reference: pinned.to_string(),
                cause: cause.into(),
            })?;

        enumerate(&manifest.layers);
        let Some(layer) = manifest.layers.first() else {
            return Err(Error::NoLayers {
                reference: pinned.to_string(),
            });
        };
        debug!(%layer, media_type = %layer.media_type, "selected layer");

        tokio::fs::create_dir_all(&self.output_root)
            .await
            .map_err(|err| Error::write(&self.output_root, err))?;

        // Removed on drop; only kept once the layer is written.
        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir_in(&self.output_root)
            .map_err(|err| Error::write(&self.output_root, err))?;

        let content = self.read_blob(&pinned, layer).await?;
        if self.verify_digest {
            verify(layer, &content)?;
        }

        let path = dir.path().join(FILENAME);
        write_layer(&path, &content).await?;
        let dir = dir.keep();
        debug!(dir = %dir.display(), "kept output directory");

        info!("layer written to {}", path.display());
        Ok(Report {
            reference: resolved.reference.clone(),
            revision: resolved.revision(),
            digest: manifest.digest.clone(),
            layer: layer.clone(),
            path,
        })
    }

    async fn read_blob(&self, reference: &Reference, layer: &Layer) -> Result<Vec<u8>, Error> {
        let mut stream = self
            .registry
            .blob(reference, layer)
            .await
            .map_err(|cause| Error::blob_read(&layer.digest, cause))?;

        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| Error::blob_read(&layer.digest, err))?;
            content.extend_from_slice(&chunk);
        }

        // Negative sizes are not advertised sizes.
        if let Ok(expected) = usize::try_from(layer.size) {
            if content.len() != expected {
                let err = eyre!("read {} bytes, manifest advertised {expected}", content.len());
                return Err(Error::blob_read(&layer.digest, err));
            }
        }

        debug!(bytes = content.len(), "read blob");
        Ok(content)
    }
}

/// Log every layer in the manifest; layers that don't parse are skipped.
fn enumerate(layers: &[Layer]) {
    for (index, layer) in layers.iter().enumerate() {
        let digest = unwrap_log!(layer.digest(), continue, index, "parse layer digest");
        let media_type = unwrap_log!(
            layer.media_type(),
            continue,
            index,
            %digest,
            media_type = %layer.media_type,
            "parse layer media type"
        );
        debug!(index, %digest, %media_type, size = layer.size, "layer");
    }
}

/// Only sha256 digests can match; other algorithms are reported as mismatches.
fn verify(layer: &Layer, content: &[u8]) -> Result<(), Error> {
    let actual = Digest::sha256(content);
    if actual.to_string() == layer.digest {
        debug!(%actual, "verified layer digest");
        return Ok(());
    }
    Err(Error::DigestMismatch {
        expected: layer.digest.clone(),
        actual,
    })
}

async fn write_layer(path: &Path, content: &[u8]) -> Result<(), Error> {
    tokio::fs::write(path, content)
        .await
        .map_err(|err| Error::write(path, err))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(|err| Error::write(path, err))?;
    }

    Ok(())
}
