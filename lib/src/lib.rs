//! Core library for `ocilayer`, a tool for pulling the first layer of an artifact out of an OCI registry.
//!
//! The workflow has two halves:
//! - [`resolve::Resolver`] turns an `oci://` string into a [`resolve::ResolvedReference`],
//!   pinning tags to the digest the registry reports.
//! - [`extract::Extractor`] fetches the manifest for that digest and writes its first layer to disk.
//!
//! Both talk to the registry through the [`registry::Distribution`] trait,
//! which [`registry::Registry`] implements on top of `oci-client`.

use bon::Builder;
use color_eyre::{
    eyre::{self, bail, eyre, Context},
    Result, Section, SectionExt,
};
use derive_more::derive::Display;
use itertools::Itertools;
use regex::Regex;
use serde::{Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::{str::FromStr, sync::LazyLock};
use strum::{AsRefStr, EnumIter, IntoEnumIterator};
use tap::Pipe;

mod auth;
pub mod error;
pub mod extract;
pub mod platform;
pub mod registry;
pub mod resolve;

pub use auth::Authentication;
pub use error::Error;
pub use platform::Platform;

/// Host names: dot separated labels with an optional port.
static HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$")
        .expect("host pattern must compile")
});

/// Repository paths, per the distribution spec's `<name>` grammar.
static REPOSITORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$")
        .expect("repository pattern must compile")
});

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern must compile")
});

static ALGORITHM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*$").expect("algorithm pattern must compile")
});

/// A content-addressable digest in the format `algorithm:hash`.
///
/// ```
/// # use std::str::FromStr;
/// let digest = ocilayer_lib::Digest::from_str("sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4").expect("parse digest");
/// assert_eq!(digest.algorithm, "sha256");
/// assert_eq!(digest.as_hex(), "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// The hashing algorithm used (e.g. "sha256")
    pub algorithm: String,

    /// The raw hash bytes
    pub hash: Vec<u8>,
}

impl Digest {
    /// The SHA256 algorithm
    pub const SHA256: &'static str = "sha256";

    /// Hash the content with SHA256.
    ///
    /// ```
    /// let digest = ocilayer_lib::Digest::sha256(b"");
    /// assert_eq!(digest.to_string(), "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    /// ```
    pub fn sha256(content: impl AsRef<[u8]>) -> Self {
        Self {
            algorithm: Self::SHA256.to_string(),
            hash: Sha256::digest(content.as_ref()).to_vec(),
        }
    }

    /// Returns the hash as a hex string
    pub fn as_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

impl FromStr for Digest {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            eyre!("invalid digest format: missing algorithm separator ':'")
                .with_section(input_section)
        })?;

        if !ALGORITHM.is_match(algorithm) {
            bail!("invalid digest algorithm: {algorithm:?}");
        }
        if hex.is_empty() {
            bail!("hex cannot be empty");
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(eyre!("digest hex must be lowercase hexadecimal"))
                .with_section(input_section);
        }
        let expected = match algorithm {
            "sha256" => Some(64),
            "sha512" => Some(128),
            _ => None,
        };
        if let Some(expected) = expected.filter(|&expected| expected != hex.len()) {
            return Err(eyre!(
                "{algorithm} digest must have {expected} hex characters, found {}",
                hex.len()
            ))
            .with_section(input_section);
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hash: hex::decode(hex)
                .map_err(|e| eyre!("invalid hex string: {e}"))
                .with_section(input_section)?,
        })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.as_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Version identifier for an artifact: a named tag or a digest.
///
/// ```
/// # use ocilayer_lib::Version;
/// assert_eq!(Version::latest().to_string(), "latest");
/// assert_eq!(Version::tag("v1").to_string(), "v1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Version {
    /// A named tag (e.g. "latest", "1.0.0")
    Tag(String),

    /// A content digest (e.g. "sha256:123abc...")
    Digest(Digest),
}

impl Version {
    /// The tag used when a reference names none.
    pub const LATEST: &'static str = "latest";

    /// Returns the tag for "latest".
    pub fn latest() -> Self {
        Self::Tag(Self::LATEST.to_string())
    }

    /// Create a tagged instance.
    pub fn tag(tag: &str) -> Self {
        Self::Tag(tag.to_string())
    }

    /// Create a digest instance.
    pub fn digest(digest: Digest) -> Self {
        Self::Digest(digest)
    }
}

/// A parsed artifact reference of the form `oci://host/repository[:tag|@digest]`.
///
/// ```
/// # use ocilayer_lib::{Reference, Version};
/// # use std::str::FromStr;
/// let reference = Reference::from_str("oci://reg.example.com/org/app").expect("parse reference");
/// assert_eq!(reference.host, "reg.example.com");
/// assert_eq!(reference.repository, "org/app");
/// assert_eq!(reference.version, Version::tag("latest"));
///
/// let reference = Reference::from_str("oci://reg.example.com/org/app:v1").expect("parse reference");
/// assert_eq!(reference.version, Version::tag("v1"));
/// assert_eq!(reference.to_string(), "oci://reg.example.com/org/app:v1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Reference {
    /// Registry host, optionally with a port (e.g. "ghcr.io", "localhost:5000")
    #[builder(into)]
    pub host: String,

    /// Repository path within the registry (e.g. "org/app")
    #[builder(into)]
    pub repository: String,

    /// Version identifier, either a tag or a digest
    #[builder(into, default = Version::latest())]
    pub version: Version,
}

impl<S: reference_builder::State> ReferenceBuilder<S> {
    /// Set the reference to a tag version.
    pub fn tag(self, tag: &str) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::tag(tag))
    }

    /// Set the reference to a digest version.
    pub fn digest(self, digest: Digest) -> ReferenceBuilder<reference_builder::SetVersion<S>>
    where
        S::Version: reference_builder::IsUnset,
    {
        self.version(Version::Digest(digest))
    }
}

impl Reference {
    /// The scheme every reference must carry.
    pub const SCHEME: &'static str = "oci://";

    /// The reference without scheme or version, e.g. `reg.example.com/org/app`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }
}

impl FromStr for Reference {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input_section = || s.to_string().header("Input:");
        let expected_section = || {
            "oci://{host}/{repository}[:{tag}|@{digest}]"
                .to_string()
                .header("Expected:")
        };

        let Some(url) = s.strip_prefix(Self::SCHEME) else {
            return eyre!("reference must start with {}", Self::SCHEME)
                .with_section(input_section)
                .with_section(expected_section)
                .pipe(Err);
        };

        let (host, remainder) = url.split_once('/').ok_or_else(|| {
            eyre!("invalid reference: missing host separator '/'")
                .with_section(input_section)
                .with_section(expected_section)
        })?;

        // Digests contain ':' too, so '@' has to be checked first.
        let (repository, version) = if let Some((repo, digest)) = remainder.split_once('@') {
            let digest = Digest::from_str(digest)
                .context("parse digest")
                .with_section(input_section)?;
            (repo, Version::Digest(digest))
        } else if let Some((repo, tag)) = remainder.split_once(':') {
            (repo, Version::Tag(tag.to_string()))
        } else {
            (remainder, Version::latest())
        };

        if host.is_empty() {
            return Err(eyre!("host cannot be empty").with_section(input_section));
        }
        if !HOST.is_match(host) {
            return Err(eyre!("invalid host: {host:?}").with_section(input_section));
        }
        if repository.is_empty() {
            return Err(eyre!("repository cannot be empty").with_section(input_section));
        }
        if !REPOSITORY.is_match(repository) {
            return eyre!("invalid repository name: {repository:?}")
                .with_section(input_section)
                .with_note(|| "repository components are lowercase alphanumerics joined by '.', '_', '__' or '-'")
                .pipe(Err);
        }
        if let Version::Tag(tag) = &version {
            if !TAG.is_match(tag) {
                return Err(eyre!("invalid tag: {tag:?}").with_section(input_section));
            }
        }

        Ok(Reference {
            host: host.to_string(),
            repository: repository.to_string(),
            version,
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}", Self::SCHEME, self.host, self.repository)?;
        match &self.version {
            Version::Tag(tag) => write!(f, ":{tag}"),
            Version::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A layer as listed in a manifest.
///
/// Fields are kept exactly as the registry reported them;
/// [`Layer::digest`] and [`Layer::media_type`] interpret them and may fail for individual layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Builder)]
pub struct Layer {
    /// The content-addressable digest of the layer blob.
    #[builder(into)]
    pub digest: String,

    /// The media type of the layer.
    #[builder(into)]
    pub media_type: String,

    /// The size of the layer blob in bytes.
    pub size: i64,
}

impl Layer {
    /// Parse the layer digest.
    pub fn digest(&self) -> Result<Digest> {
        Digest::from_str(&self.digest).with_context(|| format!("parse layer digest {:?}", self.digest))
    }

    /// Parse the layer media type.
    pub fn media_type(&self) -> Result<LayerMediaType> {
        LayerMediaType::from_str(&self.media_type)
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest)
    }
}

/// Media types for OCI image layers.
///
/// Spec reference: https://github.com/opencontainers/image-spec/blob/main/media-types.md
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerMediaType {
    /// A Docker layer in gzipped tar format.
    Docker,

    /// A Docker layer meant to be fetched from somewhere other than the registry.
    DockerForeign,

    /// An OCI layer, with any compression or informational flags that apply.
    Oci(Vec<LayerMediaTypeFlag>),

    /// An OCI layer marked as non-distributable.
    ///
    /// Deprecated in the OCI spec; clients download these like any other layer.
    OciNonDistributable(Vec<LayerMediaTypeFlag>),
}

impl LayerMediaType {
    const DOCKER: &'static str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    const DOCKER_FOREIGN: &'static str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
    const OCI: &'static str = "application/vnd.oci.image.layer.v1.tar";
    const OCI_NON_DISTRIBUTABLE: &'static str =
        "application/vnd.oci.image.layer.nondistributable.v1.tar";

    /// The flags applied to the media type; Docker layers have none.
    pub fn flags(&self) -> &[LayerMediaTypeFlag] {
        match self {
            LayerMediaType::Oci(flags) | LayerMediaType::OciNonDistributable(flags) => flags,
            LayerMediaType::Docker | LayerMediaType::DockerForeign => &[],
        }
    }

    fn base(&self) -> &'static str {
        match self {
            LayerMediaType::Docker => Self::DOCKER,
            LayerMediaType::DockerForeign => Self::DOCKER_FOREIGN,
            LayerMediaType::Oci(_) => Self::OCI,
            LayerMediaType::OciNonDistributable(_) => Self::OCI_NON_DISTRIBUTABLE,
        }
    }
}

impl FromStr for LayerMediaType {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::DOCKER => return Ok(Self::Docker),
            Self::DOCKER_FOREIGN => return Ok(Self::DockerForeign),
            _ => {}
        }

        let (base, flags) = s.split_once('+').unwrap_or((s, ""));
        let parse_flags = || -> Result<Vec<LayerMediaTypeFlag>> {
            flags
                .split('+')
                .filter(|flag| !flag.is_empty())
                .map(LayerMediaTypeFlag::from_str)
                .try_collect()
        };

        match base {
            Self::OCI => parse_flags().map(Self::Oci),
            Self::OCI_NON_DISTRIBUTABLE => parse_flags().map(Self::OciNonDistributable),
            _ => bail!("unknown media type: {s}"),
        }
    }
}

impl std::fmt::Display for LayerMediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base())?;
        for flag in self.flags() {
            write!(f, "+{}", flag.as_ref())?;
        }
        Ok(())
    }
}

/// Flags for OCI layer media types, e.g. the `gzip` in `application/vnd.oci.image.layer.v1.tar+gzip`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, AsRefStr, EnumIter)]
pub enum LayerMediaTypeFlag {
    /// The layer is meant to be fetched from somewhere other than the registry.
    #[strum(serialize = "foreign")]
    Foreign,

    /// The layer is compressed with zstd.
    #[strum(serialize = "zstd")]
    Zstd,

    /// The layer is compressed with gzip.
    #[strum(serialize = "gzip")]
    Gzip,
}

impl FromStr for LayerMediaTypeFlag {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::iter()
            .find(|flag| flag.as_ref() == s)
            .ok_or_else(|| eyre!("unknown flag: {s}"))
    }
}
