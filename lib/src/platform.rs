//! Platforms used to pick a manifest out of a multi-platform index.

use bon::Builder;
use color_eyre::{
    eyre::{self, eyre},
    Section, SectionExt,
};
use std::str::FromStr;
use tap::Pipe;

/// The platform an image is built for, in Docker's `os/architecture[/variant]` form.
///
/// Values follow GOOS and GOARCH, as the OCI image index requires.
///
/// ```
/// # use ocilayer_lib::Platform;
/// # use std::str::FromStr;
/// let platform = Platform::from_str("linux/arm64/v8").expect("parse platform");
/// assert_eq!(platform.os, "linux");
/// assert_eq!(platform.variant.as_deref(), Some("v8"));
/// assert_eq!(platform.to_string(), "linux/arm64/v8");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Platform {
    /// Operating system, e.g. "linux".
    #[builder(into)]
    pub os: String,

    /// CPU architecture, e.g. "amd64".
    #[builder(into)]
    pub architecture: String,

    /// CPU variant, e.g. "v7".
    #[builder(into)]
    pub variant: Option<String>,
}

impl Platform {
    /// Canonical name for the linux operating system.
    pub const LINUX: &'static str = "linux";

    /// Canonical name for the AMD64 architecture.
    pub const AMD64: &'static str = "amd64";

    /// Canonical name for the ARM64 architecture.
    pub const ARM64: &'static str = "arm64";

    /// Create an instance for Linux AMD64
    pub fn linux_amd64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::AMD64)
            .build()
    }

    /// Create an instance for Linux ARM64
    pub fn linux_arm64() -> Self {
        Self::builder()
            .os(Self::LINUX)
            .architecture(Self::ARM64)
            .build()
    }

    /// The platform of the running process, translated to GOOS/GOARCH names.
    pub fn host() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            os => os,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => Self::AMD64,
            "aarch64" => Self::ARM64,
            "x86" => "386",
            "powerpc64" => "ppc64",
            arch => arch,
        };
        Self::builder().os(os).architecture(architecture).build()
    }

    /// Whether an index entry's platform satisfies this one.
    /// A variant is only compared when this platform names one.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        self.os == os
            && self.architecture == architecture
            && self
                .variant
                .as_deref()
                .is_none_or(|wanted| variant == Some(wanted))
    }

    /// Rank an index entry for the host platform when none was requested; lower is preferred.
    ///
    /// In order: entries without a platform, the host's own platform,
    /// linux on the host architecture, linux/amd64, then anything else.
    pub fn host_preference(&self, candidate: Option<(&str, &str)>) -> usize {
        match candidate {
            None => 0,
            Some((os, arch)) if os == self.os && arch == self.architecture => 1,
            Some((os, arch)) if os == Self::LINUX && arch == self.architecture => 2,
            Some((os, arch)) if os == Self::LINUX && arch == Self::AMD64 => 3,
            Some(_) => 4,
        }
    }
}

impl FromStr for Platform {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            eyre!("invalid platform format")
                .with_section(|| s.to_string().header("Input:"))
                .with_section(|| "{os}/{architecture}[/{variant}]".header("Expected:"))
                .with_section(|| ["linux/amd64", "linux/arm/v7"].join("\n").header("Examples:"))
        };

        let parts = s.split('/').collect::<Vec<_>>();
        if parts.iter().any(|part| part.is_empty()) {
            return invalid().pipe(Err);
        }

        match parts.as_slice() {
            [os, architecture] => Self::builder()
                .os(*os)
                .architecture(*architecture)
                .build()
                .pipe(Ok),
            [os, architecture, variant] => Self::builder()
                .os(*os)
                .architecture(*architecture)
                .variant(*variant)
                .build()
                .pipe(Ok),
            _ => invalid().pipe(Err),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}
