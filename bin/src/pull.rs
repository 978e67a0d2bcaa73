use clap::Parser;
use color_eyre::eyre::{Context, Result};
use derive_more::Debug;
use ocilayer_lib::{
    extract::Extractor, registry::Registry, resolve::Resolver, Authentication, Platform,
    Reference,
};
use std::{path::PathBuf, str::FromStr};
use tracing::{debug, info};

/// The image to operate on and how to reach it.
#[derive(Debug, Parser)]
pub struct Target {
    /// Image reference (e.g. oci://ghcr.io/org/app:v1)
    ///
    /// The tag defaults to `latest`. A digest may be given instead of a tag
    /// (e.g. oci://ghcr.io/org/app@sha256:...).
    #[arg(env = "OCILAYER_IMAGE")]
    pub image: String,

    /// Platform to pull (e.g. linux/amd64)
    ///
    /// If the image is not multi-platform, this is ignored.
    /// If the image is multi-platform, this is used to select the platform to pull.
    ///
    /// If the image is multi-platform and this argument is not provided,
    /// the platform is chosen according to the following priority list:
    ///
    /// 1. The first platform-independent image
    ///
    /// 2. The current platform (if available)
    ///
    /// 3. The `linux` platform for the current architecture
    ///
    /// 4. The `linux` platform for the `amd64` architecture
    ///
    /// 5. The first platform in the image manifest
    #[arg(long, value_parser = Platform::from_str, verbatim_doc_comment)]
    pub platform: Option<Platform>,

    /// The username to use for authenticating to the registry
    ///
    /// Without a username and password, credentials are looked up in the Docker configuration;
    /// if none are found the registry is accessed anonymously.
    #[arg(long, requires = "password", env = "OCILAYER_USERNAME")]
    pub username: Option<String>,

    /// The password to use for authenticating to the registry
    #[arg(long, requires = "username", env = "OCILAYER_PASSWORD")]
    #[debug(skip)]
    pub password: Option<String>,
}

impl Target {
    /// Create a registry client for the target, with credentials for its host.
    pub async fn registry(&self) -> Registry {
        let auth = self.auth().await;
        Registry::builder()
            .maybe_platform(self.platform.clone())
            .auth(auth)
            .build()
    }

    async fn auth(&self) -> Authentication {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            debug!(%username, "using provided credentials");
            return Authentication::basic(username, password);
        }

        // An invalid reference is reported by resolution, before any registry call.
        match Reference::from_str(&self.image) {
            Ok(reference) => Authentication::docker(&reference.host).await,
            Err(_) => Authentication::None,
        }
    }
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Target image to pull the first layer from
    #[clap(flatten)]
    pub target: Target,

    /// Directory under which the `layer*` output directory is created
    ///
    /// Defaults to the system temporary directory.
    #[arg(long, short)]
    pub output_dir: Option<PathBuf>,

    /// Reject the layer unless its content hashes to the digest in the manifest
    #[arg(long)]
    pub verify_digest: bool,

    /// Print a JSON report instead of the path of the written layer
    #[arg(long)]
    pub json: bool,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    info!("pulling first layer");

    let registry = opts.target.registry().await;
    let resolved = Resolver::builder()
        .registry(&registry)
        .build()
        .resolve(&opts.target.image)
        .await?;

    let report = Extractor::builder()
        .registry(&registry)
        .maybe_output_root(opts.output_dir)
        .verify_digest(opts.verify_digest)
        .build()
        .extract(&resolved)
        .await
        .with_context(|| format!("extract {}", resolved.revision()))?;

    if opts.json {
        println!("{}", report.render()?);
    } else {
        println!("{}", report.path.display());
    }

    Ok(())
}
