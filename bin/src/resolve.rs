use clap::Parser;
use color_eyre::eyre::Result;
use ocilayer_lib::resolve::Resolver;
use tracing::debug;

use crate::pull::Target;

#[derive(Debug, Parser)]
pub struct Options {
    /// Target image to resolve
    #[clap(flatten)]
    pub target: Target,
}

#[tracing::instrument]
pub async fn main(opts: Options) -> Result<()> {
    let registry = opts.target.registry().await;
    let resolved = Resolver::builder()
        .registry(&registry)
        .build()
        .resolve(&opts.target.image)
        .await?;

    debug!(path = %resolved.path, "resolved");
    println!("{}", resolved.revision());
    Ok(())
}
