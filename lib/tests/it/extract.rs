use std::collections::HashMap;

use async_tempfile::TempDir;
use color_eyre::Result;
use ocilayer_lib::{
    extract::{Extractor, FILENAME},
    registry::Manifest,
    resolve::{ResolutionPath, ResolvedReference},
    Error, Layer,
};
use simple_test_case::test_case;

use crate::fake::{layer, repeated_digest, Blob, Call, FakeRegistry, DOCKER, GZIP, ZSTD};

const CONTENT: &[u8] = b"\x1f\x8b\x08\x00first layer bytes";

fn resolved() -> ResolvedReference {
    ResolvedReference {
        reference: "oci://reg.example.com/org/app:v1"
            .parse()
            .expect("parse reference"),
        digest: repeated_digest('a'),
        path: ResolutionPath::HeadCheck,
    }
}

fn manifest(layers: Vec<Layer>) -> Manifest {
    Manifest::builder()
        .digest(repeated_digest('a'))
        .layers(layers)
        .build()
}

async fn entries(dir: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let mut entries = Vec::new();
    let mut read = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read.next_entry().await? {
        entries.push(entry.path());
    }
    Ok(entries)
}

#[test_log::test(tokio::test)]
async fn writes_first_layer() -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let second = layer(b"second", GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone(), second.clone()]))
        .blobs(HashMap::from([
            (first.digest.clone(), Blob::single(CONTENT)),
            (second.digest.clone(), Blob::single(b"second".to_vec())),
        ]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await?;

    pretty_assertions::assert_eq!(report.layer, first);
    pretty_assertions::assert_eq!(report.revision, resolved().revision());
    pretty_assertions::assert_eq!(report.path.file_name().and_then(|n| n.to_str()), Some(FILENAME));

    let dir = report.path.parent().expect("output dir");
    pretty_assertions::assert_eq!(dir.parent(), Some(tmp.dir_path().as_path()));
    let dir_name = dir.file_name().and_then(|n| n.to_str()).expect("dir name");
    assert!(dir_name.starts_with("layer"), "{dir_name}");

    pretty_assertions::assert_eq!(tokio::fs::read(&report.path).await?, CONTENT);

    let pinned = resolved().pinned().to_string();
    pretty_assertions::assert_eq!(
        registry.calls(),
        vec![
            Call::Manifest(pinned.clone()),
            Call::Blob(pinned, first.digest.clone()),
        ]
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn missing_output_root_is_created() -> Result<()> {
    let tmp = TempDir::new().await?;
    let root = tmp.dir_path().join("nested").join("out");
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(CONTENT))]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(&root)
        .build()
        .extract(&resolved())
        .await?;

    let dir = report.path.parent().expect("output dir");
    pretty_assertions::assert_eq!(dir.parent(), Some(root.as_path()));
    pretty_assertions::assert_eq!(tokio::fs::read(&report.path).await?, CONTENT);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn output_root_that_is_a_file() -> Result<()> {
    let tmp = TempDir::new().await?;
    let root = tmp.dir_path().join("occupied");
    tokio::fs::write(&root, b"not a directory").await?;
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(CONTENT))]))
        .build();

    let err = Extractor::builder()
        .registry(&registry)
        .output_root(&root)
        .build()
        .extract(&resolved())
        .await
        .expect_err("must error");

    assert!(matches!(err, Error::Write { .. }), "{err:?}");
    Ok(())
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn output_is_world_readable() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(CONTENT))]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await?;

    let mode = tokio::fs::metadata(&report.path).await?.permissions().mode();
    pretty_assertions::assert_eq!(mode & 0o777, 0o644);
    Ok(())
}

#[test_case(GZIP; "oci_gzip")]
#[test_case(ZSTD; "oci_zstd")]
#[test_case(DOCKER; "docker")]
#[test_case("application/vnd.example.unknown"; "unknown")]
#[test_log::test(tokio::test)]
async fn selects_first_layer_regardless_of_media_type(media_type: &str) -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, media_type);
    let second = layer(b"second", GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone(), second.clone()]))
        .blobs(HashMap::from([
            (first.digest.clone(), Blob::single(CONTENT)),
            (second.digest.clone(), Blob::single(b"second".to_vec())),
        ]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await?;

    pretty_assertions::assert_eq!(report.layer.media_type, media_type);
    pretty_assertions::assert_eq!(tokio::fs::read(&report.path).await?, CONTENT);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unparseable_layers_are_skipped_for_enumeration() -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let broken = Layer::builder()
        .digest("not a digest")
        .media_type("nonsense")
        .size(-1)
        .build();
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone(), broken]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(CONTENT))]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await?;

    pretty_assertions::assert_eq!(report.layer, first);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn no_layers_writes_nothing() -> Result<()> {
    let tmp = TempDir::new().await?;
    let registry = FakeRegistry::builder().manifest(manifest(vec![])).build();

    let err = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await
        .expect_err("must error");

    assert!(matches!(err, Error::NoLayers { .. }), "{err:?}");
    pretty_assertions::assert_eq!(entries(tmp.dir_path()).await?, Vec::<std::path::PathBuf>::new());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn manifest_failure() -> Result<()> {
    let tmp = TempDir::new().await?;
    let registry = FakeRegistry::builder().build();

    let err = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await
        .expect_err("must error");

    assert!(matches!(err, Error::ManifestFetch { .. }), "{err:?}");
    pretty_assertions::assert_eq!(entries(tmp.dir_path()).await?, Vec::<std::path::PathBuf>::new());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn extraction_is_idempotent() -> Result<()> {
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(
            first.digest.clone(),
            Blob::Complete(vec![CONTENT[..4].to_vec(), CONTENT[4..].to_vec()]),
        )]))
        .build();

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let tmp = TempDir::new().await?;
        let report = Extractor::builder()
            .registry(&registry)
            .output_root(tmp.dir_path())
            .build()
            .extract(&resolved())
            .await?;
        outputs.push(tokio::fs::read(&report.path).await?);
    }

    pretty_assertions::assert_eq!(outputs[0], outputs[1]);
    pretty_assertions::assert_eq!(outputs[0], CONTENT);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn interrupted_blob_is_rejected() -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(
            first.digest.clone(),
            Blob::Interrupted(vec![CONTENT[..4].to_vec()]),
        )]))
        .build();

    let err = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await
        .expect_err("must error");

    assert!(matches!(err, Error::BlobRead { .. }), "{err:?}");
    pretty_assertions::assert_eq!(entries(tmp.dir_path()).await?, Vec::<std::path::PathBuf>::new());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn truncated_blob_is_rejected() -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(
            first.digest.clone(),
            Blob::single(&CONTENT[..4]),
        )]))
        .build();

    let err = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await
        .expect_err("must error");

    assert!(matches!(err, Error::BlobRead { .. }), "{err:?}");
    Ok(())
}

#[test_case(true; "verified")]
#[test_case(false; "unverified")]
#[test_log::test(tokio::test)]
async fn tampered_blob(verify: bool) -> Result<()> {
    let tmp = TempDir::new().await?;
    let tampered = b"\x1f\x8b\x08\x00FIRST LAYER BYTES";
    pretty_assertions::assert_eq!(tampered.len(), CONTENT.len());

    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(tampered.to_vec()))]))
        .build();

    let result = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .verify_digest(verify)
        .build()
        .extract(&resolved())
        .await;

    if verify {
        let err = result.expect_err("must error");
        let Error::DigestMismatch { expected, .. } = &err else {
            panic!("unexpected error: {err:?}");
        };
        pretty_assertions::assert_eq!(expected, &first.digest);
        pretty_assertions::assert_eq!(entries(tmp.dir_path()).await?, Vec::<std::path::PathBuf>::new());
    } else {
        let report = result?;
        pretty_assertions::assert_eq!(tokio::fs::read(&report.path).await?, tampered);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn verified_blob_is_written() -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(CONTENT))]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .verify_digest(true)
        .build()
        .extract(&resolved())
        .await?;

    pretty_assertions::assert_eq!(tokio::fs::read(&report.path).await?, CONTENT);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn report_json() -> Result<()> {
    let tmp = TempDir::new().await?;
    let first = layer(CONTENT, GZIP);
    let registry = FakeRegistry::builder()
        .manifest(manifest(vec![first.clone()]))
        .blobs(HashMap::from([(first.digest.clone(), Blob::single(CONTENT))]))
        .build();

    let report = Extractor::builder()
        .registry(&registry)
        .output_root(tmp.dir_path())
        .build()
        .extract(&resolved())
        .await?;

    let rendered = serde_json::from_str::<serde_json::Value>(&report.render()?)?;
    let expected = serde_json::json!({
        "reference": "oci://reg.example.com/org/app:v1",
        "revision": format!("v1@{}", repeated_digest('a')),
        "digest": repeated_digest('a').to_string(),
        "layer": {
            "digest": first.digest,
            "media_type": GZIP,
            "size": CONTENT.len(),
        },
        "path": report.path,
    });
    pretty_assertions::assert_eq!(rendered, expected);
    Ok(())
}
