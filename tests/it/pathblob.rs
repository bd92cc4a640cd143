//! Directory → tar.gz → digest-verified blob, exercising `pathblob.rs` and
//! `blob.rs` together end to end.

use ocm_core::blob::{copy, BlobReader, DirectBlob};
use ocm_core::digest::Digest;
use ocm_core::pathblob::{path_to_blob, write_tar, TarOptions};

#[tokio::test]
async fn directory_becomes_a_digest_verifiable_blob() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("readme.txt"), b"hello from the archive")
        .await
        .expect("write");

    let mut tar_bytes = Vec::new();
    write_tar(
        dir.path(),
        &mut tar_bytes,
        &TarOptions {
            reproducible: true,
            compress: true,
            ..Default::default()
        },
    )
    .await
    .expect("produce tar.gz");

    let expected = Digest::sha256(&tar_bytes);
    let blob = DirectBlob::new(tar_bytes.clone(), "application/gzip");

    let reader = BlobReader::new(blob.reader().await.expect("open reader"));
    let mut out = Vec::new();
    let copied = copy(reader, &mut out, Some(tar_bytes.len() as u64), Some(&expected))
        .await
        .expect("copy with digest verification");

    assert_eq!(copied, tar_bytes.len() as u64);
    assert_eq!(out, tar_bytes);
}

#[tokio::test]
async fn reproducible_archives_of_the_same_tree_are_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("a.txt"), b"same content").await.unwrap();
    tokio::fs::create_dir(dir.path().join("nested")).await.unwrap();
    tokio::fs::write(dir.path().join("nested/b.txt"), b"more content").await.unwrap();

    let options = TarOptions {
        reproducible: true,
        compress: true,
        ..Default::default()
    };

    let mut first = Vec::new();
    write_tar(dir.path(), &mut first, &options).await.unwrap();
    let mut second = Vec::new();
    write_tar(dir.path(), &mut second, &options).await.unwrap();

    assert_eq!(Digest::sha256(&first), Digest::sha256(&second));
}

/// `path_to_blob` on a directory must produce content indistinguishable
/// from calling `write_tar` directly, but drained through a real pipe
/// rather than materialized up front by the caller.
#[tokio::test]
async fn path_to_blob_pipes_a_directory_tar_matching_write_tar() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("a.txt"), b"same content").await.unwrap();
    tokio::fs::create_dir(dir.path().join("nested")).await.unwrap();
    tokio::fs::write(dir.path().join("nested/b.txt"), b"more content").await.unwrap();

    let options = TarOptions {
        reproducible: true,
        compress: true,
        media_type: "application/gzip".into(),
        ..Default::default()
    };

    let mut direct = Vec::new();
    write_tar(dir.path(), &mut direct, &options).await.unwrap();

    let blob = path_to_blob(dir.path(), &options).await.expect("path_to_blob");
    let mut piped = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut *blob.reader().await.expect("reader"), &mut piped)
        .await
        .unwrap();

    assert_eq!(Digest::sha256(&piped), Digest::sha256(&direct));
}

#[tokio::test]
async fn path_to_blob_of_a_file_skips_tar_entirely() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("solo.bin");
    tokio::fs::write(&path, b"not-a-tar").await.unwrap();

    let blob = path_to_blob(&path, &TarOptions::default()).await.expect("path_to_blob");
    let mut out = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut *blob.reader().await.expect("reader"), &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"not-a-tar");
}
