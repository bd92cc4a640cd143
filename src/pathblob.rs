//! Directory-to-blob engine (spec §4.H): walk a directory tree, apply
//! include/exclude glob filters, and produce a deterministic tar+gzip blob,
//! the write-side counterpart of the teacher's tarball-reading helpers in
//! `cio.rs` and its gzip wrap in `transform.rs`.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use async_compression::tokio::write::GzipEncoder;
use async_trait::async_trait;
use color_eyre::eyre::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::instrument;

use crate::blob::{Blob, FileBlob, MediaTypeAware, DEFAULT_BUFFER_SIZE};
use crate::error::OcmError;
use crate::Result;

/// A single include/exclude rule (spec §4.H). Exclude rules take
/// precedence over include rules matching the same path.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Only include paths matching this glob.
    Include(String),
    /// Exclude paths matching this glob, even if also matched by an include.
    Exclude(String),
}

/// An ordered set of filters, plus the aggregate match decision for a path.
#[derive(Debug, Clone, Default)]
pub struct Filters(Vec<Filter>);

/// The result of matching a path against a [`Filters`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMatch {
    /// The path should be included in the archive.
    Keep,
    /// The path should be skipped.
    Skip,
}

impl Filters {
    /// An empty filter set (keeps everything).
    pub fn new(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self(filters.into_iter().collect())
    }

    /// Normalize a relative path string the way glob patterns expect:
    /// strip a leading `./` and any leading `/`.
    fn normalize(path: &str) -> &str {
        path.trim_start_matches("./").trim_start_matches('/')
    }

    /// Decide whether `path` should be kept (spec §4.H: no include rules
    /// means "keep everything not excluded"; any exclude match wins over
    /// any include match).
    pub fn matches(&self, path: &str) -> FilterMatch {
        let path = Self::normalize(path);
        let has_includes = self.0.iter().any(|f| matches!(f, Filter::Include(_)));

        let excluded = self.0.iter().any(|f| match f {
            Filter::Exclude(pattern) => glob_match::glob_match(pattern, path),
            Filter::Include(_) => false,
        });
        if excluded {
            return FilterMatch::Skip;
        }

        if !has_includes {
            return FilterMatch::Keep;
        }

        let included = self.0.iter().any(|f| match f {
            Filter::Include(pattern) => glob_match::glob_match(pattern, path),
            Filter::Exclude(_) => false,
        });
        if included {
            FilterMatch::Keep
        } else {
            FilterMatch::Skip
        }
    }
}

/// Options controlling tar production (spec §4.H).
#[derive(Debug, Clone, Default)]
pub struct TarOptions {
    /// Filter set applied to every entry under the root.
    pub filters: Filters,
    /// Emit a header for empty directories even when no file beneath them
    /// is kept (spec §9 Open Question 2's resolved default is `false`).
    pub preserve_dir: bool,
    /// Zero uid/gid/mtime and sort entries lexicographically, so the same
    /// directory tree always produces byte-identical archives.
    pub reproducible: bool,
    /// Media type recorded on the produced blob. A gzip wrap (`compress`)
    /// does not change this — it remains authoritative unless the caller
    /// overrides it downstream.
    pub media_type: String,
    /// Wrap the tar stream in a gzip layer.
    pub compress: bool,
    /// If set, [`path_to_blob`] rejects a path that resolves outside this
    /// directory instead of archiving it.
    pub working_dir: Option<PathBuf>,
}

/// Recursively enumerate `root`, writing every kept entry into a tar
/// stream wrapped in `writer`, gzip-compressing it when `options.compress`
/// (spec §4.H). Rejects any path that resolves outside `root` and any
/// symlink encountered during the walk.
#[instrument(skip(writer))]
pub async fn write_tar<W: AsyncWrite + Send + Unpin>(root: &Path, writer: W, options: &TarOptions) -> Result<u64> {
    if options.compress {
        write_tar_entries(root, GzipEncoder::new(writer), options).await
    } else {
        write_tar_entries(root, writer, options).await
    }
}

async fn write_tar_entries<W: AsyncWrite + Send + Unpin>(root: &Path, writer: W, options: &TarOptions) -> Result<u64> {
    let mut builder = tokio_tar::Builder::new(writer);

    let mut entries = collect_entries(root, root, options).await?;
    if options.reproducible {
        entries.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
    }

    let mut total: u64 = 0;
    for entry in &entries {
        let full_path = root.join(&entry.archive_path);
        let meta = tokio::fs::symlink_metadata(&full_path)
            .await
            .with_context(|| format!("stat {}", full_path.display()))?;

        if meta.is_symlink() {
            return Err(OcmError::SymlinkRejected.into());
        }

        if meta.is_dir() {
            if entry.keep_as_dir {
                let mut header = tokio_tar::Header::new_gnu();
                header.set_entry_type(tokio_tar::EntryType::Directory);
                header.set_size(0);
                apply_reproducible(&mut header, &meta, options.reproducible);
                header.set_cksum();
                builder
                    .append_data(&mut header, &entry.archive_path, tokio::io::empty())
                    .await
                    .with_context(|| format!("append directory {}", entry.archive_path.display()))?;
            }
            continue;
        }

        let mut header = tokio_tar::Header::new_gnu();
        header.set_size(meta.len());
        apply_reproducible(&mut header, &meta, options.reproducible);
        header.set_cksum();

        let file = tokio::fs::File::open(&full_path)
            .await
            .with_context(|| format!("open {}", full_path.display()))?;
        builder
            .append_data(&mut header, &entry.archive_path, file)
            .await
            .with_context(|| format!("append file {}", entry.archive_path.display()))?;
        total += meta.len();
    }

    let mut writer = builder.into_inner().await.context("finish tar archive")?;
    writer.shutdown().await.context("finish tar stream")?;
    Ok(total)
}

/// Convert a filesystem path into a [`Blob`] (spec §4.H). A file becomes a
/// raw blob directly (no tar). A directory is streamed as a tar archive
/// through a pipe: a background task walks the tree and writes into one
/// end while the returned blob's reader drains the other, so the consumer
/// never has to materialize the whole archive in memory. A tar-building
/// failure closes the pipe; the consumer observes it on its next read
/// instead of a silently truncated clean EOF.
#[instrument(skip(options))]
pub async fn path_to_blob(path: &Path, options: &TarOptions) -> Result<Box<dyn Blob>> {
    if let Some(working_dir) = &options.working_dir {
        path.strip_prefix(working_dir).map_err(|_| OcmError::WorkingDirEscape)?;
    }

    let meta = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if meta.is_symlink() {
        return Err(OcmError::SymlinkRejected.into());
    }

    if meta.is_file() {
        return Ok(Box::new(FileBlob::open(path, options.media_type.clone()).await?));
    }

    Ok(Box::new(TarPipeBlob::spawn(path.to_path_buf(), options.clone())))
}

/// A [`Blob`] backed by a background task streaming a tar archive into one
/// end of a pipe, the directory counterpart of [`FileBlob`]. Mirrors
/// `LockedBlobReader`'s error-on-next-read idiom (`crate::blob`): a failed
/// walk stores its error rather than closing the pipe cleanly, so the
/// consumer's next read fails instead of silently truncating.
pub struct TarPipeBlob {
    read_half: tokio::sync::Mutex<Option<tokio::io::DuplexStream>>,
    failure: Arc<std::sync::Mutex<Option<String>>>,
    media_type: String,
}

impl std::fmt::Debug for TarPipeBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarPipeBlob").field("media_type", &self.media_type).finish()
    }
}

impl TarPipeBlob {
    fn spawn(root: PathBuf, options: TarOptions) -> Self {
        let media_type = options.media_type.clone();
        let (write_half, read_half) = tokio::io::duplex(DEFAULT_BUFFER_SIZE);
        let failure = Arc::new(std::sync::Mutex::new(None));
        let task_failure = failure.clone();
        tokio::spawn(async move {
            if let Err(e) = write_tar(&root, write_half, &options).await {
                *task_failure.lock().unwrap() = Some(format!("{e:#}"));
            }
        });
        Self {
            read_half: tokio::sync::Mutex::new(Some(read_half)),
            failure,
            media_type,
        }
    }
}

#[async_trait]
impl Blob for TarPipeBlob {
    async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut guard = self.read_half.lock().await;
        match guard.take() {
            Some(read_half) => Ok(Box::new(TarPipeReader {
                inner: read_half,
                failure: self.failure.clone(),
            })),
            None => Ok(Box::new(tokio::io::empty())),
        }
    }

    fn as_media_type_aware(&self) -> Option<&dyn MediaTypeAware> {
        Some(self)
    }
}

impl MediaTypeAware for TarPipeBlob {
    fn media_type(&self) -> &str {
        &self.media_type
    }
}

struct TarPipeReader {
    inner: tokio::io::DuplexStream,
    failure: Arc<std::sync::Mutex<Option<String>>>,
}

impl AsyncRead for TarPipeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>, buf: &mut ReadBuf<'_>) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) if buf.filled().len() == before => {
                match this.failure.lock().unwrap().clone() {
                    Some(detail) => std::task::Poll::Ready(Err(std::io::Error::other(detail))),
                    None => std::task::Poll::Ready(Ok(())),
                }
            }
            other => other,
        }
    }
}

struct WalkEntry {
    archive_path: PathBuf,
    keep_as_dir: bool,
}

#[instrument(skip(root, base, options))]
async fn collect_entries(root: &Path, base: &Path, options: &TarOptions) -> Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![base.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir {}", dir.display()))?;

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|_| OcmError::WorkingDirEscape)?
                .to_path_buf();
            let relative_str = relative.to_string_lossy().to_string();

            let meta = tokio::fs::symlink_metadata(&path)
                .await
                .with_context(|| format!("stat {}", path.display()))?;

            if meta.is_dir() {
                let children = list_children(&path).await?;
                let any_kept_children = {
                    let mut any = false;
                    for child in &children {
                        let child_relative = child
                            .strip_prefix(root)
                            .map_err(|_| OcmError::WorkingDirEscape)?
                            .to_string_lossy()
                            .to_string();
                        if options.filters.matches(&child_relative) == FilterMatch::Keep {
                            any = true;
                            break;
                        }
                    }
                    any
                };

                if options.filters.matches(&relative_str) == FilterMatch::Keep
                    && (options.preserve_dir || any_kept_children)
                {
                    out.push(WalkEntry {
                        archive_path: relative.clone(),
                        keep_as_dir: true,
                    });
                }
                stack.push(path);
                continue;
            }

            if options.filters.matches(&relative_str) == FilterMatch::Keep {
                out.push(WalkEntry {
                    archive_path: relative,
                    keep_as_dir: false,
                });
            }
        }
    }

    Ok(out)
}

async fn list_children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read_dir {}", dir.display()))?;
    let mut out = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        out.push(entry.path());
    }
    Ok(out)
}

fn apply_reproducible(header: &mut tokio_tar::Header, meta: &std::fs::Metadata, reproducible: bool) {
    if reproducible {
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_mode(0o644);
        let _ = meta;
    } else {
        #[cfg(unix)]
        {
            use std::os::unix::fs::{MetadataExt, PermissionsExt};
            header.set_uid(meta.uid() as u64);
            header.set_gid(meta.gid() as u64);
            header.set_mtime(meta.mtime() as u64);
            header.set_mode(meta.permissions().mode() & 0o777);
        }
        #[cfg(not(unix))]
        {
            header.set_mtime(0);
            header.set_mode(0o644);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn unpack(gz_bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        use async_compression::tokio::bufread::GzipDecoder;
        let decoder = GzipDecoder::new(gz_bytes);
        let mut archive = tokio_tar::Archive::new(decoder);
        let mut out = Vec::new();
        let mut entries = archive.entries().expect("entries");
        use futures_lite::StreamExt;
        while let Some(entry) = entries.next().await {
            let mut entry = entry.expect("entry");
            let path = entry.path().expect("path").to_string_lossy().to_string();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut entry, &mut buf).await.unwrap();
            out.push((path, buf));
        }
        out
    }

    fn gzipped(filters: Filters) -> TarOptions {
        TarOptions {
            filters,
            compress: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn round_trips_a_simple_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.txt"), b"aaa").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.txt"), b"bbb").await.unwrap();

        let mut out = Vec::new();
        write_tar(dir.path(), &mut out, &gzipped(Filters::default())).await.expect("write tar");

        let entries = unpack(&out).await;
        let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"sub/b.txt".to_string()));
    }

    #[tokio::test]
    async fn uncompressed_tar_is_not_gzip_framed() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.txt"), b"aaa").await.unwrap();

        let mut out = Vec::new();
        write_tar(dir.path(), &mut out, &TarOptions::default()).await.expect("write tar");

        let mut archive = tokio_tar::Archive::new(&out[..]);
        let mut entries = archive.entries().expect("entries");
        use futures_lite::StreamExt;
        let mut names = Vec::new();
        while let Some(entry) = entries.next().await {
            names.push(entry.expect("entry").path().expect("path").to_string_lossy().to_string());
        }
        assert!(names.contains(&"a.txt".to_string()));
    }

    #[tokio::test]
    async fn exclude_takes_precedence_over_include() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("keep.txt"), b"keep").await.unwrap();
        tokio::fs::write(dir.path().join("skip.txt"), b"skip").await.unwrap();

        let options = gzipped(Filters::new([Filter::Include("*.txt".into()), Filter::Exclude("skip.txt".into())]));

        let mut out = Vec::new();
        write_tar(dir.path(), &mut out, &options).await.expect("write tar");
        let entries = unpack(&out).await;
        let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(!names.contains(&"skip.txt".to_string()));
    }

    #[tokio::test]
    async fn symlinks_are_rejected() {
        #[cfg(unix)]
        {
            let dir = tempfile::tempdir().expect("tempdir");
            tokio::fs::write(dir.path().join("real.txt"), b"x").await.unwrap();
            tokio::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
                .await
                .unwrap();

            let mut out = Vec::new();
            let err = write_tar(dir.path(), &mut out, &gzipped(Filters::default())).await.unwrap_err();
            assert!(err.downcast_ref::<OcmError>().is_some());
        }
    }

    #[tokio::test]
    async fn path_to_blob_returns_raw_blob_for_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"raw-bytes").await.unwrap();

        let options = TarOptions {
            media_type: "application/octet-stream".into(),
            ..Default::default()
        };
        let blob = path_to_blob(&path, &options).await.expect("path_to_blob");
        assert_eq!(blob.as_media_type_aware().map(|m| m.media_type()), Some("application/octet-stream"));

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut *blob.reader().await.expect("reader"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"raw-bytes");
    }

    #[tokio::test]
    async fn path_to_blob_streams_a_directory_as_tar_through_a_pipe() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.txt"), b"aaa").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/b.txt"), b"bbb").await.unwrap();

        let options = gzipped(Filters::default());
        let blob = path_to_blob(dir.path(), &options).await.expect("path_to_blob");

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut *blob.reader().await.expect("reader"), &mut out)
            .await
            .unwrap();

        let entries = unpack(&out).await;
        let names: Vec<_> = entries.iter().map(|(n, _)| n.clone()).collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"sub/b.txt".to_string()));
    }

    #[tokio::test]
    async fn path_to_blob_rejects_escape_from_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        let path = outside.path().join("f.bin");
        tokio::fs::write(&path, b"x").await.unwrap();

        let options = TarOptions {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let err = path_to_blob(&path, &options).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<OcmError>(), Some(OcmError::WorkingDirEscape)));
    }
}
