//! Streaming blob model with optional capabilities (spec §4.B).
//!
//! A [`Blob`] is a source of bytes that may or may not be safely re-readable.
//! Callers that need to know size, digest, or media type ahead of a read
//! probe for those capabilities via `as_size_aware`/`as_digest_aware`/
//! `as_media_type_aware` rather than downcasting — each concrete blob type
//! overrides only the accessors its data actually supports.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::digest::Digest;
use crate::error::OcmError;
use crate::Result;

/// Default buffer size used by [`copy`] and [`BufferPool`] (spec §5
/// Shared-resource policy).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// A source of bytes. Implementors decide, via [`Blob::reader`], whether
/// repeated calls yield independent streams or whether the blob is
/// single-use (in which case the second call must fail).
#[async_trait]
pub trait Blob: std::fmt::Debug + Send + Sync {
    /// Open a fresh reader over this blob's content.
    async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// This blob's size, if known without reading it.
    fn as_size_aware(&self) -> Option<&dyn SizeAware> {
        None
    }

    /// This blob's digest, if known without reading it.
    fn as_digest_aware(&self) -> Option<&dyn DigestAware> {
        None
    }

    /// This blob's media type, if known.
    fn as_media_type_aware(&self) -> Option<&dyn MediaTypeAware> {
        None
    }
}

/// Capability: the blob can report its size without being read.
pub trait SizeAware: Send + Sync {
    /// Size in bytes.
    fn size(&self) -> u64;
}

/// Capability: the blob can report its digest without being fully read
/// (e.g. it was computed at construction time, or is memoized from an
/// earlier read).
pub trait DigestAware: Send + Sync {
    /// The digest, if already known. `None` means "read the blob to find
    /// out" — callers should fall back to [`copy`] with a digest sink.
    fn digest(&self) -> Option<Digest>;
}

/// Capability: the blob knows its own media type (e.g. an OCI layer's
/// content type).
pub trait MediaTypeAware: Send + Sync {
    /// The media type string.
    fn media_type(&self) -> &str;
}

/// A blob backed by a single in-memory buffer, readable exactly once
/// (spec §4.B "at-most-once" blobs: not restartable — a second `reader()`
/// call succeeds but yields an already-exhausted, empty stream rather than
/// failing the call itself).
#[derive(Debug)]
pub struct DirectBlob {
    data: Arc<Mutex<Option<bytes::Bytes>>>,
    size: u64,
    digest: Digest,
    media_type: String,
}

impl DirectBlob {
    /// Wrap `data`, computing its digest eagerly (it's already fully
    /// materialized, so there is no streaming cost to doing so).
    pub fn new(data: impl Into<bytes::Bytes>, media_type: impl Into<String>) -> Self {
        let data = data.into();
        let digest = Digest::sha256(&data);
        let size = data.len() as u64;
        Self {
            data: Arc::new(Mutex::new(Some(data))),
            size,
            digest,
            media_type: media_type.into(),
        }
    }
}

#[async_trait]
impl Blob for DirectBlob {
    #[instrument(skip(self))]
    async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut guard = self.data.lock().await;
        let data = guard.take().unwrap_or_default();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn as_size_aware(&self) -> Option<&dyn SizeAware> {
        Some(self)
    }

    fn as_digest_aware(&self) -> Option<&dyn DigestAware> {
        Some(self)
    }

    fn as_media_type_aware(&self) -> Option<&dyn MediaTypeAware> {
        Some(self)
    }
}

impl SizeAware for DirectBlob {
    fn size(&self) -> u64 {
        self.size
    }
}

impl DigestAware for DirectBlob {
    fn digest(&self) -> Option<Digest> {
        Some(self.digest.clone())
    }
}

impl MediaTypeAware for DirectBlob {
    fn media_type(&self) -> &str {
        &self.media_type
    }
}

/// A blob backed by a file on disk, freely re-readable. Its digest is
/// computed lazily on first request and memoized, mirroring the streaming
/// digest helper the underlying file-copy path already uses.
#[derive(Debug)]
pub struct FileBlob {
    path: std::path::PathBuf,
    size: u64,
    media_type: String,
    digest: Arc<Mutex<Option<Digest>>>,
}

impl FileBlob {
    /// Wrap an existing file, stat-ing it for size up front.
    pub async fn open(path: impl Into<std::path::PathBuf>, media_type: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        Ok(Self {
            path,
            size: meta.len(),
            media_type: media_type.into(),
            digest: Arc::new(Mutex::new(None)),
        })
    }

    /// Compute (or return the memoized) SHA256 digest by streaming the file.
    #[instrument(skip(self))]
    pub async fn digest(&self) -> Result<Digest> {
        let mut guard = self.digest.lock().await;
        if let Some(d) = guard.as_ref() {
            return Ok(d.clone());
        }
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        use sha2::{Digest as _, Sha256};
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = Digest {
            algorithm: Digest::SHA256.to_string(),
            hash: hasher.finalize().to_vec(),
        };
        *guard = Some(digest.clone());
        Ok(digest)
    }
}

#[async_trait]
impl Blob for FileBlob {
    async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        Ok(Box::new(file))
    }

    fn as_size_aware(&self) -> Option<&dyn SizeAware> {
        Some(self)
    }

    fn as_media_type_aware(&self) -> Option<&dyn MediaTypeAware> {
        Some(self)
    }
}

impl SizeAware for FileBlob {
    fn size(&self) -> u64 {
        self.size
    }
}

impl MediaTypeAware for FileBlob {
    fn media_type(&self) -> &str {
        &self.media_type
    }
}

/// A reader wrapper making `close()` idempotent, for callers that hold
/// onto a [`Blob`] reader across control-flow branches that may each try
/// to close it.
pub struct BlobReader {
    inner: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl BlobReader {
    /// Wrap a reader obtained from [`Blob::reader`].
    pub fn new(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Drop the underlying reader. Safe to call more than once.
    pub fn close(&mut self) {
        self.inner = None;
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            Some(r) => Pin::new(r).poll_read(cx, buf),
            None => std::task::Poll::Ready(Ok(())),
        }
    }
}

/// Copy `size` bytes (if known) or until EOF from `reader` into `writer`,
/// verifying the result against `expected` when given. The reader is
/// always closed and any close error is joined with a copy error rather
/// than discarded (spec §4.B `Copy`).
#[instrument(skip(reader, writer))]
pub async fn copy(
    mut reader: BlobReader,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
    size: Option<u64>,
    expected: Option<&Digest>,
) -> Result<u64> {
    use sha2::{Digest as _, Sha256};

    let mut hasher = expected.map(|_| Sha256::new());
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total: u64 = 0;

    let copy_result: Result<()> = async {
        loop {
            if let Some(limit) = size {
                if total >= limit {
                    break;
                }
            }
            let n = reader.read(&mut buf).await.context("read blob content")?;
            if n == 0 {
                break;
            }
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            writer.write_all(&buf[..n]).await.context("write blob content")?;
            total += n as u64;
        }
        if let Some(limit) = size {
            if total != limit {
                bail!(
                    "short read: expected {limit} bytes, copied {total}"
                );
            }
        }
        Ok(())
    }
    .await;

    reader.close();
    copy_result?;
    writer.flush().await.context("flush blob writer")?;

    if let (Some(hasher), Some(expected)) = (hasher, expected) {
        let actual = Digest {
            algorithm: Digest::SHA256.to_string(),
            hash: hasher.finalize().to_vec(),
        };
        if &actual != expected {
            bail!(OcmError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    Ok(total)
}

/// A pool of reusable fixed-size buffers, handed out to concurrent
/// [`copy`] calls so they don't each allocate a fresh 1 MiB scratch
/// buffer (spec §5 Shared-resource policy).
pub struct BufferPool {
    tx: tokio::sync::mpsc::Sender<bytes::BytesMut>,
    rx: Mutex<tokio::sync::mpsc::Receiver<bytes::BytesMut>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool holding up to `capacity` buffers of `buffer_size` bytes.
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            buffer_size,
        }
    }

    /// Borrow a buffer, allocating a new one if the pool is empty.
    pub async fn acquire(&self) -> bytes::BytesMut {
        let mut rx = self.rx.lock().await;
        match rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf.resize(self.buffer_size, 0);
                buf
            }
            Err(_) => bytes::BytesMut::zeroed(self.buffer_size),
        }
    }

    /// Return a buffer to the pool. Dropped silently if the pool is full.
    pub async fn release(&self, buf: bytes::BytesMut) {
        let _ = self.tx.send(buf).await;
    }
}

/// A blob reader that can be cancelled mid-stream: the producing side
/// writes into one end of an in-memory pipe while a background task races
/// the copy against a [`CancellationToken`], so a consumer blocked on
/// `read()` sees an error instead of hanging forever or silently
/// truncating to a clean EOF (spec §4.B "locked" blob semantics).
pub struct LockedBlobReader {
    read_half: tokio::io::DuplexStream,
    cancel: CancellationToken,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl LockedBlobReader {
    /// Spawn a task copying from `source` into an internal pipe, returning
    /// a reader over the other end. Calling [`LockedBlobReader::cancel`]
    /// (or dropping the returned token's last clone) stops the copy and
    /// causes subsequent reads to fail with [`OcmError::Cancelled`].
    pub fn spawn(mut source: Box<dyn AsyncRead + Send + Unpin>, buffer: usize) -> Self {
        let (write_half, read_half) = tokio::io::duplex(buffer);
        let cancel = CancellationToken::new();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let task_cancel = cancel.clone();
        let task_cancelled = cancelled.clone();
        tokio::spawn(async move {
            let mut write_half = write_half;
            let copy_fut = tokio::io::copy(&mut source, &mut write_half);
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    task_cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                result = copy_fut => {
                    if result.is_err() {
                        task_cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
                    }
                }
            }
        });

        Self {
            read_half,
            cancel,
            cancelled,
        }
    }

    /// Stop the background copy; subsequent reads return
    /// [`OcmError::Cancelled`] once the pipe drains.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl AsyncRead for LockedBlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.read_half).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) if buf.filled().len() == before => {
                if this.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                    std::task::Poll::Ready(Err(std::io::Error::other(OcmError::Cancelled)))
                } else {
                    std::task::Poll::Ready(Ok(()))
                }
            }
            other => other,
        }
    }
}
