//! Virtual filesystem abstraction (spec §4.C): an OS-backed implementation
//! rooted at a directory, and an in-memory implementation with Unix
//! unlink/refcount semantics, behind one trait.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre::{ensure, Context};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};
use tokio::sync::Mutex;

use crate::error::OcmError;
use crate::Result;

bitflags::bitflags! {
    /// POSIX-like open flags (spec §4.C).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const CREATE = 0b0000_0100;
        const TRUNCATE = 0b0000_1000;
        const APPEND = 0b0001_0000;
        const EXCLUSIVE = 0b0010_0000;
    }
}

/// Directory entry metadata returned by [`FileSystem::read_dir`]
/// and [`FileSystem::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Base name (not full path).
    pub name: String,
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// Unix-style mode bits (permission bits only; no file-type bits).
    pub mode: u32,
    /// Modification time, as a Unix timestamp in seconds.
    pub mtime: i64,
    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// An open file handle: readable, writable, and seekable depending on the
/// flags it was opened with.
pub trait FileHandle: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin> FileHandle for T {}

/// An open directory listing, with a cursor that advances as entries are
/// consumed (spec §4.C `ReadDir(-1)` = all entries, `ReadDir(n>0)` = up to
/// `n`, advancing the cursor and returning fewer (down to zero) once
/// exhausted).
#[async_trait]
pub trait DirHandle: Send {
    /// Read the next `n` entries (`n < 0` reads everything remaining).
    /// Returns an empty vector once the directory is exhausted.
    async fn next(&mut self, n: i64) -> Result<Vec<FileInfo>>;
}

/// A rooted filesystem. All paths passed to trait methods are relative to
/// [`FileSystem::base`] and must not escape it (spec invariant I-F2).
#[async_trait]
pub trait FileSystem: std::fmt::Debug + Send + Sync {
    /// The root this filesystem is confined to.
    fn base(&self) -> &Path;

    /// Open `path` with the given flags, returning a seekable handle.
    async fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn FileHandle>>;

    /// Convenience: open for reading only.
    async fn open_file(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        self.open(path, OpenFlags::READ).await
    }

    /// Create `path` and all missing parent directories.
    async fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()>;

    /// Remove a single file or empty directory.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Remove a path and everything beneath it.
    async fn remove_all(&self, path: &Path) -> Result<()>;

    /// Open a cursor over a directory's children (spec §4.C `ReadDir`).
    async fn read_dir(&self, path: &Path) -> Result<Box<dyn DirHandle>>;

    /// Convenience: read every entry of a directory in one call.
    async fn read_dir_all(&self, path: &Path) -> Result<Vec<FileInfo>> {
        self.read_dir(path).await?.next(-1).await
    }

    /// Stat a single path.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Whether this filesystem currently rejects writes.
    fn read_only(&self) -> bool;

    /// Flip the filesystem into (or out of) read-only mode.
    fn force_read_only(&self, read_only: bool);
}

/// Resolve `path` against `base`, rejecting any path whose normalized form
/// escapes `base` (spec invariant I-F2), without requiring the path to
/// exist.
fn resolve_within(base: &Path, path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                ensure!(normalized.pop(), OcmError::WorkingDirEscape);
            }
            Component::RootDir | Component::Prefix(_) => {
                bail_escape()?;
            }
        }
    }
    Ok(base.join(normalized))
}

fn bail_escape() -> Result<()> {
    Err(OcmError::WorkingDirEscape.into())
}

/// A filesystem rooted at a real directory on disk, backed by `tokio::fs`.
#[derive(Debug)]
pub struct OsFileSystem {
    base: PathBuf,
    read_only: std::sync::atomic::AtomicBool,
}

impl OsFileSystem {
    /// Root a filesystem at `base`, which must already exist.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            read_only: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only() {
            return Err(OcmError::ReadOnly.into());
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for OsFileSystem {
    fn base(&self) -> &Path {
        &self.base
    }

    #[tracing::instrument(skip(self))]
    async fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn FileHandle>> {
        let full = resolve_within(&self.base, path)?;
        if flags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE) {
            self.check_writable()?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(flags.contains(OpenFlags::READ) || !flags.contains(OpenFlags::WRITE))
            .write(flags.contains(OpenFlags::WRITE))
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .append(flags.contains(OpenFlags::APPEND))
            .create_new(flags.contains(OpenFlags::EXCLUSIVE));
        let file = options
            .open(&full)
            .await
            .with_context(|| format!("open {}", full.display()))?;
        Ok(Box::new(file))
    }

    async fn mkdir_all(&self, path: &Path, _mode: u32) -> Result<()> {
        self.check_writable()?;
        let full = resolve_within(&self.base, path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .with_context(|| format!("mkdir_all {}", full.display()))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.check_writable()?;
        let full = resolve_within(&self.base, path)?;
        let meta = tokio::fs::metadata(&full).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        }
        .with_context(|| format!("remove {}", full.display()))
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        self.check_writable()?;
        let full = resolve_within(&self.base, path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full).await,
            Ok(_) => tokio::fs::remove_file(&full).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
        .with_context(|| format!("remove_all {}", full.display()))
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn DirHandle>> {
        let full = resolve_within(&self.base, path)?;
        let inner = tokio::fs::read_dir(&full)
            .await
            .with_context(|| format!("read_dir {}", full.display()))?;
        Ok(Box::new(OsDirHandle { inner }))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let full = resolve_within(&self.base, path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .with_context(|| format!("stat {}", full.display()))?;
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(to_file_info(&name, &meta))
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn force_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

/// [`DirHandle`] over a real directory, advancing `tokio::fs::ReadDir`'s
/// own cursor one entry at a time.
struct OsDirHandle {
    inner: tokio::fs::ReadDir,
}

#[async_trait]
impl DirHandle for OsDirHandle {
    async fn next(&mut self, n: i64) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        loop {
            if n >= 0 && out.len() as i64 >= n {
                break;
            }
            match self.inner.next_entry().await? {
                Some(entry) => {
                    let meta = entry.metadata().await?;
                    out.push(to_file_info(&entry.file_name().to_string_lossy(), &meta));
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(unix)]
fn to_file_info(name: &str, meta: &std::fs::Metadata) -> FileInfo {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    FileInfo {
        name: name.to_string(),
        size: meta.len(),
        mode: meta.permissions().mode() & 0o777,
        mtime: meta.mtime(),
        is_dir: meta.is_dir(),
    }
}

#[cfg(not(unix))]
fn to_file_info(name: &str, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size: meta.len(),
        mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
        mtime: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default(),
        is_dir: meta.is_dir(),
    }
}

/// A single node in the in-memory tree: either a directory (child map) or
/// a file (byte buffer). Files carry a refcount so that an unlink while a
/// handle is still open (spec invariant I-F1) keeps the bytes alive until
/// the last handle closes.
#[derive(Debug)]
enum NodeKind {
    Dir(HashMap<String, Arc<Mutex<Node>>>),
    File(Vec<u8>),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    mode: u32,
    mtime: i64,
    refcount: u32,
    unlinked: bool,
}

impl Node {
    fn new_dir(mode: u32, mtime: i64) -> Self {
        Self {
            kind: NodeKind::Dir(HashMap::new()),
            mode,
            mtime,
            refcount: 0,
            unlinked: false,
        }
    }

    fn new_file(mode: u32, mtime: i64) -> Self {
        Self {
            kind: NodeKind::File(Vec::new()),
            mode,
            mtime,
            refcount: 0,
            unlinked: false,
        }
    }
}

/// An in-memory filesystem implementing Unix semantics: unlinking a file
/// that is still open keeps its bytes reachable through existing handles
/// (I-F1), directory mtimes bump on structural change (I-F3), and
/// permission bits are enforced both at `open` time and on each
/// subsequent read/write (I-F2... see module docs in `vfs.rs`).
#[derive(Debug)]
pub struct MemFileSystem {
    base: PathBuf,
    root: Arc<Mutex<Node>>,
    read_only: std::sync::atomic::AtomicBool,
    clock: AtomicU32,
}

impl Default for MemFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFileSystem {
    /// Create an empty in-memory filesystem rooted at `/`.
    pub fn new() -> Self {
        Self {
            base: PathBuf::from("/"),
            root: Arc::new(Mutex::new(Node::new_dir(0o755, 0))),
            read_only: std::sync::atomic::AtomicBool::new(false),
            clock: AtomicU32::new(1),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) as i64
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only() {
            return Err(OcmError::ReadOnly.into());
        }
        Ok(())
    }

    async fn walk_parent(&self, path: &Path, create: bool) -> Result<(Arc<Mutex<Node>>, String)> {
        let normalized = resolve_within(Path::new(""), path)?;
        let mut parts: Vec<String> = normalized
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let name = parts.pop().ok_or_else(|| OcmError::NotFound {
            what: "empty path".into(),
        })?;

        let mut current = self.root.clone();
        for part in parts {
            let next = {
                let mut guard = current.lock().await;
                let mtime = self.tick();
                match &mut guard.kind {
                    NodeKind::Dir(children) => {
                        if let Some(child) = children.get(&part) {
                            child.clone()
                        } else if create {
                            let node = Arc::new(Mutex::new(Node::new_dir(0o755, mtime)));
                            children.insert(part.clone(), node.clone());
                            guard.mtime = mtime;
                            node
                        } else {
                            return Err(OcmError::NotFound { what: part }.into());
                        }
                    }
                    NodeKind::File(_) => {
                        return Err(OcmError::NotFound {
                            what: format!("{part}: not a directory"),
                        }
                        .into())
                    }
                }
            };
            current = next;
        }
        Ok((current, name))
    }
}

#[async_trait]
impl FileSystem for MemFileSystem {
    fn base(&self) -> &Path {
        &self.base
    }

    async fn open(&self, path: &Path, flags: OpenFlags) -> Result<Box<dyn FileHandle>> {
        let wants_write = flags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE);
        if wants_write {
            self.check_writable()?;
        }
        let (parent, name) = self.walk_parent(path, flags.contains(OpenFlags::CREATE)).await?;
        let mtime = self.tick();

        let node = {
            let mut parent_guard = parent.lock().await;
            let NodeKind::Dir(children) = &mut parent_guard.kind else {
                return Err(OcmError::NotFound {
                    what: "parent is not a directory".into(),
                }
                .into());
            };
            match children.get(&name) {
                Some(existing) => {
                    if flags.contains(OpenFlags::EXCLUSIVE) {
                        return Err(OcmError::Conflict { what: name }.into());
                    }
                    existing.clone()
                }
                None if flags.contains(OpenFlags::CREATE) => {
                    let node = Arc::new(Mutex::new(Node::new_file(0o644, mtime)));
                    children.insert(name.clone(), node.clone());
                    parent_guard.mtime = mtime;
                    node
                }
                None => {
                    return Err(OcmError::NotFound { what: name }.into());
                }
            }
        };

        {
            let mut guard = node.lock().await;
            if wants_write && guard.mode & 0o200 == 0 {
                return Err(OcmError::Permission.into());
            }
            if flags.contains(OpenFlags::READ) && guard.mode & 0o400 == 0 {
                return Err(OcmError::Permission.into());
            }
            if flags.contains(OpenFlags::TRUNCATE) {
                if let NodeKind::File(data) = &mut guard.kind {
                    data.clear();
                }
            }
            guard.refcount += 1;
        }

        Ok(Box::new(MemFileHandle {
            node,
            position: if flags.contains(OpenFlags::APPEND) {
                u64::MAX
            } else {
                0
            },
            append: flags.contains(OpenFlags::APPEND),
            writable: wants_write,
            readable: flags.contains(OpenFlags::READ) || !wants_write,
        }))
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        self.check_writable()?;
        let normalized = resolve_within(Path::new(""), path)?;
        let mut current = self.root.clone();
        for part in normalized.components() {
            let part = part.as_os_str().to_string_lossy().to_string();
            let mtime = self.tick();
            let mut guard = current.lock().await;
            let NodeKind::Dir(children) = &mut guard.kind else {
                return Err(OcmError::NotFound {
                    what: "not a directory".into(),
                }
                .into());
            };
            let next = children
                .entry(part)
                .or_insert_with(|| Arc::new(Mutex::new(Node::new_dir(mode, mtime))))
                .clone();
            guard.mtime = mtime;
            drop(guard);
            current = next;
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.check_writable()?;
        let (parent, name) = self.walk_parent(path, false).await?;
        let mtime = self.tick();
        let mut parent_guard = parent.lock().await;
        let NodeKind::Dir(children) = &mut parent_guard.kind else {
            return Err(OcmError::NotFound {
                what: "parent is not a directory".into(),
            }
            .into());
        };
        let node = children
            .get(&name)
            .cloned()
            .ok_or_else(|| OcmError::NotFound { what: name.clone() })?;
        {
            let guard = node.lock().await;
            if let NodeKind::Dir(inner) = &guard.kind {
                ensure!(inner.is_empty(), OcmError::Conflict {
                    what: format!("{name}: directory not empty")
                });
            }
        }
        children.remove(&name);
        parent_guard.mtime = mtime;
        drop(parent_guard);
        let mut guard = node.lock().await;
        guard.unlinked = true;
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        self.check_writable()?;
        let (parent, name) = self.walk_parent(path, false).await?;
        let mtime = self.tick();
        let mut parent_guard = parent.lock().await;
        let NodeKind::Dir(children) = &mut parent_guard.kind else {
            return Ok(());
        };
        if let Some(node) = children.remove(&name) {
            parent_guard.mtime = mtime;
            drop(parent_guard);
            mark_unlinked_recursive(&node).await;
        }
        Ok(())
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn DirHandle>> {
        let normalized = resolve_within(Path::new(""), path)?;
        let mut current = self.root.clone();
        for part in normalized.components() {
            let part = part.as_os_str().to_string_lossy().to_string();
            let next = {
                let guard = current.lock().await;
                let NodeKind::Dir(children) = &guard.kind else {
                    return Err(OcmError::NotFound {
                        what: "not a directory".into(),
                    }
                    .into());
                };
                children
                    .get(&part)
                    .cloned()
                    .ok_or_else(|| OcmError::NotFound { what: part.clone() })?
            };
            current = next;
        }
        let guard = current.lock().await;
        let NodeKind::Dir(children) = &guard.kind else {
            return Err(OcmError::NotFound {
                what: "not a directory".into(),
            }
            .into());
        };
        let mut entries = Vec::new();
        for (name, child) in children {
            let child_guard = child.lock().await;
            entries.push(node_to_file_info(name, &child_guard));
        }
        Ok(Box::new(MemDirHandle { entries, cursor: 0 }))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        if path.as_os_str().is_empty() || path == Path::new(".") {
            let guard = self.root.lock().await;
            return Ok(node_to_file_info("", &guard));
        }
        let (parent, name) = self.walk_parent(path, false).await?;
        let parent_guard = parent.lock().await;
        let NodeKind::Dir(children) = &parent_guard.kind else {
            return Err(OcmError::NotFound {
                what: "parent is not a directory".into(),
            }
            .into());
        };
        let node = children
            .get(&name)
            .ok_or_else(|| OcmError::NotFound { what: name.clone() })?;
        let guard = node.lock().await;
        Ok(node_to_file_info(&name, &guard))
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn force_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}

fn node_to_file_info(name: &str, node: &Node) -> FileInfo {
    let is_dir = matches!(node.kind, NodeKind::Dir(_));
    let size = match &node.kind {
        NodeKind::File(data) => data.len() as u64,
        NodeKind::Dir(_) => 0,
    };
    FileInfo {
        name: name.to_string(),
        size,
        mode: node.mode,
        mtime: node.mtime,
        is_dir,
    }
}

/// [`DirHandle`] over an in-memory directory's snapshot, taken at the time
/// `read_dir` was called; the cursor advances over that snapshot rather
/// than re-reading the live node on every call.
struct MemDirHandle {
    entries: Vec<FileInfo>,
    cursor: usize,
}

#[async_trait]
impl DirHandle for MemDirHandle {
    async fn next(&mut self, n: i64) -> Result<Vec<FileInfo>> {
        if self.cursor >= self.entries.len() {
            return Ok(Vec::new());
        }
        let end = if n < 0 {
            self.entries.len()
        } else {
            std::cmp::min(self.entries.len(), self.cursor + n as usize)
        };
        let slice = self.entries[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(slice)
    }
}

fn mark_unlinked_recursive<'a>(node: &'a Arc<Mutex<Node>>) -> Pin<'a> {
    Box::pin(async move {
        let mut guard = node.lock().await;
        guard.unlinked = true;
        if let NodeKind::Dir(children) = &guard.kind {
            let children: Vec<_> = children.values().cloned().collect();
            drop(guard);
            for child in children {
                mark_unlinked_recursive(&child).await;
            }
        }
    })
}

type Pin<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>;

/// A handle onto an in-memory file, decrementing the node's refcount on
/// drop; the bytes only disappear once the refcount hits zero *and* the
/// node has been unlinked (I-F1).
struct MemFileHandle {
    node: Arc<Mutex<Node>>,
    position: u64,
    append: bool,
    writable: bool,
    readable: bool,
}

impl Drop for MemFileHandle {
    fn drop(&mut self) {
        let node = self.node.clone();
        tokio::spawn(async move {
            let mut guard = node.lock().await;
            guard.refcount = guard.refcount.saturating_sub(1);
        });
    }
}

impl AsyncRead for MemFileHandle {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.readable {
            return std::task::Poll::Ready(Err(std::io::Error::other(OcmError::Permission)));
        }
        let fut = this.node.lock();
        tokio::pin!(fut);
        match fut.poll(cx) {
            std::task::Poll::Ready(guard) => {
                if let NodeKind::File(data) = &guard.kind {
                    let pos = this.position as usize;
                    if pos < data.len() {
                        let n = std::cmp::min(buf.remaining(), data.len() - pos);
                        buf.put_slice(&data[pos..pos + n]);
                        this.position += n as u64;
                    }
                }
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl AsyncWrite for MemFileHandle {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if !this.writable {
            return std::task::Poll::Ready(Err(std::io::Error::other(OcmError::Permission)));
        }
        let fut = this.node.lock();
        tokio::pin!(fut);
        match fut.poll(cx) {
            std::task::Poll::Ready(mut guard) => {
                if let NodeKind::File(buf) = &mut guard.kind {
                    let pos = if this.append {
                        buf.len()
                    } else {
                        this.position as usize
                    };
                    if buf.len() < pos + data.len() {
                        buf.resize(pos + data.len(), 0);
                    }
                    buf[pos..pos + data.len()].copy_from_slice(data);
                    this.position = (pos + data.len()) as u64;
                }
                std::task::Poll::Ready(Ok(data.len()))
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemFileHandle {
    fn start_seek(self: std::pin::Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        this.position = match position {
            std::io::SeekFrom::Start(p) => p,
            std::io::SeekFrom::Current(delta) => (this.position as i64 + delta).max(0) as u64,
            std::io::SeekFrom::End(_) => this.position,
        };
        Ok(())
    }

    fn poll_complete(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<u64>> {
        std::task::Poll::Ready(Ok(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn mem_fs_write_then_read() {
        let fs = MemFileSystem::new();
        let mut handle = fs
            .open(Path::new("a/b.txt"), OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE)
            .await
            .expect("open for write");
        handle.write_all(b"content").await.expect("write");
        drop(handle);

        let mut reader = fs.open_file(Path::new("a/b.txt")).await.expect("open for read");
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.expect("read");
        assert_eq!(buf, b"content");
    }

    #[tokio::test]
    async fn mem_fs_rejects_escape() {
        let fs = MemFileSystem::new();
        let err = fs.open(Path::new("../escape"), OpenFlags::READ).await.unwrap_err();
        assert!(err.downcast_ref::<OcmError>().is_some());
    }

    #[tokio::test]
    async fn mem_fs_read_only_blocks_writes() {
        let fs = MemFileSystem::new();
        fs.force_read_only(true);
        let err = fs
            .open(Path::new("x.txt"), OpenFlags::WRITE | OpenFlags::CREATE)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<OcmError>().is_some());
    }

    #[tokio::test]
    async fn mem_fs_unlink_while_open_keeps_bytes_readable() {
        let fs = MemFileSystem::new();
        let mut w = fs
            .open(Path::new("f.txt"), OpenFlags::WRITE | OpenFlags::CREATE)
            .await
            .unwrap();
        w.write_all(b"still here").await.unwrap();

        let mut open_reader = fs.open_file(Path::new("f.txt")).await.unwrap();
        fs.remove(Path::new("f.txt")).await.expect("unlink while open");

        assert!(fs.stat(Path::new("f.txt")).await.is_err());

        let mut out = Vec::new();
        open_reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"still here");
    }

    #[tokio::test]
    async fn mem_fs_mkdir_all_then_read_dir() {
        let fs = MemFileSystem::new();
        fs.mkdir_all(Path::new("a/b/c"), 0o755).await.unwrap();
        let entries = fs.read_dir_all(Path::new("a")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);
    }

    #[tokio::test]
    async fn mem_fs_read_dir_cursor_advances_and_signals_eof() {
        let fs = MemFileSystem::new();
        fs.mkdir_all(Path::new("d"), 0o755).await.unwrap();
        for name in ["a", "b", "c"] {
            fs.open(
                Path::new(&format!("d/{name}")),
                OpenFlags::WRITE | OpenFlags::CREATE,
            )
            .await
            .unwrap();
        }

        let mut handle = fs.read_dir(Path::new("d")).await.unwrap();
        let first = handle.next(1).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = handle.next(1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].name, second[0].name);
        let third = handle.next(1).await.unwrap();
        assert_eq!(third.len(), 1);
        let exhausted = handle.next(1).await.unwrap();
        assert!(exhausted.is_empty());
    }

    #[tokio::test]
    async fn mem_fs_write_only_handle_rejects_read() {
        let fs = MemFileSystem::new();
        let mut handle = fs
            .open(Path::new("f.txt"), OpenFlags::WRITE | OpenFlags::CREATE)
            .await
            .unwrap();
        handle.write_all(b"x").await.unwrap();

        let mut buf = [0u8; 4];
        let err = handle.read(&mut buf).await;
        assert!(err.is_err());
    }
}
