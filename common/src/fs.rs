//! Storage backends the downloader writes into.
//!
//! The pool only ever needs four capabilities from a backend: checking whether a path exists,
//! creating a directory tree, creating a file for writing and removing a file. Paths handed to a
//! backend are relative to its root (`<peer>/<tag>/<file>`); the backend decides where that root
//! lives.
//!
//! Two backends are provided:
//! - [`LocalFs`] writes to a directory on the local disk using `tokio::fs`
//! - [`MemoryFs`] keeps everything in memory and records how many files are open at once

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use anyhow::{anyhow, Context};
use tokio::io::AsyncWrite;

/// Writable handle returned by [`Filesystem::create_file`].
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Minimal capability set over a path-addressed byte store.
///
/// Implementations must tolerate concurrent calls from distinct workers on distinct paths.
#[async_trait::async_trait]
pub trait Filesystem: Send + Sync {
    async fn exists(&self, path: &Path) -> anyhow::Result<bool>;
    /// Create `path` and all of its missing parents. Succeeds if the directory already exists.
    async fn create_dir_all(&self, path: &Path) -> anyhow::Result<()>;
    /// Create a new file at `path` and open it for writing. Fails if `path` already exists.
    async fn create_file(&self, path: &Path) -> anyhow::Result<BoxedWrite>;
    async fn remove_file(&self, path: &Path) -> anyhow::Result<()>;
}

/// Backend writing under a root directory on the local disk.
#[derive(Clone, Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait::async_trait]
impl Filesystem for LocalFs {
    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        let full_path = self.full_path(path);
        tokio::fs::try_exists(&full_path)
            .await
            .with_context(|| format!("failed checking if {:?} exists", &full_path))
    }

    async fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
        let full_path = self.full_path(path);
        tokio::fs::create_dir_all(&full_path)
            .await
            .with_context(|| format!("cannot create directory {:?}", &full_path))
    }

    async fn create_file(&self, path: &Path) -> anyhow::Result<BoxedWrite> {
        let full_path = self.full_path(path);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
            .with_context(|| format!("cannot create file {:?}", &full_path))?;
        Ok(Box::new(file))
    }

    async fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        let full_path = self.full_path(path);
        tokio::fs::remove_file(&full_path)
            .await
            .with_context(|| format!("failed removing {:?}", &full_path))
    }
}

#[derive(Default)]
struct MemoryState {
    directories: std::collections::HashSet<PathBuf>,
    files: std::collections::HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    denied: Vec<PathBuf>,
}

impl MemoryState {
    fn check_allowed(&self, path: &Path) -> anyhow::Result<()> {
        if self.denied.iter().any(|prefix| path.starts_with(prefix)) {
            return Err(anyhow!("permission denied: {:?}", path));
        }
        Ok(())
    }

    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.directories.contains(parent),
            _ => true,
        }
    }
}

#[derive(Default)]
struct OpenFiles {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// In-memory backend.
///
/// Cloning a `MemoryFs` yields a handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryFs {
    state: Arc<Mutex<MemoryState>>,
    open_files: Arc<OpenFiles>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    /// Make every operation on `prefix` (and anything below it) fail.
    pub fn deny(&self, prefix: impl Into<PathBuf>) {
        self.state().denied.push(prefix.into());
    }

    /// Contents of the file at `path`, if it exists.
    pub fn read(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state()
            .files
            .get(path.as_ref())
            .map(|data| data.lock().unwrap().clone())
    }

    /// All file paths currently stored, sorted.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.state().files.keys().cloned().collect();
        files.sort();
        files
    }

    /// Number of file handles that are currently open.
    pub fn open_files(&self) -> usize {
        self.open_files.current.load(Ordering::Acquire)
    }

    /// Highest number of file handles that were open at the same time.
    pub fn peak_open_files(&self) -> usize {
        self.open_files.peak.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Filesystem for MemoryFs {
    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        let state = self.state();
        state.check_allowed(path)?;
        Ok(state.files.contains_key(path) || state.directories.contains(path))
    }

    async fn create_dir_all(&self, path: &Path) -> anyhow::Result<()> {
        let mut state = self.state();
        state.check_allowed(path)?;
        if state.files.contains_key(path) {
            return Err(anyhow!("cannot create directory {:?}: file exists", path));
        }
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            state.directories.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn create_file(&self, path: &Path) -> anyhow::Result<BoxedWrite> {
        let mut state = self.state();
        state.check_allowed(path)?;
        if !state.parent_exists(path) {
            return Err(anyhow!("cannot create file {:?}: no such directory", path));
        }
        if state.directories.contains(path) {
            return Err(anyhow!("cannot create file {:?}: is a directory", path));
        }
        if state.files.contains_key(path) {
            return Err(anyhow!("cannot create file {:?}: file exists", path));
        }
        let data = Arc::new(Mutex::new(Vec::new()));
        state.files.insert(path.to_path_buf(), data.clone());
        let current = self.open_files.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.open_files.peak.fetch_max(current, Ordering::AcqRel);
        Ok(Box::new(MemoryFile {
            data,
            open_files: self.open_files.clone(),
        }))
    }

    async fn remove_file(&self, path: &Path) -> anyhow::Result<()> {
        let mut state = self.state();
        state.check_allowed(path)?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| anyhow!("failed removing {:?}: no such file", path))
    }
}

struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
    open_files: Arc<OpenFiles>,
}

impl AsyncWrite for MemoryFile {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.open_files.current.fetch_sub(1, Ordering::AcqRel);
    }
}
