//! Collision-free destination names.
//!
//! When `dir/name` is taken the resolver tries `stem_1.ext`, `stem_2.ext`, ... and picks the
//! first free one. Name lookup and file creation for a directory happen under a per-directory lock so
//! that two workers of the same process never settle on the same generated name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::instrument;

use crate::fs::{BoxedWrite, Filesystem};

/// Turn an arbitrary string into a single, harmless path component.
pub fn sanitize_component(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => sanitized,
    }
}

/// Name of the `n`-th alternative for `name`, e.g. `a.jpg` -> `a_2.jpg`.
pub fn numbered_name(name: &str, n: u64) -> String {
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|s| s.to_str()),
    ) {
        (Some(stem), Some(ext)) => format!("{stem}_{n}.{ext}"),
        _ => format!("{name}_{n}"),
    }
}

type LockMap = std::collections::HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

/// Hands out one async lock per destination directory.
///
/// An entry lives only while some task holds or waits for its lock.
#[derive(Default)]
struct DirLocks {
    locks: std::sync::Mutex<LockMap>,
}

impl DirLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, LockMap> {
        // the map is never left half-updated, a poisoned lock is still usable
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn lock(&self, dir: &Path) -> DirGuard<'_> {
        let lock = self.map().entry(dir.to_path_buf()).or_default().clone();
        let guard = lock.lock_owned().await;
        DirGuard {
            locks: self,
            dir: dir.to_path_buf(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Holds a directory lock; drops the map entry when nobody else uses it.
struct DirGuard<'a> {
    locks: &'a DirLocks,
    dir: PathBuf,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        // clones are only taken under the map lock, so a count of 1 means no holder or waiter
        let unused = map
            .get(&self.dir)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if unused {
            map.remove(&self.dir);
        }
    }
}

pub struct Resolver {
    fs: Arc<dyn Filesystem>,
    locks: DirLocks,
}

impl Resolver {
    pub fn new(fs: Arc<dyn Filesystem>) -> Self {
        Self {
            fs,
            locks: DirLocks::default(),
        }
    }

    /// Pick a free path for `name` inside `dir`.
    ///
    /// Returns `None` when `dir/name` already exists and `skip_if_exists` is set; that is not an
    /// error, it means there is nothing to do.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        dir: &Path,
        name: &str,
        skip_if_exists: bool,
    ) -> anyhow::Result<Option<PathBuf>> {
        let path = dir.join(name);
        if !self.fs.exists(&path).await? {
            return Ok(Some(path));
        }
        if skip_if_exists {
            tracing::debug!("{:?} already exists, skipping", &path);
            return Ok(None);
        }
        let mut n = 1;
        loop {
            let candidate = dir.join(numbered_name(name, n));
            if !self.fs.exists(&candidate).await? {
                tracing::debug!("{:?} already exists, using {:?}", &path, &candidate);
                return Ok(Some(candidate));
            }
            n += 1;
        }
    }

    /// Resolve a free path for `name` inside `dir` and create the file there.
    pub async fn create(
        &self,
        dir: &Path,
        name: &str,
        skip_if_exists: bool,
    ) -> anyhow::Result<Option<(PathBuf, BoxedWrite)>> {
        let _dir_guard = self.locks.lock(dir).await;
        let Some(path) = self.resolve(dir, name, skip_if_exists).await? else {
            return Ok(None);
        };
        let handle = self.fs.create_file(&path).await?;
        Ok(Some((path, handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    /// Poll `future` once, returning its output if it was ready.
    async fn poll_once<F: std::future::Future + Unpin>(future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = future => Some(output),
            _ = std::future::ready(()) => None,
        }
    }

    async fn setup(existing: &[&str]) -> anyhow::Result<(MemoryFs, Resolver)> {
        let fs = MemoryFs::new();
        fs.create_dir_all(Path::new("peer")).await?;
        for name in existing {
            fs.create_file(&Path::new("peer").join(name)).await?;
        }
        let resolver = Resolver::new(Arc::new(fs.clone()));
        Ok((fs, resolver))
    }

    #[test]
    fn numbered_names() {
        assert_eq!(numbered_name("a.jpg", 1), "a_1.jpg");
        assert_eq!(numbered_name("a.jpg", 12), "a_12.jpg");
        assert_eq!(numbered_name("archive.tar.gz", 1), "archive.tar_1.gz");
        assert_eq!(numbered_name("README", 3), "README_3");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc_1");
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_component("alice"), "alice");
        assert_eq!(sanitize_component("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("."), "_");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("..hidden"), "..hidden");
    }

    #[tokio::test]
    async fn free_name_is_kept() -> anyhow::Result<()> {
        let (_fs, resolver) = setup(&["b.jpg"]).await?;
        let path = resolver.resolve(Path::new("peer"), "a.jpg", false).await?;
        assert_eq!(path, Some(PathBuf::from("peer/a.jpg")));
        Ok(())
    }

    #[tokio::test]
    async fn collision_picks_smallest_free_suffix() -> anyhow::Result<()> {
        let (_fs, resolver) = setup(&["a.jpg", "a_1.jpg", "a_3.jpg"]).await?;
        let path = resolver.resolve(Path::new("peer"), "a.jpg", false).await?;
        assert_eq!(path, Some(PathBuf::from("peer/a_2.jpg")));
        Ok(())
    }

    #[tokio::test]
    async fn collision_with_skip_if_exists_skips() -> anyhow::Result<()> {
        let (_fs, resolver) = setup(&["a.jpg"]).await?;
        assert_eq!(
            resolver.resolve(Path::new("peer"), "a.jpg", true).await?,
            None
        );
        // skip only applies to the requested name itself
        assert_eq!(
            resolver.resolve(Path::new("peer"), "b.jpg", true).await?,
            Some(PathBuf::from("peer/b.jpg"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn create_reserves_the_resolved_name() -> anyhow::Result<()> {
        let (fs, resolver) = setup(&["a.jpg"]).await?;
        let (first, _first_handle) = resolver
            .create(Path::new("peer"), "a.jpg", false)
            .await?
            .expect("destination expected");
        let (second, _second_handle) = resolver
            .create(Path::new("peer"), "a.jpg", false)
            .await?
            .expect("destination expected");
        assert_eq!(first, PathBuf::from("peer/a_1.jpg"));
        assert_eq!(second, PathBuf::from("peer/a_2.jpg"));
        assert_eq!(fs.files().len(), 3);
        assert_eq!(resolver.locks.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_creates_never_share_a_name() -> anyhow::Result<()> {
        let (fs, resolver) = setup(&["a.jpg"]).await?;
        let resolver = Arc::new(resolver);
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let resolver = resolver.clone();
            join_set.spawn(async move {
                resolver
                    .create(Path::new("peer"), "a.jpg", false)
                    .await
                    .map(|created| created.map(|(path, _)| path))
            });
        }
        let mut paths = std::collections::HashSet::new();
        while let Some(res) = join_set.join_next().await {
            let path = res??.expect("destination expected");
            assert!(paths.insert(path));
        }
        assert_eq!(paths.len(), 16);
        assert_eq!(fs.files().len(), 17);
        assert_eq!(resolver.locks.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn filesystem_errors_propagate() -> anyhow::Result<()> {
        let (fs, resolver) = setup(&[]).await?;
        fs.deny("peer");
        assert!(resolver.resolve(Path::new("peer"), "a.jpg", false).await.is_err());
        assert!(resolver.create(Path::new("peer"), "a.jpg", false).await.is_err());
        assert_eq!(resolver.locks.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn directory_lock_is_released_and_pruned() -> anyhow::Result<()> {
        let locks = DirLocks::default();
        let first = locks.lock(Path::new("peer")).await;
        let other = locks.lock(Path::new("other")).await;
        assert_eq!(locks.len(), 2);
        drop(other);
        assert_eq!(locks.len(), 1);
        // a waiter keeps the entry alive after the holder leaves
        let waiter = locks.lock(Path::new("peer"));
        tokio::pin!(waiter);
        assert!(poll_once(waiter.as_mut()).await.is_none());
        drop(first);
        let second = waiter.await;
        assert_eq!(locks.len(), 1);
        drop(second);
        assert_eq!(locks.len(), 0);
        Ok(())
    }
}
