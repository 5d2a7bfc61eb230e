//! Snapshots are swapped in whole. Mutations only schedule a rebuild, so a
//! client reading the index right after one may still see the old state.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use chrono::Utc;
use tokio::{sync::mpsc, task};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::{
    error::AppError,
    models::files::{FileEntry, FileIndex, is_partial_upload},
};

pub fn build_index(root: &Path) -> FileIndex {
    let last_indexed = Utc::now();
    let mut files = Vec::new();
    let mut directories = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for item in walker {
        let dir_entry = match item {
            Ok(dir_entry) => dir_entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };

        let path = dir_entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        let name = dir_entry.file_name().to_string_lossy();
        if is_partial_upload(&name) {
            continue;
        }

        match FileEntry::inspect(path, &name, &relative) {
            Ok(entry) if entry.is_dir => directories.push(entry),
            Ok(entry) => {
                if entry.is_broken_link() {
                    debug!(path = %relative, "indexing broken symlink");
                }
                files.push(entry);
            }
            Err(err) => debug!(path = %path.display(), error = %err, "skipping entry"),
        }
    }

    let total_files = files.len();
    let total_size = files.iter().map(|file| file.size).sum();

    FileIndex {
        files,
        directories,
        last_indexed,
        total_files,
        total_size,
    }
}

#[derive(Clone)]
pub struct IndexHandle {
    inner: Arc<Shared>,
    trigger: mpsc::UnboundedSender<()>,
}

struct Shared {
    root: PathBuf,
    current: RwLock<Installed>,
    next_seq: AtomicU64,
}

struct Installed {
    seq: u64,
    index: Arc<FileIndex>,
}

impl IndexHandle {
    pub async fn start(root: PathBuf) -> Result<Self, AppError> {
        let (trigger, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(Shared {
                root,
                current: RwLock::new(Installed {
                    seq: 0,
                    index: Arc::new(FileIndex::empty()),
                }),
                next_seq: AtomicU64::new(1),
            }),
            trigger,
        };

        handle.rebuild().await?;
        tokio::spawn(run_worker(Arc::clone(&handle.inner), receiver));
        Ok(handle)
    }

    pub fn snapshot(&self) -> Arc<FileIndex> {
        let current = self
            .inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current.index)
    }

    pub async fn rebuild(&self) -> Result<Arc<FileIndex>, AppError> {
        rebuild_shared(&self.inner).await
    }

    pub fn schedule_rebuild(&self) {
        if self.trigger.send(()).is_err() {
            error!("index worker has stopped; rebuild request dropped");
        }
    }
}

async fn rebuild_shared(shared: &Arc<Shared>) -> Result<Arc<FileIndex>, AppError> {
    let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
    let root = shared.root.clone();
    let started = Instant::now();

    let index = task::spawn_blocking(move || build_index(&root))
        .await
        .map_err(|err| AppError::Internal(format!("index build panicked: {err}")))?;
    let index = Arc::new(index);

    info!(
        files = index.total_files,
        directories = index.directories.len(),
        total_size = index.total_size,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "index rebuilt"
    );

    Ok(shared.install(seq, index))
}

impl Shared {
    // A build that started later may already be installed.
    fn install(&self, seq: u64, index: Arc<FileIndex>) -> Arc<FileIndex> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if seq > current.seq {
            *current = Installed { seq, index };
        } else {
            debug!(seq, installed = current.seq, "discarding stale index build");
        }
        Arc::clone(&current.index)
    }
}

async fn run_worker(shared: Arc<Shared>, mut receiver: mpsc::UnboundedReceiver<()>) {
    while receiver.recv().await.is_some() {
        // Collapse a burst of triggers into a single walk.
        while receiver.try_recv().is_ok() {}

        if let Err(err) = rebuild_shared(&shared).await {
            error!(error = %err, "background index rebuild failed");
        }
    }
    debug!("index worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::Duration};
    use tempfile::TempDir;

    fn create_scenario(dir: &Path) {
        fs::create_dir_all(dir.join("a/c")).unwrap();
        fs::write(dir.join("a/b.txt"), "0123456789").unwrap();
    }

    #[test]
    fn test_build_index_scenario() {
        let temp_dir = TempDir::new().unwrap();
        create_scenario(temp_dir.path());

        let index = build_index(temp_dir.path());

        assert_eq!(index.files.len(), 1);
        assert_eq!(index.files[0].name, "b.txt");
        assert_eq!(index.files[0].relative_path, "a/b.txt");
        assert_eq!(index.files[0].size, 10);

        let dirs: Vec<(&str, &str)> = index
            .directories
            .iter()
            .map(|d| (d.name.as_str(), d.relative_path.as_str()))
            .collect();
        assert_eq!(dirs, vec![("a", "a"), ("c", "a/c")]);

        assert_eq!(index.total_files, 1);
        assert_eq!(index.total_size, 10);
    }

    #[test]
    fn test_build_index_twice_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        create_scenario(temp_dir.path());
        fs::write(temp_dir.path().join("top.bin"), vec![0u8; 2048]).unwrap();

        let first = build_index(temp_dir.path());
        let second = build_index(temp_dir.path());

        assert_eq!(first.total_files, second.total_files);
        assert_eq!(first.directories.len(), second.directories.len());
        assert_eq!(first.total_size, second.total_size);
        assert_eq!(first.files, second.files);
    }

    #[test]
    fn test_build_index_skips_partial_uploads() {
        let temp_dir = TempDir::new().unwrap();
        create_scenario(temp_dir.path());
        fs::write(
            temp_dir
                .path()
                .join("a/.movie.mkv.0123456789abcdef0123456789abcdef.part"),
            vec![0u8; 512],
        )
        .unwrap();

        let index = build_index(temp_dir.path());
        assert_eq!(index.total_files, 1);
        assert_eq!(index.total_size, 10);
    }

    #[test]
    fn test_build_index_empty_root() {
        let temp_dir = TempDir::new().unwrap();
        let index = build_index(temp_dir.path());
        assert!(index.files.is_empty());
        assert!(index.directories.is_empty());
        assert_eq!(index.total_size, 0);
    }

    #[test]
    fn test_build_index_classifies_symlinks_by_target() {
        use std::os::unix::fs::symlink;

        let temp_dir = TempDir::new().unwrap();
        create_scenario(temp_dir.path());
        symlink("a", temp_dir.path().join("link-to-dir")).unwrap();
        symlink("a/b.txt", temp_dir.path().join("link-to-file")).unwrap();
        symlink("gone", temp_dir.path().join("dangling")).unwrap();

        let index = build_index(temp_dir.path());

        let dir_names: Vec<&str> = index.directories.iter().map(|d| d.name.as_str()).collect();
        assert!(dir_names.contains(&"link-to-dir"));
        // Linked directories are listed but not descended into.
        assert!(!index.directories.iter().any(|d| d.relative_path == "link-to-dir/c"));

        let dangling = index.files.iter().find(|f| f.name == "dangling").unwrap();
        assert!(dangling.is_broken_link());
        assert_eq!(dangling.size, 0);

        // b.txt plus the file link; the broken link counts with zero size.
        assert_eq!(index.total_files, 3);
        assert_eq!(index.total_size, 20);
    }

    #[tokio::test]
    async fn test_start_builds_initial_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        create_scenario(temp_dir.path());

        let handle = IndexHandle::start(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.total_files, 1);
        assert_eq!(snapshot.directories.len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_shows_new_file_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let handle = IndexHandle::start(temp_dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(handle.snapshot().total_files, 0);

        fs::write(temp_dir.path().join("new.txt"), "abc").unwrap();
        let rebuilt = handle.rebuild().await.unwrap();

        assert_eq!(rebuilt.total_files, 1);
        assert_eq!(handle.snapshot().total_size, 3);
    }

    #[tokio::test]
    async fn test_scheduled_rebuild_eventually_installs() {
        let temp_dir = TempDir::new().unwrap();
        let handle = IndexHandle::start(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        fs::write(temp_dir.path().join("later.txt"), "abcdef").unwrap();
        for _ in 0..5 {
            handle.schedule_rebuild();
        }

        let mut seen = false;
        for _ in 0..100 {
            if handle.snapshot().total_files == 1 {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "scheduled rebuild never installed");
    }

    #[tokio::test]
    async fn test_old_snapshot_survives_while_readers_hold_it() {
        let temp_dir = TempDir::new().unwrap();
        create_scenario(temp_dir.path());
        let handle = IndexHandle::start(temp_dir.path().to_path_buf())
            .await
            .unwrap();

        let before = handle.snapshot();
        fs::remove_file(temp_dir.path().join("a/b.txt")).unwrap();
        handle.rebuild().await.unwrap();

        assert_eq!(before.total_files, 1);
        assert_eq!(handle.snapshot().total_files, 0);
    }

    #[test]
    fn test_stale_build_is_not_installed() {
        let shared = Shared {
            root: PathBuf::from("/unused"),
            current: RwLock::new(Installed {
                seq: 0,
                index: Arc::new(FileIndex::empty()),
            }),
            next_seq: AtomicU64::new(1),
        };

        let mut newer = FileIndex::empty();
        newer.total_files = 2;
        let mut older = FileIndex::empty();
        older.total_files = 1;

        shared.install(5, Arc::new(newer));
        let current = shared.install(4, Arc::new(older));

        assert_eq!(current.total_files, 2);
    }
}
