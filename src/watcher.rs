//! Debounced file watching.
//!
//! Filesystem events are coalesced by `notify-debouncer-full` and exposed as a
//! pull-based sequence of [`ChangeBatch`]es. The consumer pulls the next batch
//! only after finishing its reload, so at most one pipeline run is in flight;
//! batches that arrive meanwhile are queued and collapsed into one.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Paths changed within one debounce window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub paths: BTreeSet<PathBuf>,
}

impl ChangeBatch {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    fn merge(&mut self, other: Self) {
        self.paths.extend(other.paths);
    }
}

/// Lazy, infinite sequence of change batches.
///
/// Dropping it stops the underlying watcher. Call [`Watcher::watch`] again to
/// restart with a different set of paths.
pub struct ChangeBatches {
    rx: mpsc::UnboundedReceiver<ChangeBatch>,
    _debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl ChangeBatches {
    /// Build a sequence from a synthetic source of batches.
    pub const fn from_receiver(rx: mpsc::UnboundedReceiver<ChangeBatch>) -> Self {
        Self {
            rx,
            _debouncer: None,
        }
    }

    /// Wait for the next batch.
    ///
    /// Everything queued since the previous call is collapsed into the
    /// returned batch. Returns `None` only when the source has gone away.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        let mut batch = self.rx.recv().await?;
        while let Ok(queued) = self.rx.try_recv() {
            batch.merge(queued);
        }
        Some(batch)
    }

    /// Drain whatever is queued without waiting.
    pub fn take_pending(&mut self) -> Option<ChangeBatch> {
        let mut pending: Option<ChangeBatch> = None;
        while let Ok(queued) = self.rx.try_recv() {
            match &mut pending {
                Some(batch) => batch.merge(queued),
                None => pending = Some(queued),
            }
        }
        pending
    }
}

/// Creates debounced watches over sets of files.
#[derive(Debug, Clone, Copy)]
pub struct Watcher {
    debounce: Duration,
}

impl Watcher {
    pub const fn new(debounce: Duration) -> Self {
        Self { debounce }
    }

    /// Watch `paths` and return the resulting change sequence.
    ///
    /// For files the parent directory is watched rather than the file itself
    /// so editors that save by rename are still observed. Directories are
    /// watched recursively and report any change beneath them.
    pub fn watch(&self, paths: &[PathBuf]) -> Result<ChangeBatches, notify::Error> {
        let mut files: HashSet<PathBuf> = HashSet::new();
        let mut trees: BTreeSet<PathBuf> = BTreeSet::new();
        for path in paths {
            if path.is_dir() {
                trees.insert(path.canonicalize().unwrap_or_else(|_| path.clone()));
            } else {
                files.insert(normalize(path));
            }
        }
        let dirs: BTreeSet<PathBuf> = files
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .filter(|dir| !trees.iter().any(|tree| dir.starts_with(tree)))
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        let (file_filter, tree_filter) = (files.clone(), trees.clone());
        let mut debouncer = new_debouncer(self.debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let changed: BTreeSet<PathBuf> = events
                        .iter()
                        .filter(|event| !matches!(event.kind, EventKind::Access(_)))
                        .flat_map(|event| event.paths.iter())
                        .map(|path| normalize(path))
                        .filter(|path| {
                            file_filter.contains(path) || tree_filter.iter().any(|tree| path.starts_with(tree))
                        })
                        .collect();
                    if !changed.is_empty() {
                        debug!(paths = changed.len(), "Change batch");
                        let _ = tx.send(ChangeBatch { paths: changed });
                    }
                }
                Err(errors) => {
                    let message = errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    warn!(error = %message, "Filesystem watcher error");
                }
            }
        })?;

        for dir in &dirs {
            debouncer.watch(dir, RecursiveMode::NonRecursive)?;
        }
        for tree in &trees {
            debouncer.watch(tree, RecursiveMode::Recursive)?;
        }
        debug!(files = files.len(), trees = trees.len(), "Watching sources");

        Ok(ChangeBatches {
            rx,
            _debouncer: Some(debouncer),
        })
    }
}

/// Canonical parent plus file name, so deleted files still compare equal.
fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map_or_else(|_| path.to_path_buf(), |parent| parent.join(name)),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_batches_collapse_into_one() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut batches = ChangeBatches::from_receiver(rx);

        tx.send(ChangeBatch::new([PathBuf::from("/p/a.js")])).unwrap();
        tx.send(ChangeBatch::new([PathBuf::from("/p/b.js")])).unwrap();
        tx.send(ChangeBatch::new([PathBuf::from("/p/a.js")])).unwrap();

        let batch = batches.next().await.unwrap();
        assert_eq!(
            batch.paths.into_iter().collect::<Vec<_>>(),
            vec![PathBuf::from("/p/a.js"), PathBuf::from("/p/b.js")]
        );

        // A batch sent after the pull is delivered on its own.
        tx.send(ChangeBatch::new([PathBuf::from("/p/c.js")])).unwrap();
        let batch = batches.next().await.unwrap();
        assert_eq!(batch, ChangeBatch::new([PathBuf::from("/p/c.js")]));

        tx.send(ChangeBatch::new([PathBuf::from("/p/d.js")])).unwrap();
        assert_eq!(batches.take_pending(), Some(ChangeBatch::new([PathBuf::from("/p/d.js")])));
        assert_eq!(batches.take_pending(), None);

        drop(tx);
        assert!(batches.next().await.is_none());
    }

    #[tokio::test]
    async fn reports_changes_to_watched_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let watched = dir.path().join("index.js");
        let other = dir.path().join("notes.txt");
        std::fs::write(&watched, "function main() {}").unwrap();

        let mut batches = Watcher::new(Duration::from_millis(50))
            .watch(std::slice::from_ref(&watched))
            .unwrap();

        std::fs::write(&other, "unrelated").unwrap();
        std::fs::write(&watched, "function main() { return {}; }").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(10), batches.next())
            .await
            .expect("change should be observed")
            .unwrap();

        assert!(batch.paths.contains(&normalize(&watched)));
        assert!(!batch.paths.contains(&normalize(&other)));
    }

    #[tokio::test]
    async fn directories_are_watched_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("lib");
        std::fs::create_dir(&nested).unwrap();

        let mut batches = Watcher::new(Duration::from_millis(50))
            .watch(&[dir.path().to_path_buf()])
            .unwrap();

        let changed = nested.join("util.js");
        std::fs::write(&changed, "module.exports = 1;").unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(10), batches.next())
            .await
            .expect("change should be observed")
            .unwrap();
        assert!(batch.paths.contains(&normalize(&changed)));
    }
}
