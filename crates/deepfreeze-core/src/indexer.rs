//! Parallel directory indexer: walk + per-file SHA-512 content digests.
//!
//! One producer walks the tree and feeds regular-file paths into a bounded
//! channel; a pool of digester threads hashes file contents and feeds
//! results back. A shared done flag unwinds both stages on the first
//! error. Result ordering is unspecified.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Mutex};
use std::thread;

use sha2::{Digest, Sha512};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{FreezeError, FreezeResult};

/// Raw SHA-512 digest of a file's content.
pub type ContentDigest = [u8; 64];

const CHANNEL_CAPACITY: usize = 256;

/// Filesystem indexer rooted at a directory, with exclusion prefixes.
#[derive(Debug, Clone)]
pub struct Indexer {
    root: PathBuf,
    excludes: Vec<PathBuf>,
}

impl Indexer {
    /// Creates an indexer over `root`. A path is excluded when it equals
    /// or is prefixed by any entry of `excludes`.
    pub fn new(root: impl Into<PathBuf>, excludes: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes,
        }
    }

    /// Walks the tree and digests every regular file, in parallel.
    /// Directories, symlinks, and special files are skipped. The first
    /// walk or read error aborts both stages and is returned.
    pub fn index(&self) -> FreezeResult<HashMap<PathBuf, ContentDigest>> {
        info!(root = %self.root.display(), "indexing directory tree");
        let digesters = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            * 2;

        let done = AtomicBool::new(false);
        let (path_tx, path_rx) = mpsc::sync_channel::<PathBuf>(CHANNEL_CAPACITY);
        let path_rx = Mutex::new(path_rx);
        let (result_tx, result_rx) =
            mpsc::sync_channel::<(PathBuf, io::Result<ContentDigest>)>(CHANNEL_CAPACITY);

        thread::scope(|scope| {
            let walker = {
                let done = &done;
                scope.spawn(move || self.walk(done, path_tx))
            };
            for _ in 0..digesters {
                let done = &done;
                let path_rx = &path_rx;
                let result_tx = result_tx.clone();
                scope.spawn(move || digest_paths(done, path_rx, result_tx));
            }
            drop(result_tx);

            let mut index = HashMap::new();
            let mut failure: Option<io::Error> = None;
            for (path, result) in result_rx.iter() {
                match result {
                    Ok(digest) => {
                        index.insert(path, digest);
                    }
                    Err(err) => {
                        done.store(true, Ordering::Relaxed);
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }

            let walked = walker.join().expect("walker thread panicked");
            if let Some(err) = failure {
                return Err(err.into());
            }
            walked?;
            Ok(index)
        })
    }

    fn walk(&self, done: &AtomicBool, paths: SyncSender<PathBuf>) -> FreezeResult<()> {
        let mut entries = WalkDir::new(&self.root).follow_links(false).into_iter();
        while let Some(entry) = entries.next() {
            if done.load(Ordering::Relaxed) {
                return Err(FreezeError::Cancelled);
            }
            let entry = entry.map_err(io::Error::from)?;
            if self.is_excluded(entry.path()) {
                debug!(path = %entry.path().display(), "excluded");
                if entry.file_type().is_dir() {
                    entries.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if paths.send(entry.into_path()).is_err() {
                return Err(FreezeError::Cancelled);
            }
        }
        Ok(())
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excludes.iter().any(|prefix| path.starts_with(prefix))
    }
}

fn digest_paths(
    done: &AtomicBool,
    paths: &Mutex<Receiver<PathBuf>>,
    results: SyncSender<(PathBuf, io::Result<ContentDigest>)>,
) {
    loop {
        let path = {
            let receiver = match paths.lock() {
                Ok(receiver) => receiver,
                Err(_) => return,
            };
            match receiver.recv() {
                Ok(path) => path,
                Err(_) => return,
            }
        };
        // Keep draining after cancellation so the walker never blocks on a
        // full channel with no consumers.
        if done.load(Ordering::Relaxed) {
            continue;
        }
        debug!(path = %path.display(), "indexing");
        let result = digest_file(&path);
        if results.send((path, result)).is_err() {
            return;
        }
    }
}

fn digest_file(path: &Path) -> io::Result<ContentDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha512::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::symlink;

    use super::*;

    #[test]
    fn indexes_regular_files_with_sha512() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

        let index = Indexer::new(dir.path(), Vec::new()).index().unwrap();
        assert_eq!(index.len(), 2);

        let expected: ContentDigest = Sha512::digest(b"alpha").into();
        assert_eq!(index[&dir.path().join("a.txt")], expected);
    }

    #[test]
    fn skips_directories_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let index = Indexer::new(dir.path(), Vec::new()).index().unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains_key(&dir.path().join("real.txt")));
    }

    #[test]
    fn excludes_match_by_path_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"keep").unwrap();
        fs::create_dir(dir.path().join("skip")).unwrap();
        fs::write(dir.path().join("skip/lost.txt"), b"lost").unwrap();
        fs::write(dir.path().join("skipped-not.txt"), b"kept").unwrap();

        let index = Indexer::new(dir.path(), vec![dir.path().join("skip")])
            .index()
            .unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.contains_key(&dir.path().join("keep.txt")));
        assert!(index.contains_key(&dir.path().join("skipped-not.txt")));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-here");
        assert!(matches!(
            Indexer::new(&missing, Vec::new()).index(),
            Err(FreezeError::Io(_))
        ));
    }

    #[test]
    fn empty_root_yields_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = Indexer::new(dir.path(), Vec::new()).index().unwrap();
        assert!(index.is_empty());
    }
}
