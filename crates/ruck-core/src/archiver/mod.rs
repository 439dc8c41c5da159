pub mod tree;

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use ruck_types::{BlobType, CancelToken, Id, Result, RuckError};

use crate::chunker::Chunker;
use crate::repo::Repository;
use crate::snapshot::{Node, Snapshot, Tree};

use self::tree::{clean_path, path_components, ArchiveTree};

/// Selector predicate: `(absolute path, lstat metadata) → include?`.
/// Excluded files are skipped; excluded directories are not walked.
pub type SelectFn = Arc<dyn Fn(&Path, &fs::Metadata) -> bool + Send + Sync>;

/// Bounded fan-out for chunking and hashing regular files: this many
/// hashers feed the shared pack writer.
pub const DEFAULT_FILE_WORKERS: usize = 4;

/// Attributes of the snapshot a run produces.
#[derive(Default)]
pub struct SnapshotOptions {
    pub tags: Vec<String>,
    pub parent: Option<Id>,
    /// Snapshot timestamp; defaults to now.
    pub time: Option<DateTime<Utc>>,
}

/// Walks a target set, stores file contents as data blobs and directories
/// as tree blobs, and emits one snapshot.
pub struct Archiver {
    repo: Arc<Repository>,
    pub select: SelectFn,
    pub file_workers: usize,
}

impl Archiver {
    pub fn new(repo: Arc<Repository>) -> Self {
        Archiver {
            repo,
            select: Arc::new(|_, _| true),
            file_workers: DEFAULT_FILE_WORKERS,
        }
    }

    /// Archive `targets` and return the new snapshot and its ID.
    ///
    /// Finalization order is strict: every tree saved, then open packs
    /// flushed, then a fresh index object written, then the snapshot.
    pub fn snapshot(
        &self,
        cancel: &CancelToken,
        targets: &[String],
        opts: SnapshotOptions,
    ) -> Result<(Snapshot, Id)> {
        let cleaned: Vec<String> = targets.iter().map(|t| clean_path(t)).collect();
        let resolved = resolve_relative_targets(&cleaned)?;
        let atree = ArchiveTree::new(&resolved)?;

        let root_tree = self.save_archive_tree(cancel, &atree)?;
        let (tree_id, _) = self.repo.save_tree(&root_tree, cancel)?;

        self.repo.flush(cancel)?;
        self.repo.save_index(cancel)?;

        let snapshot = Snapshot::new(
            tree_id,
            resolved,
            opts.tags,
            opts.parent,
            opts.time.unwrap_or_else(Utc::now),
        );
        let id = self.repo.save_snapshot(&snapshot, cancel)?;
        Ok((snapshot, id))
    }

    fn save_archive_tree(&self, cancel: &CancelToken, atree: &ArchiveTree) -> Result<Tree> {
        let mut tree = Tree::new();

        for (name, sub) in &atree.nodes {
            cancel.check()?;

            if let Some(path) = &sub.path {
                // Leaf: a concrete target ends here.
                match self.save_target(cancel, Path::new(path))? {
                    Some(mut node) => {
                        node.name = name.clone();
                        tree.insert(node)?;
                    }
                    None => debug!("{path} excluded"),
                }
                continue;
            }

            // Structural node: archive the subtree, capture directory
            // metadata from the file-info hint.
            let subtree = self.save_archive_tree(cancel, sub)?;
            let (id, _) = self.repo.save_tree(&subtree, cancel)?;

            let fip = sub.file_info_path.as_ref().ok_or_else(|| {
                RuckError::Other(format!("missing file info path for '{name}'"))
            })?;
            let meta = fs::symlink_metadata(fip)?;
            let mut node = Node::from_metadata(name, Path::new(fip), &meta)?;
            node.subtree = Some(id);
            tree.insert(node)?;
        }

        Ok(tree)
    }

    /// Lstat a target, apply the selector, dispatch on type.
    fn save_target(&self, cancel: &CancelToken, path: &Path) -> Result<Option<Node>> {
        let meta = fs::symlink_metadata(path)?;
        if !self.selected(path, &meta) {
            return Ok(None);
        }
        let node = if meta.is_file() {
            self.save_file(cancel, path, &meta)?
        } else if meta.is_dir() {
            self.save_dir(cancel, path, &meta)?
        } else {
            Node::from_metadata(&base_name(path), path, &meta)?
        };
        Ok(Some(node))
    }

    fn selected(&self, path: &Path, meta: &fs::Metadata) -> bool {
        let abs;
        let candidate = if path.is_absolute() {
            path
        } else {
            abs = std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf());
            &abs
        };
        (self.select)(candidate, meta)
    }

    /// Chunk a regular file and store its chunks as data blobs.
    fn save_file(&self, cancel: &CancelToken, path: &Path, meta: &fs::Metadata) -> Result<Node> {
        let mut node = Node::from_metadata(&base_name(path), path, meta)?;

        let file = fs::File::open(path)?;
        let chunker = Chunker::new(
            BufReader::new(file),
            self.repo.config().chunker_polynomial,
        );

        let mut content = Vec::new();
        for chunk in chunker {
            cancel.check()?;
            let chunk = chunk?;
            let (id, _) = self.repo.save_blob(BlobType::Data, &chunk.data, cancel)?;
            content.push(id);
        }
        node.content = Some(content);
        Ok(node)
    }

    /// Read a directory, archive its entries (regular files through the
    /// hasher pool, subdirectories recursively), store the resulting tree.
    fn save_dir(&self, cancel: &CancelToken, path: &Path, meta: &fs::Metadata) -> Result<Node> {
        let mut file_jobs: Vec<(PathBuf, fs::Metadata)> = Vec::new();
        let mut tree = Tree::new();

        for entry in fs::read_dir(path)? {
            cancel.check()?;
            let entry = entry?;
            let epath = entry.path();
            let emeta = fs::symlink_metadata(&epath)?;
            if !self.selected(&epath, &emeta) {
                debug!("{} excluded", epath.display());
                continue;
            }
            if emeta.is_file() {
                file_jobs.push((epath, emeta));
            } else if emeta.is_dir() {
                tree.insert(self.save_dir(cancel, &epath, &emeta)?)?;
            } else {
                tree.insert(Node::from_metadata(&base_name(&epath), &epath, &emeta)?)?;
            }
        }

        for node in self.save_files(cancel, file_jobs)? {
            tree.insert(node)?;
        }

        let (id, _) = self.repo.save_tree(&tree, cancel)?;
        let mut node = Node::from_metadata(&base_name(path), path, meta)?;
        node.subtree = Some(id);
        Ok(node)
    }

    /// Chunk and hash sibling files with a bounded worker pool. Results
    /// come back in job order; the first error wins.
    fn save_files(
        &self,
        cancel: &CancelToken,
        jobs: Vec<(PathBuf, fs::Metadata)>,
    ) -> Result<Vec<Node>> {
        let n = jobs.len();
        if n <= 1 || self.file_workers <= 1 {
            return jobs
                .iter()
                .map(|(p, m)| self.save_file(cancel, p, m))
                .collect();
        }

        let (tx, rx) = crossbeam_channel::unbounded::<(usize, PathBuf, fs::Metadata)>();
        for (i, (p, m)) in jobs.into_iter().enumerate() {
            tx.send((i, p, m)).expect("receiver alive");
        }
        drop(tx);

        let results: Mutex<Vec<Option<Result<Node>>>> =
            Mutex::new((0..n).map(|_| None).collect());

        std::thread::scope(|scope| {
            for _ in 0..self.file_workers.min(n) {
                let rx = rx.clone();
                let results = &results;
                scope.spawn(move || {
                    for (i, path, meta) in rx.iter() {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let res = self.save_file(cancel, &path, &meta);
                        results.lock().unwrap()[i] = Some(res);
                    }
                });
            }
        });

        results
            .into_inner()
            .unwrap()
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(RuckError::Cancelled("file hasher aborted".into())))
            })
            .collect()
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| clean_path(&path.to_string_lossy()))
}

/// Replace targets that are only relative directories (`.`, `..`, `../..`)
/// with the entries of that directory, sorted for deterministic snapshots.
fn resolve_relative_targets(targets: &[String]) -> Result<Vec<String>> {
    let mut result = Vec::with_capacity(targets.len());
    for target in targets {
        if !path_components(target, false).is_empty() {
            result.push(target.clone());
            continue;
        }
        debug!("replacing '{target}' with its directory entries");
        let mut entries: Vec<String> = Vec::new();
        for entry in fs::read_dir(target)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            entries.push(clean_path(&format!("{target}/{name}")));
        }
        entries.sort();
        result.extend(entries);
    }
    Ok(result)
}
