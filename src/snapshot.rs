// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! Snapshots: immutable file trees as values.
//!
//! A [`Snapshot`] pairs a root tree digest with the sorted list of file paths
//! underneath it, which is the form rule authors actually want to look at.
//! The path list is derived state; the digest alone is identity. All of the
//! operations here (merge, prefixing, subsetting, capture) produce new
//! snapshots whose recorded digest always equals the digest of the canonical
//! serialization of the tree they describe.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};
use tokio::sync::mpsc;
use tokio_task_pool::Pool;
use tracing::{debug, warn};

use anyhow::{Context, Result};

use crate::digest::{digest_of_file, Digest, DigestComputer, Digestible};
use crate::errors::Failure;
use crate::glob::PathGlobs;
use crate::store::Store;
use crate::tree::{validate_relative_path, Tree, TreeEntry};

/// An immutable directory tree keyed by digest, plus its cached path index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub digest: Digest,
    files: Vec<String>,
}

impl Snapshot {
    /// The snapshot of an empty tree.
    pub fn empty() -> Self {
        Snapshot {
            digest: Tree::empty().digest(),
            files: Vec::new(),
        }
    }

    /// Derive the snapshot for an existing root tree digest.
    pub async fn from_digest(store: &Store, digest: Digest) -> Result<Self, Failure> {
        let files = store
            .walk_files(digest)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        Ok(Snapshot { digest, files })
    }

    /// The relative paths of every file in the tree, sorted.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Snapshot {}

impl std::hash::Hash for Snapshot {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl Digestible for Snapshot {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.digest.update_digest(dc);
    }
}

/// Tree-level operations on snapshots, provided by the store that holds the
/// underlying trees.
#[async_trait]
pub trait SnapshotOps {
    /// Merge several snapshots into one. The same path may appear in more
    /// than one input iff it has identical content everywhere; otherwise the
    /// merge fails naming the first conflicting path.
    async fn merge(&self, snapshots: Vec<Snapshot>) -> Result<Snapshot, Failure>;

    /// Re-root a snapshot under a relative path prefix.
    async fn add_prefix(&self, snapshot: Snapshot, prefix: &str) -> Result<Snapshot, Failure>;

    /// Strip a relative path prefix; every file must live under it.
    async fn remove_prefix(&self, snapshot: Snapshot, prefix: &str) -> Result<Snapshot, Failure>;

    /// The subset of a snapshot selected by a glob set.
    async fn subset(&self, snapshot: Snapshot, globs: &PathGlobs) -> Result<Snapshot, Failure>;
}

#[async_trait]
impl SnapshotOps for Store {
    async fn merge(&self, snapshots: Vec<Snapshot>) -> Result<Snapshot, Failure> {
        match snapshots.len() {
            0 => return Ok(Snapshot::empty()),
            1 => return Ok(snapshots.into_iter().next().unwrap()),
            _ => {}
        }

        let digests: Vec<Digest> = snapshots.iter().map(|s| s.digest).collect();
        let merged = merge_trees(self, String::new(), digests).await?;
        Snapshot::from_digest(self, merged).await
    }

    async fn add_prefix(&self, snapshot: Snapshot, prefix: &str) -> Result<Snapshot, Failure> {
        validate_relative_path(prefix).map_err(|e| Failure::store(format!("{e:#}")))?;

        let mut digest = snapshot.digest;
        for component in prefix.rsplit('/') {
            let mut tree = Tree::empty();
            tree.insert(component, TreeEntry::Dir { digest })
                .map_err(|e| Failure::store(format!("{e:#}")))?;
            digest = self.store_tree(&tree).await?;
        }

        let files = snapshot
            .files
            .iter()
            .map(|f| format!("{prefix}/{f}"))
            .collect();
        Ok(Snapshot { digest, files })
    }

    async fn remove_prefix(&self, snapshot: Snapshot, prefix: &str) -> Result<Snapshot, Failure> {
        validate_relative_path(prefix).map_err(|e| Failure::store(format!("{e:#}")))?;

        let outside: Vec<&String> = snapshot
            .files
            .iter()
            .filter(|f| !f.starts_with(&format!("{prefix}/")))
            .collect();
        if !outside.is_empty() {
            return Err(Failure::store(format!(
                "cannot remove prefix `{prefix}`: {} file(s) live outside it, e.g. `{}`",
                outside.len(),
                outside[0]
            )));
        }

        let mut digest = snapshot.digest;
        for component in prefix.split('/') {
            let tree = self.require_tree(digest).await?;
            digest = match tree.get(component) {
                Some(TreeEntry::Dir { digest }) => *digest,
                _ => {
                    return Err(Failure::store(format!(
                        "cannot remove prefix `{prefix}`: `{component}` is not a directory"
                    )))
                }
            };
        }

        let files = snapshot
            .files
            .iter()
            .map(|f| f[prefix.len() + 1..].to_string())
            .collect();
        Ok(Snapshot { digest, files })
    }

    async fn subset(&self, snapshot: Snapshot, globs: &PathGlobs) -> Result<Snapshot, Failure> {
        let selected = globs.select(snapshot.files.iter().map(|s| s.as_str()))?;
        if selected.len() == snapshot.files.len() {
            return Ok(snapshot);
        }

        let keep: BTreeMap<String, TreeEntry> = self
            .walk_files(snapshot.digest)
            .await?
            .into_iter()
            .filter(|(path, _)| selected.binary_search(path).is_ok())
            .collect();

        let digest = self.store_file_tree(&keep).await?;
        Ok(Snapshot {
            digest,
            files: selected,
        })
    }
}

/// Merge a set of tree digests level by level, failing on the first path
/// whose content differs between inputs.
fn merge_trees(
    store: &Store,
    prefix: String,
    digests: Vec<Digest>,
) -> BoxFuture<'_, Result<Digest, Failure>> {
    Box::pin(async move {
        let mut unique = digests;
        unique.sort();
        unique.dedup();
        if unique.len() == 1 {
            return Ok(unique[0]);
        }

        // name -> distinct entries seen across the inputs
        let mut by_name: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
        for digest in unique {
            let tree = store.require_tree(digest).await?;
            for (name, entry) in tree.entries() {
                let entries = by_name.entry(name.to_string()).or_default();
                if !entries.contains(entry) {
                    entries.push(entry.clone());
                }
            }
        }

        let mut merged = Tree::empty();
        for (name, entries) in by_name {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };

            let entry = if entries.len() == 1 {
                entries.into_iter().next().unwrap()
            } else if entries.iter().all(|e| matches!(e, TreeEntry::Dir { .. })) {
                let children = entries
                    .iter()
                    .map(|e| match e {
                        TreeEntry::Dir { digest } => *digest,
                        _ => unreachable!(),
                    })
                    .collect();
                let digest = merge_trees(store, path.clone(), children).await?;
                TreeEntry::Dir { digest }
            } else {
                return Err(Failure::MergeConflict { path });
            };

            merged
                .insert(name, entry)
                .map_err(|e| Failure::store(format!("{e:#}")))?;
        }

        store.store_tree(&merged).await
    })
}

// ---------------------------------------------------------------------------
// Workspace capture
// ---------------------------------------------------------------------------

const MEMO_FILE: &str = "file_digests.dat";
const MEMO_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
struct FileDigestEntry {
    digest: Digest,
    mtime: SystemTime,
    size: u64,
}

impl FileDigestEntry {
    fn create(p: &Path) -> Result<FileDigestEntry> {
        let md = fs::metadata(p)?;
        let mtime = md.modified()?;
        let digest = digest_of_file(p)?;
        Ok(FileDigestEntry {
            digest,
            mtime,
            size: digest.size_bytes,
        })
    }

    /// Make sure the saved information is fresh. If the mtime and size of the
    /// file are the same as what's been saved, assume the file is unchanged
    /// and keep the digest; otherwise recalculate it.
    fn freshen(&mut self, p: &Path) -> Result<()> {
        let md = fs::metadata(p)?;
        let mtime = md.modified()?;

        if mtime != self.mtime || md.len() != self.size {
            let digest = digest_of_file(p)?;
            self.size = digest.size_bytes;
            self.digest = digest;
            self.mtime = mtime;
        }

        Ok(())
    }
}

/// A persistent memo of workspace file digests keyed by relative path, so
/// repeated captures only re-read files whose mtime or size moved.
///
/// Errors loading the memo are reported and then ignored: the capture
/// proceeds as if the relevant information is simply missing.
pub struct DigestMemo {
    path: PathBuf,
    entries: Mutex<HashMap<String, FileDigestEntry>>,
}

impl DigestMemo {
    pub fn load(cache_root: &Path) -> Self {
        let path = cache_root.join(MEMO_FILE);

        let entries = match fs::File::open(&path) {
            Ok(f) => match bincode::deserialize_from::<_, (u32, HashMap<String, FileDigestEntry>)>(f)
            {
                Ok((MEMO_VERSION, map)) => map,
                Ok(_) => HashMap::new(),
                Err(e) => {
                    warn!("error deserializing file digest memo `{}`: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(ref e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("failed to open `{}`: {e}", path.display());
                HashMap::new()
            }
        };

        DigestMemo {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// The digest of a workspace file, re-reading it only when the memoized
    /// mtime and size no longer match.
    fn digest_for(&self, root: &Path, relpath: &str) -> Result<Digest> {
        let full = root.join(relpath);
        let mut entries = self.entries.lock().unwrap();

        let entry = match entries.get_mut(relpath) {
            Some(entry) => {
                entry
                    .freshen(&full)
                    .with_context(|| format!("failed to probe input file `{relpath}`"))?;
                *entry
            }
            None => {
                let entry = FileDigestEntry::create(&full)
                    .with_context(|| format!("failed to probe input file `{relpath}`"))?;
                entries.insert(relpath.to_string(), entry);
                entry
            }
        };

        Ok(entry.digest)
    }

    /// Persist the memo. Failures are reported but not fatal: the memo is an
    /// optimization, not a source of truth.
    pub fn save(&self) {
        let entries = self.entries.lock().unwrap();
        let result = (|| -> Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            let f = fs::File::create(&self.path)?;
            bincode::serialize_into(f, &(MEMO_VERSION, &*entries))?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!("failed to save file digest memo `{}`: {e:#}", self.path.display());
        }
    }
}

/// One scanned workspace file awaiting ingestion.
struct ScannedFile {
    relpath: String,
    digest: Digest,
    executable: bool,
}

/// Capture a subset of the local workspace into a snapshot.
///
/// Honors the configured ignore patterns, enforces the glob set's no-match
/// policy, keeps non-escaping symlinks as symlink entries, and rejects
/// symlinks whose targets resolve outside the workspace root. Blob ingestion
/// for content the store has not seen is bounded by `workers`.
pub async fn capture_workspace(
    store: &Store,
    memo: &DigestMemo,
    root: &Path,
    ignore: &[String],
    globs: &PathGlobs,
    workers: usize,
) -> Result<Snapshot, Failure> {
    let ignore_globs = PathGlobs::new(
        ignore.to_vec(),
        Vec::<String>::new(),
        crate::glob::NoMatchPolicy::Ignore,
        "configured ignore patterns",
    )?;

    // Scan phase: walk the tree, apply ignores, classify leaves, and digest
    // candidate files through the memo. All synchronous filesystem work.
    let mut scanned: Vec<ScannedFile> = Vec::new();
    let mut symlinks: Vec<(String, String)> = Vec::new();
    let mut all_paths: Vec<String> = Vec::new();

    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("failed to resolve workspace root `{}`", root.display()))?;

    for entry in walkdir::WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(root).unwrap_or(e.path());
        let rel = rel.to_string_lossy();
        rel.is_empty() || !ignore_globs.matches(rel.as_ref())
    }) {
        let entry = entry.map_err(|e| Failure::store(format!("error walking workspace: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        if rel.is_empty() {
            continue;
        }

        if entry.path_is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|e| Failure::store(format!("failed to read symlink `{rel}`: {e}")))?;
            let resolved = entry
                .path()
                .parent()
                .unwrap_or(root)
                .join(&target)
                .canonicalize()
                .map_err(|e| {
                    Failure::store(format!("failed to resolve symlink `{rel}`: {e}"))
                })?;
            if !resolved.starts_with(&canonical_root) {
                return Err(Failure::store(format!(
                    "symlink `{rel}` escapes the workspace root (-> `{}`)",
                    target.display()
                )));
            }
            all_paths.push(rel.clone());
            symlinks.push((rel, target.to_string_lossy().to_string()));
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }

        all_paths.push(rel);
    }

    let selected = globs.select(all_paths.iter().map(|s| s.as_str()))?;
    let symlink_map: HashMap<&str, &str> = symlinks
        .iter()
        .map(|(p, t)| (p.as_str(), t.as_str()))
        .collect();

    let mut files: BTreeMap<String, TreeEntry> = BTreeMap::new();
    for relpath in &selected {
        if let Some(target) = symlink_map.get(relpath.as_str()) {
            files.insert(
                relpath.clone(),
                TreeEntry::Symlink {
                    target: target.to_string(),
                },
            );
            continue;
        }

        let digest = memo
            .digest_for(root, relpath)
            .map_err(|e| Failure::missing_input(format!("{e:#}"), globs.origin()))?;
        let executable = is_executable(&root.join(relpath));
        scanned.push(ScannedFile {
            relpath: relpath.clone(),
            digest,
            executable,
        });
    }

    // Ingestion phase: feed the store any content it hasn't seen, a bounded
    // number of files at a time.
    let pool = Pool::bounded(workers.max(1));
    let (tx, mut rx) = mpsc::channel::<Result<(), Failure>>(2 * workers.max(1));
    let mut outstanding = 0usize;

    for file in &scanned {
        files.insert(
            file.relpath.clone(),
            TreeEntry::File {
                digest: file.digest,
                executable: file.executable,
            },
        );

        if store.contains_blob(file.digest).await? {
            continue;
        }

        let tx = tx.clone();
        let store = store.clone();
        let full = root.join(&file.relpath);
        let expected = file.digest;
        let relpath = file.relpath.clone();

        pool.spawn(async move {
            let result = async {
                let bytes = tokio::fs::read(&full)
                    .await
                    .map_err(|e| Failure::store(format!("failed to read `{relpath}`: {e}")))?;
                let stored = store.store_blob(Bytes::from(bytes)).await?;
                if stored != expected {
                    // The file changed between digesting and reading; the
                    // memo entry is stale for this capture.
                    return Err(Failure::store(format!(
                        "file `{relpath}` changed while being captured"
                    )));
                }
                Ok(())
            }
            .await;
            let _ = tx.send(result).await;
        })
        .await
        .map_err(|e| Failure::store(format!("failed to spawn ingestion task: {e:?}")))?;
        outstanding += 1;
    }

    drop(tx);
    while let Some(result) = rx.recv().await {
        result?;
        outstanding -= 1;
    }
    debug_assert_eq!(outstanding, 0);

    memo.save();

    let digest = store.store_file_tree(&files).await?;
    let mut paths: Vec<String> = files.keys().cloned().collect();
    paths.sort();
    debug!(files = paths.len(), "captured workspace snapshot {digest}");

    Ok(Snapshot {
        digest,
        files: paths,
    })
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}
