// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! The content-addressed store.
//!
//! Blobs, serialized trees, action records, and persistent rule memos all
//! live under the cache root, sharded two levels deep by the leading bytes of
//! their hex fingerprint. Writes are idempotent: content is keyed by its own
//! digest, so concurrent writers can race harmlessly. A remote provider, when
//! configured, is consulted on local misses and fed by best-effort background
//! pushes.
//!
//! The store exclusively owns the on-disk state; everything else holds plain
//! [`Digest`] references into it.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};
use walkdir::WalkDir;

use anyhow::{Context, Result};

use crate::digest::Digest;
use crate::errors::Failure;
use crate::tree::{Tree, TreeEntry};

/// Bump to discard every persisted record whose layout changed.
pub const STORE_FORMAT_VERSION: u32 = 1;

const MARKER_FILE: &str = "store.json";

const KIND_BLOBS: &str = "blobs";
const KIND_TREES: &str = "directories";
const KIND_ACTIONS: &str = "actions";
const KIND_RULES: &str = "rules";
const ALL_KINDS: [&str; 4] = [KIND_BLOBS, KIND_TREES, KIND_ACTIONS, KIND_RULES];

/// A remote content-addressed backend. Digest verification happens on our
/// side; providers just move bytes.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    async fn load(&self, digest: Digest) -> Result<Option<Bytes>>;
    async fn store(&self, digest: Digest, bytes: Bytes) -> Result<()>;
    fn describe(&self) -> String;
}

#[derive(Serialize, Deserialize)]
struct Marker {
    version: u32,
}

/// The persisted result of a hermetic process execution, keyed by its action
/// digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub exit_code: i32,
    pub stdout: Digest,
    pub stderr: Digest,
    pub output: Digest,
    pub execution_env: String,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    remote: Option<Arc<dyn RemoteProvider>>,
    /// Digests a live session has asked us to keep through sweeps.
    pinned: Mutex<HashSet<Digest>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("remote", &self.inner.remote.as_ref().map(|r| r.describe()))
            .finish()
    }
}

impl Store {
    /// Open (or create) the store under the given cache root.
    ///
    /// A version marker is kept alongside the sharded subtrees; if it does
    /// not match the current format, the affected subtrees are discarded
    /// rather than misread.
    pub fn open(cache_root: impl Into<PathBuf>) -> Result<Self, Failure> {
        Self::open_with_remote(cache_root, None)
    }

    pub fn open_with_remote(
        cache_root: impl Into<PathBuf>,
        remote: Option<Arc<dyn RemoteProvider>>,
    ) -> Result<Self, Failure> {
        let root = cache_root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root `{}`", root.display()))?;

        let marker_path = root.join(MARKER_FILE);
        let marker: Option<Marker> = match fs::read(&marker_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(ref e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Failure::from(anyhow::Error::from(e).context(format!(
                    "failed to read store marker `{}`",
                    marker_path.display()
                ))))
            }
        };

        if marker.as_ref().map(|m| m.version) != Some(STORE_FORMAT_VERSION) {
            if marker.is_some() {
                warn!(
                    root = %root.display(),
                    "store format changed; discarding cached state"
                );
            }
            for kind in ALL_KINDS {
                let dir = root.join(kind);
                match fs::remove_dir_all(&dir) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(Failure::from(anyhow::Error::from(e).context(format!(
                            "failed to clear stale store subtree `{}`",
                            dir.display()
                        ))))
                    }
                }
            }
            let marker = serde_json::to_vec_pretty(&Marker {
                version: STORE_FORMAT_VERSION,
            })
            .expect("marker serialization cannot fail");
            fs::write(&marker_path, marker).with_context(|| {
                format!("failed to write store marker `{}`", marker_path.display())
            })?;
        }

        for kind in ALL_KINDS {
            fs::create_dir_all(root.join(kind))
                .with_context(|| format!("failed to create store subtree `{kind}`"))?;
        }

        Ok(Store {
            inner: Arc::new(StoreInner {
                root,
                remote,
                pinned: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn has_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    fn shard_path(&self, kind: &str, hex: &str) -> PathBuf {
        let mut p = self.inner.root.join(kind);
        p.push(&hex[..2]);
        p.push(&hex[2..4]);
        p.push(hex);
        p
    }

    /// Write bytes to a sharded path via a temp file and atomic rename, so a
    /// partially written entry is never observed under its digest.
    fn write_record(&self, kind: &str, hex: &str, bytes: &[u8]) -> Result<()> {
        let path = self.shard_path(kind, hex);
        if path.exists() {
            return Ok(());
        }

        let dir = path.parent().expect("sharded paths always have a parent");
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory tree `{}`", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temporary file in `{}`", dir.display()))?;
        tmp.write_all(bytes)
            .with_context(|| format!("failed to write `{}`", path.display()))?;
        tmp.persist(&path)
            .with_context(|| format!("failed to persist `{}`", path.display()))?;
        Ok(())
    }

    fn read_record(&self, kind: &str, hex: &str) -> Result<Option<Vec<u8>>> {
        let path = self.shard_path(kind, hex);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(anyhow::Error::from(e).context(format!("failed to read `{}`", path.display())))
            }
        }
    }

    /// Store a blob, returning its canonical digest. Idempotent.
    pub async fn store_blob(&self, bytes: Bytes) -> Result<Digest, Failure> {
        let digest = Digest::of_bytes(&bytes);
        let this = self.clone();
        let to_write = bytes.clone();
        let hex = digest.hex();
        tokio::task::spawn_blocking(move || this.write_record(KIND_BLOBS, &hex, &to_write))
            .await
            .map_err(|e| Failure::store(format!("blob write task failed: {e}")))??;

        self.push_remote_in_background(digest, bytes);
        Ok(digest)
    }

    /// Load a blob by digest, falling back to the remote provider when one is
    /// configured. Remote bytes are digest-verified before use; a mismatch is
    /// corruption and always fatal.
    pub async fn load_blob(&self, digest: Digest) -> Result<Option<Bytes>, Failure> {
        if let Some(bytes) = self.load_local(KIND_BLOBS, digest).await? {
            return Ok(Some(bytes));
        }
        self.fetch_remote(KIND_BLOBS, digest).await
    }

    async fn load_local(&self, kind: &'static str, digest: Digest) -> Result<Option<Bytes>, Failure> {
        let this = self.clone();
        let hex = digest.hex();
        let bytes = tokio::task::spawn_blocking(move || this.read_record(kind, &hex))
            .await
            .map_err(|e| Failure::store(format!("read task failed: {e}")))??;
        Ok(bytes.map(Bytes::from))
    }

    async fn fetch_remote(
        &self,
        kind: &'static str,
        digest: Digest,
    ) -> Result<Option<Bytes>, Failure> {
        let remote = match &self.inner.remote {
            Some(r) => Arc::clone(r),
            None => return Ok(None),
        };

        let fetched = remote.load(digest).await.map_err(|e| {
            Failure::RemoteUnavailable {
                message: format!("{} while fetching {digest}: {e:#}", remote.describe()),
            }
        })?;

        let bytes = match fetched {
            Some(b) => b,
            None => return Ok(None),
        };

        let actual = Digest::of_bytes(&bytes);
        if actual != digest {
            return Err(Failure::store(format!(
                "remote returned corrupt content for {digest}: got {actual}"
            )));
        }

        // Write through so the next reader stays local.
        let this = self.clone();
        let hex = digest.hex();
        let to_write = bytes.clone();
        tokio::task::spawn_blocking(move || this.write_record(kind, &hex, &to_write))
            .await
            .map_err(|e| Failure::store(format!("write-through task failed: {e}")))??;

        Ok(Some(bytes))
    }

    fn push_remote_in_background(&self, digest: Digest, bytes: Bytes) {
        if let Some(remote) = self.inner.remote.clone() {
            tokio::spawn(async move {
                if let Err(e) = remote.store(digest, bytes).await {
                    debug!("background push of {digest} failed: {e:#}");
                }
            });
        }
    }

    /// Whether a digest is present locally (blob or tree).
    pub async fn contains(&self, digest: Digest) -> Result<bool, Failure> {
        for kind in [KIND_BLOBS, KIND_TREES] {
            if self.shard_path(kind, &digest.hex()).exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether a digest is present locally as a blob specifically.
    pub async fn contains_blob(&self, digest: Digest) -> Result<bool, Failure> {
        Ok(self.shard_path(KIND_BLOBS, &digest.hex()).exists())
    }

    /// Make sure a blob digest is readable locally, fetching it from the
    /// remote if needed.
    pub async fn ensure_local(&self, digest: Digest) -> Result<(), Failure> {
        if self.contains(digest).await? {
            return Ok(());
        }
        match self.fetch_remote(KIND_BLOBS, digest).await? {
            Some(_) => Ok(()),
            None => Err(Failure::RemoteUnavailable {
                message: format!("digest {digest} is not present locally or remotely"),
            }),
        }
    }

    /// Store a serialized tree and return its digest.
    pub async fn store_tree(&self, tree: &Tree) -> Result<Digest, Failure> {
        let bytes = tree.canonical_bytes();
        let digest = Digest::of_bytes(&bytes);
        let this = self.clone();
        let hex = digest.hex();
        let to_write = Bytes::from(bytes.clone());
        tokio::task::spawn_blocking(move || this.write_record(KIND_TREES, &hex, &to_write))
            .await
            .map_err(|e| Failure::store(format!("tree write task failed: {e}")))??;

        self.push_remote_in_background(digest, Bytes::from(bytes));
        Ok(digest)
    }

    /// Load a tree by digest, with the same remote fallback and verification
    /// as blobs.
    ///
    /// The digest of the empty byte sequence is accepted as a synonym for the
    /// empty tree, so callers can say "no input" without storing anything.
    pub async fn load_tree(&self, digest: Digest) -> Result<Option<Tree>, Failure> {
        if digest == Digest::empty() || digest == Tree::empty().digest() {
            return Ok(Some(Tree::empty()));
        }

        let bytes = match self.load_local(KIND_TREES, digest).await? {
            Some(b) => Some(b),
            None => self.fetch_remote(KIND_TREES, digest).await?,
        };

        match bytes {
            Some(b) => {
                let tree = Tree::from_canonical_bytes(&b)
                    .map_err(|e| Failure::store(format!("corrupt tree {digest}: {e:#}")))?;
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    fn require_tree_err(digest: Digest) -> Failure {
        Failure::store(format!("tree {digest} is not present in the store"))
    }

    /// Load a tree that must exist.
    pub async fn require_tree(&self, digest: Digest) -> Result<Tree, Failure> {
        self.load_tree(digest)
            .await?
            .ok_or_else(|| Self::require_tree_err(digest))
    }

    /// Store a whole file tree described by a map of clean relative paths to
    /// leaf entries (files and symlinks), returning the root tree digest.
    /// Blob content for files must already be in the store.
    pub async fn store_file_tree(
        &self,
        files: &BTreeMap<String, TreeEntry>,
    ) -> Result<Digest, Failure> {
        let (root, subtrees) = build_tree_levels(files)?;
        for tree in &subtrees {
            self.store_tree(tree).await?;
        }
        self.store_tree(&root).await
    }

    /// List every leaf under a root tree digest as `(relative path, entry)`,
    /// sorted by full path string.
    pub async fn walk_files(&self, root: Digest) -> Result<Vec<(String, TreeEntry)>, Failure> {
        let mut out = Vec::new();
        let mut stack: Vec<(String, Digest)> = vec![(String::new(), root)];

        while let Some((prefix, digest)) = stack.pop() {
            let tree = self.require_tree(digest).await?;
            for (name, entry) in tree.entries() {
                let path = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                match entry {
                    TreeEntry::Dir { digest } => stack.push((path, *digest)),
                    leaf => out.push((path, leaf.clone())),
                }
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Materialize a tree digest into a directory on disk: files with their
    /// executable bits, subdirectories, and symlinks.
    pub async fn materialize(&self, root: Digest, dest: &Path) -> Result<(), Failure> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| Failure::store(format!("failed to create `{}`: {e}", dest.display())))?;

        let mut stack: Vec<(PathBuf, Digest)> = vec![(dest.to_path_buf(), root)];

        while let Some((dir, digest)) = stack.pop() {
            let tree = self.require_tree(digest).await?;
            for (name, entry) in tree.entries() {
                let path = dir.join(name);
                match entry {
                    TreeEntry::Dir { digest } => {
                        tokio::fs::create_dir_all(&path).await.map_err(|e| {
                            Failure::store(format!("failed to create `{}`: {e}", path.display()))
                        })?;
                        stack.push((path, *digest));
                    }

                    TreeEntry::File { digest, executable } => {
                        let bytes = self.load_blob(*digest).await?.ok_or_else(|| {
                            Failure::store(format!(
                                "blob {digest} for `{}` is missing",
                                path.display()
                            ))
                        })?;
                        tokio::fs::write(&path, &bytes).await.map_err(|e| {
                            Failure::store(format!("failed to write `{}`: {e}", path.display()))
                        })?;

                        #[cfg(unix)]
                        {
                            use std::os::unix::fs::PermissionsExt;
                            let mode = if *executable { 0o755 } else { 0o644 };
                            tokio::fs::set_permissions(
                                &path,
                                std::fs::Permissions::from_mode(mode),
                            )
                            .await
                            .map_err(|e| {
                                Failure::store(format!(
                                    "failed to set permissions on `{}`: {e}",
                                    path.display()
                                ))
                            })?;
                        }
                    }

                    TreeEntry::Symlink { target } => {
                        #[cfg(unix)]
                        tokio::fs::symlink(target, &path).await.map_err(|e| {
                            Failure::store(format!(
                                "failed to create symlink `{}`: {e}",
                                path.display()
                            ))
                        })?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Record the result of a process execution under its action digest.
    pub async fn record_action(
        &self,
        action: Digest,
        record: &ActionRecord,
    ) -> Result<(), Failure> {
        let bytes = bincode::serialize(&(STORE_FORMAT_VERSION, record))
            .map_err(|e| Failure::store(format!("failed to serialize action record: {e}")))?;
        let this = self.clone();
        let hex = action.hex();
        tokio::task::spawn_blocking(move || this.write_record(KIND_ACTIONS, &hex, &bytes))
            .await
            .map_err(|e| Failure::store(format!("action write task failed: {e}")))??;
        Ok(())
    }

    /// Load a previously recorded action result; records with a stale version
    /// tag are treated as absent.
    pub async fn load_action(&self, action: Digest) -> Result<Option<ActionRecord>, Failure> {
        let bytes = match self.load_local(KIND_ACTIONS, action).await? {
            Some(b) => b,
            None => return Ok(None),
        };

        match bincode::deserialize::<(u32, ActionRecord)>(&bytes) {
            Ok((STORE_FORMAT_VERSION, record)) => Ok(Some(record)),
            Ok(_) | Err(_) => {
                debug!("discarding unreadable action record {action}");
                Ok(None)
            }
        }
    }

    /// Persist a rule memo payload keyed by the node's identity digest.
    pub async fn record_rule_memo(&self, key: Digest, payload: &[u8]) -> Result<(), Failure> {
        let bytes = bincode::serialize(&(STORE_FORMAT_VERSION, payload))
            .map_err(|e| Failure::store(format!("failed to serialize rule memo: {e}")))?;
        let this = self.clone();
        let hex = key.hex();
        tokio::task::spawn_blocking(move || this.write_record(KIND_RULES, &hex, &bytes))
            .await
            .map_err(|e| Failure::store(format!("memo write task failed: {e}")))??;
        Ok(())
    }

    pub async fn load_rule_memo(&self, key: Digest) -> Result<Option<Vec<u8>>, Failure> {
        let bytes = match self.load_local(KIND_RULES, key).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        match bincode::deserialize::<(u32, Vec<u8>)>(&bytes) {
            Ok((STORE_FORMAT_VERSION, payload)) => Ok(Some(payload)),
            Ok(_) | Err(_) => Ok(None),
        }
    }

    /// Keep a digest through sweeps for as long as it remains pinned.
    pub fn pin(&self, digest: Digest) {
        self.inner.pinned.lock().unwrap().insert(digest);
    }

    pub fn unpin(&self, digest: Digest) {
        self.inner.pinned.lock().unwrap().remove(&digest);
    }

    /// Remove unpinned entries older than `max_age`, across every record
    /// kind. Content is immutable, so age since last write is a faithful
    /// proxy for "no cache entry has referenced this recently".
    pub fn sweep(&self, max_age: Duration) -> Result<SweepStats, Failure> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let pinned: HashSet<String> = self
            .inner
            .pinned
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.hex())
            .collect();

        let mut stats = SweepStats::default();

        for kind in ALL_KINDS {
            let dir = self.inner.root.join(kind);
            for entry in WalkDir::new(&dir).min_depth(3).max_depth(3) {
                let entry =
                    entry.with_context(|| format!("error walking store subtree `{kind}`"))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                stats.scanned += 1;

                // Record files are named by their full hex fingerprint.
                let hex = entry.file_name().to_str().unwrap_or("").to_string();
                if pinned.contains(&hex) {
                    continue;
                }

                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                if mtime < cutoff {
                    if fs::remove_file(entry.path()).is_ok() {
                        stats.removed += 1;
                    }
                }
            }
        }

        Ok(stats)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub removed: usize,
}

/// Build the nested [`Tree`] levels for a flat map of relative paths, bottom
/// up. Returns the root plus every subtree that needs storing.
fn build_tree_levels(
    files: &BTreeMap<String, TreeEntry>,
) -> Result<(Tree, Vec<Tree>), Failure> {
    for path in files.keys() {
        crate::tree::validate_relative_path(path)
            .map_err(|e| Failure::store(format!("{e:#}")))?;
    }

    let mut subtrees = Vec::new();
    let root = build_level(files, &mut subtrees)?;
    Ok((root, subtrees))
}

fn build_level(
    files: &BTreeMap<String, TreeEntry>,
    subtrees: &mut Vec<Tree>,
) -> Result<Tree, Failure> {
    let mut tree = Tree::empty();
    let mut children: BTreeMap<String, BTreeMap<String, TreeEntry>> = BTreeMap::new();

    for (path, entry) in files {
        match path.split_once('/') {
            None => {
                tree.insert(path.clone(), entry.clone())
                    .map_err(|e| Failure::store(format!("{e:#}")))?;
            }
            Some((first, rest)) => {
                children
                    .entry(first.to_string())
                    .or_default()
                    .insert(rest.to_string(), entry.clone());
            }
        }
    }

    for (name, child_files) in children {
        let child = build_level(&child_files, subtrees)?;
        let digest = child.digest();
        subtrees.push(child);
        tree.insert(name, TreeEntry::Dir { digest })
            .map_err(|e| Failure::store(format!("{e:#}")))?;
    }

    Ok(tree)
}
