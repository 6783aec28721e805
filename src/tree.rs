// Copyright 2025 the Foreman Project
// Licensed under the MIT License

//! The serialized directory model.
//!
//! A [`Tree`] is one level of an immutable directory: a sorted mapping from
//! entry name to file, subdirectory, or symlink. Subdirectories are referenced
//! by the digest of their own canonical serialization, so a root digest pins
//! an entire file tree. Two trees with equal digests are byte-identical when
//! canonically serialized; every operation that builds a tree goes through
//! [`Tree::canonical_bytes`] to keep that invariant honest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::digest::Digest;

/// Bump when the canonical serialization changes shape; persisted trees with
/// a different version are treated as absent.
pub const TREE_FORMAT_VERSION: u32 = 1;

/// One named member of a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeEntry {
    File { digest: Digest, executable: bool },
    Dir { digest: Digest },
    Symlink { target: String },
}

/// One level of an immutable directory tree.
///
/// Entries are held in a `BTreeMap` so serialization order is byte-lexicographic
/// by name with no extra bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn empty() -> Self {
        Tree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &TreeEntry)> {
        self.entries.iter().map(|(name, e)| (name.as_str(), e))
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    /// Insert an entry, rejecting names that would break path hygiene.
    pub fn insert(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<()> {
        let name = name.into();
        validate_component(&name)?;
        if self.entries.contains_key(&name) {
            bail!("duplicate directory entry `{name}`");
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    /// The canonical serialization: version tag plus entries in sorted order
    /// with a fixed field encoding. This is the byte sequence whose digest
    /// identifies the tree.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // bincode with default options is deterministic for this shape:
        // fixed-width little-endian lengths, fields in declaration order,
        // map entries in BTreeMap (sorted) order.
        bincode::serialize(&(TREE_FORMAT_VERSION, &self.entries))
            .expect("in-memory tree serialization cannot fail")
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.canonical_bytes())
    }

    /// Deserialize a canonical tree, refusing version mismatches.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let (version, entries): (u32, BTreeMap<String, TreeEntry>) =
            bincode::deserialize(bytes)?;
        if version != TREE_FORMAT_VERSION {
            bail!("unsupported tree format version {version}");
        }
        Ok(Tree { entries })
    }
}

/// Check that a path component is usable inside a tree.
pub fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("empty directory entry name");
    }
    if name == "." || name == ".." {
        bail!("directory entry name `{name}` is reserved");
    }
    if name.contains('/') || name.contains('\0') {
        bail!("directory entry name `{name}` contains a path separator or NUL");
    }
    Ok(())
}

/// Check that a relative path is clean: non-empty, no leading `/`, no `.` or
/// `..` components.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("empty relative path");
    }
    if path.starts_with('/') {
        bail!("path `{path}` is absolute");
    }
    for component in path.split('/') {
        validate_component(component).map_err(|_| {
            anyhow::anyhow!("path `{path}` contains an invalid component")
        })?;
    }
    Ok(())
}
