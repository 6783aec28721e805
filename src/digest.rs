// Copyright 2025 the Foreman Project
// Licensed under the MIT License

//! Content digests.
//!
//! Everything the engine stores or memoizes is identified by a SHA-256
//! fingerprint paired with the byte size of the content. The size rides along
//! so that readers can allocate and verify without a second round trip, and so
//! that two digests can be compared for identity without consulting the store.

use digest::OutputSizeUser;
use generic_array::GenericArray;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    fmt, fs,
    io::{self, Write},
    path::Path,
};

use anyhow::{bail, Context, Result};

/// The hasher used for all content digests.
pub type DigestComputer = Sha256;

/// The raw output of a [`DigestComputer`]: 32 bytes for SHA-256.
pub type DigestData = GenericArray<u8, <DigestComputer as OutputSizeUser>::OutputSize>;

/// The identity of a blob or serialized tree: fingerprint plus size in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub fingerprint: DigestData,
    pub size_bytes: u64,
}

impl Digest {
    pub fn new(fingerprint: DigestData, size_bytes: u64) -> Self {
        Digest {
            fingerprint,
            size_bytes,
        }
    }

    /// Digest a byte slice held in memory.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut dc = DigestComputer::new();
        dc.update(bytes);
        Digest {
            fingerprint: dc.finalize(),
            size_bytes: bytes.len() as u64,
        }
    }

    /// The digest of the empty byte sequence.
    pub fn empty() -> Self {
        static EMPTY: std::sync::OnceLock<Digest> = std::sync::OnceLock::new();
        *EMPTY.get_or_init(|| Digest::of_bytes(b""))
    }

    /// The hex form of the fingerprint, without the size.
    pub fn hex(&self) -> String {
        format!("{:x}", self.fingerprint)
    }

    /// Parse a fingerprint from its hex form.
    pub fn from_hex(hex: &str, size_bytes: u64) -> Result<Self> {
        let mut fingerprint = DigestData::default();

        if hex.len() != 2 * fingerprint.len() {
            bail!(
                "invalid fingerprint `{hex}`: expected {} hex characters",
                2 * fingerprint.len()
            );
        }

        for (i, byte) in fingerprint.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
                .with_context(|| format!("invalid fingerprint `{hex}`"))?;
        }

        Ok(Digest {
            fingerprint,
            size_bytes,
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}/{}", self.fingerprint, self.size_bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({}.., {})", &self.hex()[..16], self.size_bytes)
    }
}

/// Compute the digest of a file by streaming it through the hasher.
///
/// Returns the observed size along with the fingerprint; we use the size from
/// the streaming copy rather than the filesystem metadata since we have to
/// read the whole thing anyway.
pub fn digest_of_file(p: impl AsRef<Path>) -> Result<Digest> {
    let p = p.as_ref();
    let mut f = fs::File::open(p).with_context(|| format!("failed to open `{}`", p.display()))?;
    let mut dc = DigestComputer::new();
    let size = io::copy(&mut f, &mut dc)
        .with_context(|| format!("failed to read `{}`", p.display()))?;
    Ok(Digest::new(dc.finalize(), size))
}

/// A type with a stable, canonical contribution to a digest.
///
/// Implementations must be deterministic across runs and platforms: anything
/// order-dependent is written in sorted order, and variable-length values are
/// length-prefixed so that adjacent fields cannot alias.
pub trait Digestible {
    fn update_digest(&self, dc: &mut DigestComputer);

    fn compute_digest(&self) -> DigestData {
        let mut dc = DigestComputer::new();
        self.update_digest(&mut dc);
        dc.finalize()
    }
}

/// Write a length prefix for a variable-length field.
pub(crate) fn update_len(dc: &mut DigestComputer, len: usize) {
    dc.update((len as u64).to_le_bytes());
}

impl Digestible for [u8] {
    fn update_digest(&self, dc: &mut DigestComputer) {
        update_len(dc, self.len());
        dc.update(self);
    }
}

impl Digestible for str {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.as_bytes().update_digest(dc);
    }
}

impl Digestible for String {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.as_str().update_digest(dc);
    }
}

impl Digestible for bool {
    fn update_digest(&self, dc: &mut DigestComputer) {
        dc.update([*self as u8]);
    }
}

impl Digestible for u64 {
    fn update_digest(&self, dc: &mut DigestComputer) {
        dc.update(self.to_le_bytes());
    }
}

impl Digestible for u32 {
    fn update_digest(&self, dc: &mut DigestComputer) {
        dc.update(self.to_le_bytes());
    }
}

impl Digestible for i32 {
    fn update_digest(&self, dc: &mut DigestComputer) {
        dc.update(self.to_le_bytes());
    }
}

impl Digestible for usize {
    fn update_digest(&self, dc: &mut DigestComputer) {
        (*self as u64).update_digest(dc);
    }
}

impl Digestible for Digest {
    fn update_digest(&self, dc: &mut DigestComputer) {
        dc.update(self.fingerprint);
        dc.update(self.size_bytes.to_le_bytes());
    }
}

impl<T: Digestible> Digestible for Vec<T> {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.as_slice().update_digest(dc);
    }
}

impl<T: Digestible> Digestible for [T] {
    fn update_digest(&self, dc: &mut DigestComputer) {
        update_len(dc, self.len());
        for item in self {
            item.update_digest(dc);
        }
    }
}

impl<T: Digestible> Digestible for Option<T> {
    fn update_digest(&self, dc: &mut DigestComputer) {
        match self {
            None => dc.update([0u8]),
            Some(v) => {
                dc.update([1u8]);
                v.update_digest(dc);
            }
        }
    }
}

impl<K: Digestible + Ord, V: Digestible> Digestible for std::collections::BTreeMap<K, V> {
    fn update_digest(&self, dc: &mut DigestComputer) {
        update_len(dc, self.len());
        for (k, v) in self {
            k.update_digest(dc);
            v.update_digest(dc);
        }
    }
}

/// An adapter that digests everything written through it, mirroring the size,
/// for callers that stream output to disk and want the digest for free.
#[derive(Debug, Default)]
pub struct DigestWriter {
    dc: DigestComputer,
    size: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Digest {
        Digest::new(self.dc.finalize(), self.size)
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.dc.update(buf);
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_digest_round_trips_through_hex() {
        let d = Digest::of_bytes(b"hello foreman");
        let parsed = Digest::from_hex(&d.hex(), d.size_bytes).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn empty_digest_is_sha256_of_nothing() {
        assert_eq!(
            Digest::empty().hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(Digest::empty().size_bytes, 0);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Digest::from_hex("deadbeef", 4).is_err());
        let hex = "zz".repeat(32);
        assert!(Digest::from_hex(&hex, 0).is_err());
    }

    #[test]
    fn digestible_is_deterministic() {
        let a = vec!["x".to_string(), "y".to_string()];
        assert_eq!(a.compute_digest(), a.compute_digest());

        // Length prefixes keep adjacent fields from aliasing.
        let joined = vec!["xy".to_string()];
        assert_ne!(a.compute_digest(), joined.compute_digest());
    }

    #[test]
    fn file_digest_matches_bytes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.txt");
        fs::write(&p, b"contents").unwrap();
        assert_eq!(digest_of_file(&p).unwrap(), Digest::of_bytes(b"contents"));
    }

    #[test]
    fn digest_writer_tracks_size_and_fingerprint() {
        let mut w = DigestWriter::new();
        w.write_all(b"abc").unwrap();
        w.write_all(b"def").unwrap();
        assert_eq!(w.finish(), Digest::of_bytes(b"abcdef"));
    }
}
