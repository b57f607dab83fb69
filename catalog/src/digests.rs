//! Fixed-width digests used throughout the catalog engine: MD5 path
//! hashes acting as row keys and SHA-1 content hashes naming artifacts.
use data_encoding::HEXLOWER;
use md5::{Digest as _, Md5};
use sha1::Sha1;
use thiserror::Error;

use crate::path::RepoPath;

pub const MD5_LEN: usize = 16;
pub const SHA1_LEN: usize = 20;

#[derive(Error, Debug, PartialEq)]
pub enum DigestError {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
    #[error("invalid hex digest: {0}")]
    InvalidHex(String),
}

/// The 128-bit MD5 of an absolute, normalized repository path, used as
/// the primary key of a catalog row. The all-zero value is reserved: it
/// is never the hash of a real path and marks the repository root's
/// missing parent.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PathHash([u8; MD5_LEN]);

impl PathHash {
    pub const NULL: PathHash = PathHash([0u8; MD5_LEN]);

    pub fn of(path: &RepoPath) -> Self {
        let digest = Md5::digest(path.as_bytes());
        Self(digest.into())
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; MD5_LEN]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Splits the digest into the two little-endian 64-bit halves stored
    /// in the `md5path_1`/`md5path_2` row columns.
    pub fn to_columns(&self) -> (i64, i64) {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&self.0[0..8]);
        lo.copy_from_slice(&self.0[8..16]);
        (
            u64::from_le_bytes(hi) as i64,
            u64::from_le_bytes(lo) as i64,
        )
    }

    pub fn from_columns(hash_1: i64, hash_2: i64) -> Self {
        let mut digest = [0u8; MD5_LEN];
        digest[0..8].copy_from_slice(&(hash_1 as u64).to_le_bytes());
        digest[8..16].copy_from_slice(&(hash_2 as u64).to_le_bytes());
        Self(digest)
    }
}

impl From<[u8; MD5_LEN]> for PathHash {
    fn from(value: [u8; MD5_LEN]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PathHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for PathHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "md5:{}", HEXLOWER.encode(&self.0))
    }
}

/// A SHA-1 content hash naming an immutable artifact. The all-zero
/// value means "no content": directories and symlinks carry it in their
/// rows, and freshly split nested catalogs are registered with it until
/// their first snapshot.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; SHA1_LEN]);

impl ContentHash {
    pub const NULL: ContentHash = ContentHash([0u8; SHA1_LEN]);

    /// Hashes a byte buffer. Artifact hashing is normally the upload
    /// spooler's job; this exists for collaborators and tests.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; SHA1_LEN]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    pub fn from_hex(hex: &str) -> Result<Self, DigestError> {
        let bytes = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|_| DigestError::InvalidHex(hex.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for ContentHash {
    type Error = DigestError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; SHA1_LEN] = value
            .try_into()
            .map_err(|_| DigestError::InvalidDigestLen(value.len()))?;
        Ok(Self(arr))
    }
}

impl TryFrom<Vec<u8>> for ContentHash {
    type Error = DigestError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::try_from(value.as_slice())
    }
}

impl From<[u8; SHA1_LEN]> for ContentHash {
    fn from(value: [u8; SHA1_LEN]) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha1:{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn path_hash_of_root() {
        // MD5 of the empty string, not the null sentinel.
        let h = PathHash::of(RepoPath::ROOT);
        assert_eq!(h.as_slice(), hex!("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!h.is_null());
        assert!(PathHash::NULL.is_null());
    }

    #[test]
    fn path_hash_column_round_trip() {
        let path: crate::path::RepoPathBuf = "/a/b".parse().unwrap();
        let h = PathHash::of(&path);
        let (c1, c2) = h.to_columns();
        assert_eq!(PathHash::from_columns(c1, c2), h);
    }

    #[test]
    fn content_hash_hex_round_trip() {
        let h = ContentHash::of_bytes(b"hello");
        assert_eq!(ContentHash::from_hex(&h.to_hex()).unwrap(), h);
        assert_eq!(h.as_slice(), hex!("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"));
    }

    #[test]
    fn content_hash_rejects_wrong_length() {
        assert_eq!(
            ContentHash::try_from(vec![0u8; 19]),
            Err(DigestError::InvalidDigestLen(19))
        );
    }
}
