//! Repository paths. These are absolute and platform-independent: the
//! repository root is the empty path, every other path starts with a
//! slash and carries no trailing slash, no `.` and no `..`. The textual
//! form is what gets hashed into catalog row keys, so the
//! normalization here is load-bearing: two spellings of one path would
//! produce two different rows.
use bstr::ByteSlice;
use std::{
    borrow::Borrow,
    fmt::{self, Debug, Display},
    mem,
    ops::Deref,
    str::FromStr,
};
use thiserror::Error;

/// The longest name a single path component may have. Linux caps names
/// at 255 bytes and catalog rows inherit that.
pub const MAX_NAME_LEN: usize = 255;

/// Errors produced when assembling repository paths.
#[derive(Debug, PartialEq, Error)]
pub enum PathError {
    #[error("path components cannot be empty")]
    EmptyComponent,
    #[error("path components are limited to {} bytes", MAX_NAME_LEN)]
    ComponentTooLong,
    #[error("'.' and '..' are not representable in a catalog")]
    DotComponent,
    #[error("path components cannot contain slashes or null bytes")]
    ForbiddenByte,
}

/// A borrowed repository path.
#[derive(Eq, Hash, PartialEq)]
#[repr(transparent)] // SAFETY: Representation has to match [u8]
pub struct RepoPath {
    inner: [u8],
}

impl RepoPath {
    /// The repository root, i.e. the empty path.
    // SAFETY: The empty path is valid.
    pub const ROOT: &'static RepoPath = unsafe { RepoPath::from_bytes_unchecked(&[]) };

    /// Convert a byte slice to a path, without checking validity.
    const unsafe fn from_bytes_unchecked(bytes: &[u8]) -> &RepoPath {
        // SAFETY: &[u8] and &RepoPath have the same representation.
        unsafe { mem::transmute(bytes) }
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the path without its final component, if there is one.
    ///
    /// The parent of a top-level entry is [RepoPath::ROOT], which is the
    /// only path without a parent.
    pub fn parent(&self) -> Option<&RepoPath> {
        if self.inner.is_empty() {
            return None;
        }

        match self.inner.rsplit_once_str(b"/") {
            // SAFETY: The parent of a valid RepoPath is a valid RepoPath.
            Some((parent, _file_name)) => {
                Some(unsafe { RepoPath::from_bytes_unchecked(parent) })
            }
            None => Some(RepoPath::ROOT),
        }
    }

    /// Creates a RepoPathBuf with `name` adjoined to self.
    pub fn try_join(&self, name: &[u8]) -> Result<RepoPathBuf, PathError> {
        let mut joined = RepoPathBuf {
            inner: Vec::with_capacity(self.inner.len() + name.len() + 1),
        };
        joined.inner.extend_from_slice(&self.inner);
        joined.try_push(name)?;
        Ok(joined)
    }

    /// Provides an iterator over the components of the path.
    /// The root path yields an empty iterator.
    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        let mut iter = self.inner.split_str(&b"/");
        // Consume the empty element in front of the leading slash, or
        // the single empty element of the root path.
        let _ = iter.next();
        iter
    }

    /// Returns the final component of the path, if there is one.
    pub fn file_name(&self) -> Option<&[u8]> {
        self.components().last()
    }

    /// Whether `self` is a path prefix of `other` at component
    /// granularity. Every path is a prefix of itself; the root is a
    /// prefix of everything; `/a` is a prefix of `/a/b` but not `/ab`.
    pub fn is_prefix_of(&self, other: &RepoPath) -> bool {
        if self.inner.is_empty() {
            return true;
        }
        if !other.inner.starts_with(&self.inner) {
            return false;
        }
        other.inner.len() == self.inner.len() || other.inner[self.inner.len()] == b'/'
    }

    /// Like [RepoPath::is_prefix_of], excluding equality.
    pub fn is_strict_prefix_of(&self, other: &RepoPath) -> bool {
        self.inner.len() < other.inner.len() && self.is_prefix_of(other)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

impl AsRef<RepoPath> for RepoPath {
    fn as_ref(&self) -> &RepoPath {
        self
    }
}

/// An owned repository path.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct RepoPathBuf {
    inner: Vec<u8>,
}

impl Deref for RepoPathBuf {
    type Target = RepoPath;

    fn deref(&self) -> &Self::Target {
        // SAFETY: RepoPathBuf always contains a valid RepoPath.
        unsafe { RepoPath::from_bytes_unchecked(&self.inner) }
    }
}

impl AsRef<RepoPath> for RepoPathBuf {
    fn as_ref(&self) -> &RepoPath {
        self
    }
}

impl ToOwned for RepoPath {
    type Owned = RepoPathBuf;

    fn to_owned(&self) -> Self::Owned {
        RepoPathBuf {
            inner: self.inner.to_owned(),
        }
    }
}

impl Borrow<RepoPath> for RepoPathBuf {
    fn borrow(&self) -> &RepoPath {
        self
    }
}

impl From<&RepoPath> for RepoPathBuf {
    fn from(value: &RepoPath) -> Self {
        value.to_owned()
    }
}

impl RepoPathBuf {
    pub fn root() -> RepoPathBuf {
        Self::default()
    }

    /// Adjoins one component to self. All component validation funnels
    /// through here: a component is non-empty, at most [MAX_NAME_LEN]
    /// bytes, not `.` or `..`, and free of slashes and null bytes.
    pub fn try_push(&mut self, name: &[u8]) -> Result<(), PathError> {
        match name {
            b"" => return Err(PathError::EmptyComponent),
            b"." | b".." => return Err(PathError::DotComponent),
            _ => {}
        }
        if name.len() > MAX_NAME_LEN {
            return Err(PathError::ComponentTooLong);
        }
        if name.iter().any(|&b| b == b'/' || b == 0x00) {
            return Err(PathError::ForbiddenByte);
        }

        self.inner.push(b'/');
        self.inner.extend_from_slice(name);
        Ok(())
    }

    /// Parses a path from raw bytes. Accepts the canonical forms (empty
    /// root, `/a/b`) plus two normalizations callers commonly produce:
    /// a bare `/` and a missing leading slash.
    pub fn parse_canonical(bytes: &[u8]) -> Result<Self, PathError> {
        if bytes.is_empty() || bytes == b"/" {
            return Ok(Self::root());
        }
        let trimmed = bytes.strip_prefix(b"/").unwrap_or(bytes);
        let mut out = Self::root();
        for component in trimmed.split_str(b"/") {
            out.try_push(component)?;
        }
        Ok(out)
    }
}

impl FromStr for RepoPathBuf {
    type Err = PathError;

    fn from_str(s: &str) -> Result<RepoPathBuf, Self::Err> {
        RepoPathBuf::parse_canonical(s.as_bytes())
    }
}

impl Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}
