//! The in-memory representation of one filesystem object, plus the
//! pieces of its on-disk encoding that are stable: the flags bitset and
//! the packed hardlinks field.
use bstr::ByteSlice;
use bytes::Bytes;
use std::fmt::{self, Debug, Display};
use thiserror::Error;

use crate::catalog::CatalogId;
use crate::digests::ContentHash;
use crate::path::MAX_NAME_LEN;

/// Session inode identifier. Zero is never a valid inode.
pub type InodeId = u64;
pub const INVALID_INODE: InodeId = 0;

/// The maximum length of a symlink target.
pub const MAX_LINK_LEN: usize = 4095;

/// Upper bound on the byte size of an expanded symlink target. Raw
/// targets come out of catalog files that may not be trustworthy, so
/// expansion output is truncated here.
const MAX_EXPANSION_LEN: usize = 4096;

bitflags::bitflags! {
    /// The on-disk `flags` column. Values are stable; catalogs written
    /// by other implementations depend on them.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct DirentFlags: u32 {
        const DIR = 1;
        const FILE = 2;
        const LINK = 4;
        const DIR_NESTED_ROOT = 8;
        const DIR_NESTED_MOUNTPOINT = 16;
    }
}

/// A validated entry name as stored in the `name` column of a catalog
/// row: at most [MAX_NAME_LEN] bytes, no slashes or null bytes, never
/// `.` or `..`. The empty name is reserved for the synthetic root row
/// of a catalog, which is the one entry that is not addressed through a
/// parent directory.
#[derive(Clone, PartialEq, Eq)]
pub struct EntryName {
    inner: Bytes,
}

#[derive(Debug, PartialEq, Error)]
pub enum EntryNameError {
    #[error("names are limited to {} bytes", MAX_NAME_LEN)]
    TooLong,
    #[error("names cannot contain slashes or null bytes")]
    ForbiddenByte,
    #[error("'.' and '..' cannot name catalog rows")]
    Dot,
}

impl EntryName {
    /// The name of a catalog's synthetic root entry.
    pub const ROOT: EntryName = EntryName {
        inner: Bytes::new(),
    };

    fn validate(name: &[u8]) -> Result<(), EntryNameError> {
        // The empty name is the root row's; everything else is a real
        // directory entry.
        if name == b"." || name == b".." {
            return Err(EntryNameError::Dot);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EntryNameError::TooLong);
        }
        if name.iter().any(|&b| b == b'/' || b == 0x00) {
            return Err(EntryNameError::ForbiddenByte);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn is_root(&self) -> bool {
        self.inner.is_empty()
    }
}

impl TryFrom<Bytes> for EntryName {
    type Error = EntryNameError;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(Self { inner: value })
    }
}

impl TryFrom<&[u8]> for EntryName {
    type Error = EntryNameError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Bytes::copy_from_slice(value).try_into()
    }
}

impl TryFrom<&str> for EntryName {
    type Error = EntryNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

impl Debug for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for EntryName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

/// The packed hardlinks field: hardlink-group id in the high 32 bits,
/// link count in the low 32 bits. A raw value of 0 is the canonical
/// encoding for an ordinary entry: link count 1, no group.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Hardlinks(u64);

impl Hardlinks {
    pub fn new(group: u32, linkcount: u32) -> Self {
        Self((u64::from(group) << 32) | u64::from(linkcount))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn group(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn linkcount(&self) -> u32 {
        if self.0 == 0 {
            return 1;
        }
        self.0 as u32
    }

    pub fn is_grouped(&self) -> bool {
        self.group() != 0
    }
}

impl Debug for Hardlinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {} x{}", self.group(), self.linkcount())
    }
}

/// A validated symlink target: non-empty, at most [MAX_LINK_LEN] bytes,
/// no null bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct LinkTarget {
    inner: Bytes,
}

#[derive(Debug, PartialEq, Error)]
pub enum LinkTargetError {
    #[error("target cannot be empty")]
    Empty,
    #[error("target cannot contain null bytes")]
    Null,
    #[error("target cannot be over {} bytes long", MAX_LINK_LEN)]
    TooLong,
}

impl LinkTarget {
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_ref()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Replaces every `$(VAR)` in the target with the value of the
    /// environment variable `VAR` of the current process. Unknown
    /// variables expand to the empty string; a `$(` without a closing
    /// parenthesis is preserved verbatim; expansion output is not
    /// re-scanned. The result is truncated at [MAX_EXPANSION_LEN] bytes.
    pub fn expand(&self) -> LinkTarget {
        let raw = self.inner.as_ref();
        if !raw.contains(&b'$') {
            return self.clone();
        }

        let mut out: Vec<u8> = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() && out.len() < MAX_EXPANSION_LEN {
            if raw[i] == b'$' && i + 1 < raw.len() && raw[i + 1] == b'(' {
                match raw[i + 2..].iter().position(|&c| c == b')') {
                    Some(rel) => {
                        let name = &raw[i + 2..i + 2 + rel];
                        if let Ok(name) = std::str::from_utf8(name) {
                            if let Ok(value) = std::env::var(name) {
                                let room = MAX_EXPANSION_LEN - out.len();
                                let value = value.as_bytes();
                                out.extend_from_slice(&value[..value.len().min(room)]);
                            }
                        }
                        i += 2 + rel + 1;
                    }
                    None => {
                        // Right parenthesis missing, keep the text as is.
                        out.extend_from_slice(b"$(");
                        i += 2;
                    }
                }
            } else {
                out.push(raw[i]);
                i += 1;
            }
        }

        LinkTarget {
            inner: Bytes::from(out),
        }
    }
}

impl TryFrom<Bytes> for LinkTarget {
    type Error = LinkTargetError;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(LinkTargetError::Empty);
        }
        if value.len() > MAX_LINK_LEN {
            return Err(LinkTargetError::TooLong);
        }
        if value.contains(&b'\0') {
            return Err(LinkTargetError::Null);
        }
        Ok(Self { inner: value })
    }
}

impl TryFrom<&[u8]> for LinkTarget {
    type Error = LinkTargetError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Bytes::copy_from_slice(value).try_into()
    }
}

impl TryFrom<&str> for LinkTarget {
    type Error = LinkTargetError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

impl Debug for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

/// One filesystem object as recorded in a catalog row.
///
/// Inode and parent inode are session values assigned when the owning
/// catalog is mounted; they are never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub(crate) name: EntryName,
    pub(crate) symlink: Option<LinkTarget>,
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) size: u64,
    pub(crate) mtime: i64,
    pub(crate) checksum: ContentHash,
    pub(crate) inode: InodeId,
    pub(crate) parent_inode: InodeId,
    pub(crate) hardlinks: Hardlinks,
    pub(crate) is_nested_root: bool,
    pub(crate) is_nested_mountpoint: bool,
    pub(crate) catalog: Option<CatalogId>,
}

impl DirectoryEntry {
    pub fn new_directory(name: EntryName, perm: u32, mtime: i64) -> Self {
        Self::with_name(name, libc::S_IFDIR as u32 | (perm & 0o7777), mtime)
    }

    pub fn new_file(
        name: EntryName,
        size: u64,
        checksum: ContentHash,
        perm: u32,
        mtime: i64,
    ) -> Self {
        let mut entry = Self::with_name(name, libc::S_IFREG as u32 | (perm & 0o7777), mtime);
        entry.size = size;
        entry.checksum = checksum;
        entry
    }

    pub fn new_symlink(name: EntryName, target: LinkTarget, mtime: i64) -> Self {
        let mut entry = Self::with_name(name, libc::S_IFLNK as u32 | 0o777, mtime);
        entry.symlink = Some(target);
        entry
    }

    /// The synthetic root entry of a repository or of a freshly created
    /// catalog. It is the only entry with an empty name.
    pub fn repository_root(perm: u32, mtime: i64) -> Self {
        Self::with_name(EntryName::ROOT, libc::S_IFDIR as u32 | (perm & 0o7777), mtime)
    }

    fn with_name(name: EntryName, mode: u32, mtime: i64) -> Self {
        Self {
            name,
            symlink: None,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            mtime,
            checksum: ContentHash::NULL,
            inode: INVALID_INODE,
            parent_inode: INVALID_INODE,
            hardlinks: Hardlinks::default(),
            is_nested_root: false,
            is_nested_mountpoint: false,
            catalog: None,
        }
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn name(&self) -> &[u8] {
        self.name.as_bytes()
    }

    pub fn is_directory(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }

    pub fn is_nested_root(&self) -> bool {
        self.is_nested_root
    }

    pub fn is_nested_mountpoint(&self) -> bool {
        self.is_nested_mountpoint
    }

    pub fn symlink(&self) -> Option<&LinkTarget> {
        self.symlink.as_ref()
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// The size in bytes. Symlinks report the length of their target.
    pub fn size(&self) -> u64 {
        match &self.symlink {
            Some(target) if self.is_symlink() => target.len() as u64,
            _ => self.size,
        }
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn checksum(&self) -> &ContentHash {
        &self.checksum
    }

    pub fn inode(&self) -> InodeId {
        self.inode
    }

    pub fn parent_inode(&self) -> InodeId {
        self.parent_inode
    }

    pub fn hardlinks(&self) -> Hardlinks {
        self.hardlinks
    }

    pub fn linkcount(&self) -> u32 {
        self.hardlinks.linkcount()
    }

    pub fn hardlink_group(&self) -> u32 {
        self.hardlinks.group()
    }

    /// The catalog this entry was read from, as an opaque handle into
    /// the owning manager's mount tree.
    pub fn catalog(&self) -> Option<CatalogId> {
        self.catalog
    }

    pub fn set_hardlinks(&mut self, group: u32, linkcount: u32) {
        self.hardlinks = Hardlinks::new(group, linkcount);
    }

    pub(crate) fn set_is_nested_root(&mut self, value: bool) {
        self.is_nested_root = value;
    }

    pub(crate) fn set_is_nested_mountpoint(&mut self, value: bool) {
        self.is_nested_mountpoint = value;
    }

    /// The flags byte as persisted. Derived from the file type bits and
    /// the nested-catalog markers; a mountpoint marker is suppressed on
    /// a row that is itself a nested root.
    pub fn flags(&self) -> DirentFlags {
        let mut flags = DirentFlags::empty();
        if self.is_nested_root {
            flags |= DirentFlags::DIR_NESTED_ROOT;
        } else if self.is_nested_mountpoint {
            flags |= DirentFlags::DIR_NESTED_MOUNTPOINT;
        }

        if self.is_directory() {
            flags |= DirentFlags::DIR;
        } else if self.is_symlink() {
            flags |= DirentFlags::FILE | DirentFlags::LINK;
        } else {
            flags |= DirentFlags::FILE;
        }
        flags
    }

    /// Projects the entry onto the stat structure handed to POSIX
    /// readers.
    pub fn stat(&self) -> StatInfo {
        StatInfo {
            dev: 1,
            ino: self.inode,
            mode: self.mode,
            nlink: self.linkcount(),
            uid: self.uid,
            gid: self.gid,
            rdev: 1,
            size: self.size(),
            blksize: 4096,
            blocks: 1 + self.size() / 512,
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
        }
    }
}

/// What the entry cache stores per inode: a record, or the knowledge
/// that the inode does not resolve.
#[derive(Clone, Debug)]
pub enum CacheEntry {
    Present(DirectoryEntry),
    Negative,
}

/// The stat projection of a [DirectoryEntry].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatInfo {
    pub dev: u64,
    pub ino: InodeId,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn target(s: &str) -> LinkTarget {
        s.try_into().unwrap()
    }

    #[test]
    fn entry_name_validation() {
        assert!(EntryName::try_from("plain-name").is_ok());
        assert!(EntryName::ROOT.is_root());
        assert_eq!(EntryName::try_from("."), Err(EntryNameError::Dot));
        assert_eq!(EntryName::try_from(".."), Err(EntryNameError::Dot));
        assert_eq!(
            EntryName::try_from("a/b"),
            Err(EntryNameError::ForbiddenByte)
        );
        assert_eq!(
            EntryName::try_from(b"a\0b".as_slice()),
            Err(EntryNameError::ForbiddenByte)
        );
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            EntryName::try_from(long.as_str()),
            Err(EntryNameError::TooLong)
        );
    }

    #[test]
    fn hardlinks_zero_is_single_link() {
        let h = Hardlinks::from_raw(0);
        assert_eq!(h.group(), 0);
        assert_eq!(h.linkcount(), 1);
        assert!(!h.is_grouped());
    }

    #[test]
    fn hardlinks_pack_unpack() {
        let h = Hardlinks::new(7, 3);
        assert_eq!(h.group(), 7);
        assert_eq!(h.linkcount(), 3);
        assert_eq!(h.raw(), (7u64 << 32) | 3);
        assert!(h.is_grouped());
    }

    #[rstest]
    #[case::plain("plain/target", "plain/target")]
    #[case::dollar_only("a$b", "a$b")]
    #[case::trailing_dollar("ab$", "ab$")]
    #[case::unterminated("$(unterminated", "$(unterminated")]
    #[case::missing("$(CASCADE_TEST_SURELY_UNSET)", "")]
    fn expansion(#[case] raw: &str, #[case] expected: &str) {
        let expanded = target(raw).expand();
        assert_eq!(expanded.as_bytes(), expected.as_bytes());
    }

    #[test]
    fn expansion_replaces_variable() {
        std::env::set_var("CASCADE_TEST_BASE", "bar");
        assert_eq!(target("$(CASCADE_TEST_BASE)").expand().as_bytes(), b"bar");
        assert_eq!(
            target("pre/$(CASCADE_TEST_BASE)/post").expand().as_bytes(),
            b"pre/bar/post"
        );
    }

    #[test]
    fn expansion_is_single_pass() {
        std::env::set_var("CASCADE_TEST_OUTER", "$(CASCADE_TEST_INNER)");
        std::env::set_var("CASCADE_TEST_INNER", "should-not-appear");
        assert_eq!(
            target("$(CASCADE_TEST_OUTER)").expand().as_bytes(),
            b"$(CASCADE_TEST_INNER)"
        );
    }

    #[test]
    fn expansion_is_bounded() {
        std::env::set_var("CASCADE_TEST_BIG", "x".repeat(3000));
        let expanded = target("$(CASCADE_TEST_BIG)$(CASCADE_TEST_BIG)").expand();
        assert_eq!(expanded.len(), 4096);
    }

    #[test]
    fn link_target_validation() {
        assert_eq!(LinkTarget::try_from(""), Err(LinkTargetError::Empty));
        assert_eq!(
            LinkTarget::try_from(b"a\0b".as_slice()),
            Err(LinkTargetError::Null)
        );
        let long = "x".repeat(MAX_LINK_LEN + 1);
        assert_eq!(
            LinkTarget::try_from(long.as_str()),
            Err(LinkTargetError::TooLong)
        );
    }

    #[test]
    fn symlink_reports_target_length_as_size() {
        let entry = DirectoryEntry::new_symlink(
            "l".try_into().unwrap(),
            target("some/where"),
            0,
        );
        assert_eq!(entry.size(), 10);
        assert!(entry.is_symlink());
        assert!(!entry.is_directory());
    }

    #[test]
    fn flags_for_file_types() {
        let dir = DirectoryEntry::new_directory("d".try_into().unwrap(), 0o755, 0);
        assert_eq!(dir.flags(), DirentFlags::DIR);

        let file =
            DirectoryEntry::new_file("f".try_into().unwrap(), 1, ContentHash::NULL, 0o644, 0);
        assert_eq!(file.flags(), DirentFlags::FILE);

        let link = DirectoryEntry::new_symlink("l".try_into().unwrap(), target("t"), 0);
        assert_eq!(link.flags(), DirentFlags::FILE | DirentFlags::LINK);

        let mut mount = DirectoryEntry::new_directory("m".try_into().unwrap(), 0o755, 0);
        mount.set_is_nested_mountpoint(true);
        assert_eq!(
            mount.flags(),
            DirentFlags::DIR | DirentFlags::DIR_NESTED_MOUNTPOINT
        );

        // A nested root wins over a stale mountpoint marker.
        mount.set_is_nested_root(true);
        assert_eq!(mount.flags(), DirentFlags::DIR | DirentFlags::DIR_NESTED_ROOT);
    }

    #[test]
    fn stat_projection() {
        let mut entry =
            DirectoryEntry::new_file("f".try_into().unwrap(), 1025, ContentHash::NULL, 0o644, 7)
                .with_owner(123, 456);
        entry.inode = 42;
        let s = entry.stat();
        assert_eq!(s.ino, 42);
        assert_eq!(s.nlink, 1);
        assert_eq!(s.uid, 123);
        assert_eq!(s.gid, 456);
        assert_eq!(s.size, 1025);
        assert_eq!(s.blocks, 3);
        assert_eq!(s.mtime, 7);
    }
}
