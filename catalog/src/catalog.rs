//! One mounted catalog: a database handle plus the session state the
//! managers track per node of the catalog tree.
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::database::{CatalogDatabase, DirentRow, OwnerIds};
use crate::digests::PathHash;
use crate::entry::{DirectoryEntry, InodeId};
use crate::errors::Error;
use crate::path::RepoPathBuf;

/// Opaque handle to a mounted catalog in a manager's mount tree.
/// Entries carry it as their back-reference to the catalog they were
/// read from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CatalogId(pub(crate) usize);

/// Per-catalog lifecycle. A catalog is dirty from its first mutation
/// until snapshot; while snapshotting it rejects further mutations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CatalogState {
    Clean,
    Dirty,
    Snapshotting,
}

/// The block of session inodes assigned to a catalog on mount. Row id
/// `r` maps to inode `offset + r`, so valid inodes lie in
/// `(offset, offset + size]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InodeRange {
    pub offset: u64,
    pub size: u64,
}

impl InodeRange {
    pub fn contains(&self, inode: InodeId) -> bool {
        inode > self.offset && inode <= self.offset + self.size
    }
}

pub(crate) struct Catalog {
    pub(crate) id: CatalogId,
    pub(crate) database: CatalogDatabase,
    pub(crate) local_path: PathBuf,
    pub(crate) root_prefix: RepoPathBuf,
    pub(crate) parent: Option<CatalogId>,
    pub(crate) children: Vec<CatalogId>,
    pub(crate) state: CatalogState,
    pub(crate) inode_range: InodeRange,
    pub(crate) owner: OwnerIds,
    // Canonical session inode per hardlink group: the first row of a
    // group seen in this session fixes the inode all members report.
    group_inodes: HashMap<u32, InodeId>,
}

impl Catalog {
    pub(crate) fn new(
        id: CatalogId,
        database: CatalogDatabase,
        local_path: PathBuf,
        root_prefix: RepoPathBuf,
        parent: Option<CatalogId>,
        inode_offset: u64,
    ) -> Result<Self, Error> {
        let size = database.max_row_id()?;
        debug!(
            root = %root_prefix,
            offset = inode_offset,
            size,
            "mounting catalog"
        );
        Ok(Self {
            id,
            database,
            local_path,
            root_prefix,
            parent,
            children: Vec::new(),
            state: CatalogState::Clean,
            inode_range: InodeRange {
                offset: inode_offset,
                size,
            },
            owner: OwnerIds::default(),
            group_inodes: HashMap::new(),
        })
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state == CatalogState::Dirty
    }

    /// Fails while a snapshot of this catalog is in flight.
    pub(crate) fn ensure_mutable(&self) -> Result<(), Error> {
        if !self.database.is_read_write() {
            return Err(Error::Storage(format!(
                "catalog {} is mounted read-only",
                self.root_prefix
            )));
        }
        if self.state == CatalogState::Snapshotting {
            return Err(Error::Storage(format!(
                "catalog {} is being snapshotted",
                self.root_prefix
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_dirty(&mut self) {
        if self.state == CatalogState::Clean {
            self.state = CatalogState::Dirty;
        }
    }

    pub(crate) fn begin_snapshot(&mut self) {
        self.state = CatalogState::Snapshotting;
    }

    pub(crate) fn finish_snapshot(&mut self, success: bool) {
        self.state = if success {
            CatalogState::Clean
        } else {
            CatalogState::Dirty
        };
    }

    /// The session inode of a row. Members of a hardlink group all
    /// report the inode of the group's first-resolved row.
    fn mangled_inode(&mut self, row_id: u64, hardlink_group: u32) -> InodeId {
        let inode = self.inode_range.offset + row_id;
        if hardlink_group == 0 {
            return inode;
        }
        *self.group_inodes.entry(hardlink_group).or_insert(inode)
    }

    fn finish_row(&mut self, row: DirentRow) -> DirectoryEntry {
        let mut entry = row.entry;
        entry.inode = self.mangled_inode(row.row_id, entry.hardlinks.group());
        entry.catalog = Some(self.id);
        entry
    }

    /// Looks up the entry keyed by `hash`, with session inode and
    /// catalog back-reference filled in.
    pub(crate) fn lookup(&mut self, hash: &PathHash) -> Result<Option<DirectoryEntry>, Error> {
        let owner = self.owner;
        Ok(self
            .database
            .lookup_path(hash, owner, false)?
            .map(|row| self.finish_row(row)))
    }

    pub(crate) fn lookup_row_id(&mut self, row_id: u64) -> Result<Option<DirectoryEntry>, Error> {
        let owner = self.owner;
        Ok(self
            .database
            .lookup_row_id(row_id, owner)?
            .map(|row| self.finish_row(row)))
    }

    /// Lists the children of the directory whose path hashes to
    /// `parent_hash`.
    pub(crate) fn listing(
        &mut self,
        parent_hash: &PathHash,
    ) -> Result<Vec<DirectoryEntry>, Error> {
        let owner = self.owner;
        let rows = self.database.listing(parent_hash, owner, false)?;
        Ok(rows.into_iter().map(|row| self.finish_row(row)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_range_bounds() {
        let range = InodeRange {
            offset: 255,
            size: 3,
        };
        assert!(!range.contains(255));
        assert!(range.contains(256));
        assert!(range.contains(258));
        assert!(!range.contains(259));
    }
}
