//! The catalog managers. The read side maintains the tree of mounted
//! catalogs and resolves paths and inodes across nested-catalog
//! boundaries; the writable side in [write] adds the mutation and
//! snapshot machinery.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cache::{InodeCache, LruCache, RESERVED_INODE_KEYS};
use crate::catalog::{Catalog, CatalogId};
use crate::database::{CatalogDatabase, OpenMode, OwnerIds};
use crate::digests::{ContentHash, PathHash};
use crate::entry::{CacheEntry, DirectoryEntry, InodeId};
use crate::errors::Error;
use crate::path::{RepoPath, RepoPathBuf};

mod write;
pub use write::{UploadSpooler, WritableCatalogManager};

/// Inodes below this offset are never assigned; the first mounted
/// catalog starts its range here.
const INITIAL_INODE_OFFSET: u64 = 255;

/// Yields a local file for a catalog artifact, fetching and
/// decompressing from remote storage as needed. The managers perform no
/// remote I/O themselves.
pub trait CatalogFetch: Send + Sync {
    fn fetch(&self, mountpoint: &RepoPath, hash: &ContentHash) -> Result<PathBuf, Error>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of the inode entry cache on the read path.
    pub cache_capacity: usize,
    /// Owner ids projected onto entries at read-out.
    pub owner: OwnerIds,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 16384,
            owner: OwnerIds::default(),
        }
    }
}

/// The read side: loads catalogs lazily, mounts nested catalogs on
/// first traversal and resolves lookups across catalog boundaries.
///
/// Lookups may run concurrently with other lookups but not with
/// mutations; callers serialize externally.
pub struct CatalogManager {
    // Mount tree arena; handles index into it. Slots empty out only
    // when a nested catalog is unmounted.
    catalogs: Vec<Option<Catalog>>,
    root: Option<CatalogId>,
    // Hash of the root catalog as mounted or last snapshotted.
    pub(crate) root_hash: Option<ContentHash>,
    inode_cache: InodeCache,
    next_inode_offset: u64,
    fetch: Box<dyn CatalogFetch>,
    owner: OwnerIds,
    writable: bool,
}

impl CatalogManager {
    pub fn new(fetch: Box<dyn CatalogFetch>, config: ManagerConfig) -> Self {
        Self::with_mode(fetch, config, false)
    }

    pub(crate) fn with_mode(
        fetch: Box<dyn CatalogFetch>,
        config: ManagerConfig,
        writable: bool,
    ) -> Self {
        Self {
            catalogs: Vec::new(),
            root: None,
            root_hash: None,
            inode_cache: LruCache::new(config.cache_capacity.max(1), RESERVED_INODE_KEYS),
            next_inode_offset: INITIAL_INODE_OFFSET,
            fetch,
            owner: config.owner,
            writable,
        }
    }

    /// Mounts the root catalog of the repository revision named by
    /// `hash`.
    #[instrument(skip(self))]
    pub fn mount_root(&mut self, hash: &ContentHash) -> Result<(), Error> {
        if self.root.is_some() {
            return Err(Error::Invariant("root catalog already mounted".to_string()));
        }
        let local = self.fetch.fetch(RepoPath::ROOT, hash)?;
        let id = self.attach(local, RepoPathBuf::root(), None)?;
        self.root = Some(id);
        self.root_hash = Some(*hash);
        Ok(())
    }

    /// Mounts a local catalog file as the root, bypassing the fetch
    /// collaborator. Used when bootstrapping a fresh repository.
    pub(crate) fn attach_root_file(&mut self, local: PathBuf) -> Result<CatalogId, Error> {
        if self.root.is_some() {
            return Err(Error::Invariant("root catalog already mounted".to_string()));
        }
        let id = self.attach(local, RepoPathBuf::root(), None)?;
        self.root = Some(id);
        Ok(id)
    }

    fn attach(
        &mut self,
        local: PathBuf,
        root_prefix: RepoPathBuf,
        parent: Option<CatalogId>,
    ) -> Result<CatalogId, Error> {
        let mode = if self.writable {
            OpenMode::ReadWrite
        } else {
            OpenMode::ReadOnly
        };
        let database = CatalogDatabase::open(&local, mode)?;

        let recorded = database.root_prefix()?;
        if recorded.as_bytes() != root_prefix.as_bytes() {
            return Err(Error::Invariant(format!(
                "catalog rooted at '{}' mounted at '{}'",
                recorded, root_prefix
            )));
        }

        let id = CatalogId(self.catalogs.len());
        let mut catalog = Catalog::new(
            id,
            database,
            local,
            root_prefix.clone(),
            parent,
            self.next_inode_offset,
        )?;
        catalog.owner = self.owner;
        self.next_inode_offset += catalog.inode_range.size;

        if !root_prefix.is_root() {
            let root_row = catalog
                .lookup(&PathHash::of(&root_prefix))?
                .ok_or_else(|| {
                    Error::Invariant(format!("nested catalog at {} has no root entry", root_prefix))
                })?;
            if !root_row.is_directory() || !root_row.is_nested_root() {
                return Err(Error::Invariant(format!(
                    "entry at {} is not a nested catalog root",
                    root_prefix
                )));
            }
        }

        self.catalogs.push(Some(catalog));
        if let Some(parent_id) = parent {
            self.catalog_mut(parent_id)?.children.push(id);
        }
        Ok(id)
    }

    fn mount_child(
        &mut self,
        parent: CatalogId,
        mountpoint: &RepoPath,
        hash: &ContentHash,
    ) -> Result<CatalogId, Error> {
        if hash.is_null() {
            return Err(Error::Invariant(format!(
                "nested catalog at {} has no artifact yet",
                mountpoint
            )));
        }

        let mountpoint_row = self
            .catalog_mut(parent)?
            .lookup(&PathHash::of(mountpoint))?
            .ok_or_else(|| {
                Error::Invariant(format!("no mountpoint entry at {}", mountpoint))
            })?;
        if !mountpoint_row.is_nested_mountpoint() {
            return Err(Error::Invariant(format!(
                "entry at {} is not flagged as a mountpoint",
                mountpoint
            )));
        }

        let local = self.fetch.fetch(mountpoint, hash)?;
        let id = self.attach(local, mountpoint.to_owned(), Some(parent))?;
        debug!(mountpoint = %mountpoint, "mounted nested catalog");
        Ok(id)
    }

    pub(crate) fn catalog(&self, id: CatalogId) -> Result<&Catalog, Error> {
        self.catalogs
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| Error::Invariant(format!("stale catalog handle {:?}", id)))
    }

    pub(crate) fn catalog_mut(&mut self, id: CatalogId) -> Result<&mut Catalog, Error> {
        self.catalogs
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| Error::Invariant(format!("stale catalog handle {:?}", id)))
    }

    pub(crate) fn root_id(&self) -> Result<CatalogId, Error> {
        self.root
            .ok_or_else(|| Error::Invariant("no root catalog mounted".to_string()))
    }

    pub(crate) fn mounted_ids(&self) -> Vec<CatalogId> {
        self.catalogs
            .iter()
            .flatten()
            .map(|catalog| catalog.id)
            .collect()
    }

    /// Removes a catalog from the mount tree and hands it back. Its
    /// mounted children must have been re-parented beforehand.
    pub(crate) fn detach(&mut self, id: CatalogId) -> Result<Catalog, Error> {
        let parent = self.catalog(id)?.parent;
        if let Some(parent_id) = parent {
            self.catalog_mut(parent_id)?
                .children
                .retain(|child| *child != id);
        }
        self.catalogs
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::Invariant(format!("stale catalog handle {:?}", id)))
    }

    /// Picks the deepest catalog whose root prefix is a prefix of
    /// `path`, mounting nested catalogs along the way.
    pub(crate) fn find_catalog(&mut self, path: &RepoPath) -> Result<CatalogId, Error> {
        let mut current = self.root_id()?;
        'descend: loop {
            let children = self.catalog(current)?.children.clone();
            for child_id in children {
                if self.catalog(child_id)?.root_prefix.is_prefix_of(path) {
                    current = child_id;
                    continue 'descend;
                }
            }

            // Not in a mounted child; a registered but unmounted nested
            // catalog may still own the path.
            let nested = self.catalog(current)?.database.nested_listing()?;
            for (mountpoint, hash) in nested {
                let descends = self
                    .catalog(current)?
                    .root_prefix
                    .is_strict_prefix_of(&mountpoint);
                if descends && mountpoint.is_prefix_of(path) {
                    current = self.mount_child(current, &mountpoint, &hash)?;
                    continue 'descend;
                }
            }

            return Ok(current);
        }
    }

    /// Resolves a path to its directory entry, or `None` when absent.
    #[instrument(skip(self))]
    pub fn lookup_path(&mut self, path: &RepoPath) -> Result<Option<DirectoryEntry>, Error> {
        let catalog_id = self.find_catalog(path)?;
        let hash = PathHash::of(path);
        let mut entry = match self.catalog_mut(catalog_id)?.lookup(&hash)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        // The parent inode needs a second lookup; the parent row may
        // live one catalog up.
        if let Some(parent_path) = path.parent() {
            let parent_catalog = self.find_catalog(parent_path)?;
            if let Some(parent_entry) = self
                .catalog_mut(parent_catalog)?
                .lookup(&PathHash::of(parent_path))?
            {
                entry.parent_inode = parent_entry.inode();
            }
        }

        self.inode_cache
            .insert(entry.inode(), CacheEntry::Present(entry.clone()));
        Ok(Some(entry))
    }

    /// Resolves a session inode to its directory entry. Absence is
    /// cached negatively.
    ///
    /// Hardlink-group members all advertise the group's canonical
    /// inode; a member's underlying row inode is an internal alias and
    /// does not resolve here. Every entry returned therefore reports
    /// exactly the queried inode.
    #[instrument(skip(self))]
    pub fn lookup_inode(&mut self, inode: InodeId) -> Result<Option<DirectoryEntry>, Error> {
        match self.inode_cache.lookup(&inode) {
            Some(CacheEntry::Present(entry)) => return Ok(Some(entry.clone())),
            Some(CacheEntry::Negative) => return Ok(None),
            None => {}
        }

        let owning = self
            .catalogs
            .iter()
            .flatten()
            .find(|catalog| catalog.inode_range.contains(inode))
            .map(|catalog| catalog.id);

        let Some(catalog_id) = owning else {
            self.inode_cache.insert(inode, CacheEntry::Negative);
            return Ok(None);
        };

        let offset = self.catalog(catalog_id)?.inode_range.offset;
        match self.catalog_mut(catalog_id)?.lookup_row_id(inode - offset)? {
            Some(entry) if entry.inode() == inode => {
                self.inode_cache
                    .insert(inode, CacheEntry::Present(entry.clone()));
                Ok(Some(entry))
            }
            Some(entry) => {
                // The row resolved to a hardlink-group member whose
                // canonical inode was fixed by another member. Only the
                // canonical inode is ever advertised, so the queried
                // alias does not exist for readers.
                self.inode_cache
                    .insert(entry.inode(), CacheEntry::Present(entry));
                self.inode_cache.insert(inode, CacheEntry::Negative);
                Ok(None)
            }
            None => {
                self.inode_cache.insert(inode, CacheEntry::Negative);
                Ok(None)
            }
        }
    }

    /// Lists the entries of the directory at `path`.
    #[instrument(skip(self))]
    pub fn list_directory(&mut self, path: &RepoPath) -> Result<Vec<DirectoryEntry>, Error> {
        let catalog_id = self.find_catalog(path)?;
        let hash = PathHash::of(path);
        let dir = self
            .catalog_mut(catalog_id)?
            .lookup(&hash)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !dir.is_directory() {
            return Err(Error::NotFound(format!("{} is not a directory", path)));
        }

        let mut entries = self.catalog_mut(catalog_id)?.listing(&hash)?;
        for entry in &mut entries {
            entry.parent_inode = dir.inode();
        }
        Ok(entries)
    }

    /// The nested catalogs registered in the catalog owning `path`.
    pub fn list_nested_catalogs(
        &mut self,
        path: &RepoPath,
    ) -> Result<Vec<(RepoPathBuf, ContentHash)>, Error> {
        let catalog_id = self.find_catalog(path)?;
        self.catalog(catalog_id)?.database.nested_listing()
    }

    /// Empties the entry cache.
    pub fn drop_caches(&mut self) {
        self.inode_cache.clear();
    }
}
