//! The writable catalog manager: routes mutations to the owning
//! catalog, materializes nested-catalog boundaries and snapshots dirty
//! catalogs bottom-up into content-addressed artifacts.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, warn};

use super::{CatalogFetch, CatalogManager, ManagerConfig};
use crate::catalog::CatalogId;
use crate::database::CatalogDatabase;
use crate::digests::{ContentHash, PathHash};
use crate::entry::DirectoryEntry;
use crate::errors::Error;
use crate::manifest::Manifest;
use crate::path::{RepoPath, RepoPathBuf};

/// Transports a finalized catalog file to remote storage and reports
/// the content hash under which it became visible. Compression and
/// signing happen behind this seam.
pub trait UploadSpooler: Send + Sync {
    fn upload(&self, local: &Path) -> Result<ContentHash, Error>;
}

/// Adds write functionality on top of [CatalogManager].
///
/// Exactly one writer session mutates a repository at a time; within
/// the session, crawler threads may call the mutation operations
/// concurrently. A single sync mutex serializes all mutations and all
/// catalog mounts. It is not held across spooler uploads.
///
/// Session inodes assigned by the writable mount tree are opaque row
/// identifiers; they shift as rows are inserted and are therefore not
/// served through any read interface here.
pub struct WritableCatalogManager {
    inner: Mutex<CatalogManager>,
    spooler: Box<dyn UploadSpooler>,
    dir_temp: PathBuf,
    next_catalog_file: AtomicU64,
}

impl WritableCatalogManager {
    /// Bootstraps a new repository: an empty root catalog containing
    /// only the root directory entry. The first [Self::commit] turns it
    /// into a publishable revision.
    #[instrument(skip_all, fields(dir_temp = %dir_temp.as_ref().display()))]
    pub fn create_repository(
        dir_temp: impl AsRef<Path>,
        fetch: Box<dyn CatalogFetch>,
        spooler: Box<dyn UploadSpooler>,
        config: ManagerConfig,
    ) -> Result<Self, Error> {
        let dir_temp = dir_temp.as_ref().to_owned();
        std::fs::create_dir_all(&dir_temp)?;

        let file = dir_temp.join("catalog-0.working");
        let root_entry = DirectoryEntry::repository_root(0o755, now_secs())
            .with_owner(config.owner.uid, config.owner.gid);
        CatalogDatabase::create(&file, &root_entry, RepoPath::ROOT)?;

        let mut mgr = CatalogManager::with_mode(fetch, config, true);
        let root_id = mgr.attach_root_file(file)?;
        mgr.catalog_mut(root_id)?.mark_dirty();

        Ok(Self {
            inner: Mutex::new(mgr),
            spooler,
            dir_temp,
            next_catalog_file: AtomicU64::new(1),
        })
    }

    /// Starts a writer session on an existing repository revision. The
    /// fetch collaborator must hand out private, writable copies of the
    /// catalog artifacts.
    #[instrument(skip_all)]
    pub fn open_repository(
        base_hash: &ContentHash,
        dir_temp: impl AsRef<Path>,
        fetch: Box<dyn CatalogFetch>,
        spooler: Box<dyn UploadSpooler>,
        config: ManagerConfig,
    ) -> Result<Self, Error> {
        let dir_temp = dir_temp.as_ref().to_owned();
        std::fs::create_dir_all(&dir_temp)?;

        let mut mgr = CatalogManager::with_mode(fetch, config, true);
        mgr.mount_root(base_hash)?;

        Ok(Self {
            inner: Mutex::new(mgr),
            spooler,
            dir_temp,
            next_catalog_file: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, CatalogManager>, Error> {
        self.inner
            .lock()
            .map_err(|_| Error::Invariant("sync lock poisoned by an earlier panic".to_string()))
    }

    fn next_catalog_path(&self) -> PathBuf {
        let n = self.next_catalog_file.fetch_add(1, Ordering::Relaxed);
        self.dir_temp.join(format!("catalog-{}.working", n))
    }

    /// Resolves a path; see [CatalogManager::lookup_path].
    pub fn lookup_path(&self, path: &RepoPath) -> Result<Option<DirectoryEntry>, Error> {
        self.lock()?.lookup_path(path)
    }

    /// Lists a directory; see [CatalogManager::list_directory].
    pub fn list_directory(&self, path: &RepoPath) -> Result<Vec<DirectoryEntry>, Error> {
        self.lock()?.list_directory(path)
    }

    /// The nested catalogs registered in the catalog owning `path`.
    pub fn list_nested_catalogs(
        &self,
        path: &RepoPath,
    ) -> Result<Vec<(RepoPathBuf, ContentHash)>, Error> {
        self.lock()?.list_nested_catalogs(path)
    }

    /// Inserts a file or symlink entry under `parent_dir`.
    #[instrument(skip(self, entry), fields(name = %String::from_utf8_lossy(entry.name())))]
    pub fn add_file(&self, entry: &DirectoryEntry, parent_dir: &RepoPath) -> Result<(), Error> {
        if entry.is_directory() {
            return Err(Error::Invariant(
                "add_file called with a directory entry".to_string(),
            ));
        }
        add_entry(&mut *self.lock()?, entry, parent_dir)
    }

    /// Inserts a directory entry under `parent_dir`.
    #[instrument(skip(self, entry), fields(name = %String::from_utf8_lossy(entry.name())))]
    pub fn add_directory(&self, entry: &DirectoryEntry, parent_dir: &RepoPath) -> Result<(), Error> {
        if !entry.is_directory() {
            return Err(Error::Invariant(
                "add_directory called with a non-directory entry".to_string(),
            ));
        }
        add_entry(&mut *self.lock()?, entry, parent_dir)
    }

    /// Removes the file or symlink at `path`.
    #[instrument(skip(self))]
    pub fn remove_file(&self, path: &RepoPath) -> Result<(), Error> {
        let mut mgr = self.lock()?;
        let catalog_id = mgr.find_catalog(path)?;
        mgr.catalog(catalog_id)?.ensure_mutable()?;

        let hash = PathHash::of(path);
        let owner = mgr.catalog(catalog_id)?.owner;
        let row = mgr
            .catalog(catalog_id)?
            .database
            .lookup_path(&hash, owner, true)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if row.entry.is_directory() {
            return Err(Error::Invariant(format!(
                "remove_file called on directory {}",
                path
            )));
        }
        if row.entry.hardlinks().is_grouped() {
            return Err(Error::Invariant(format!(
                "{} belongs to a hardlink group; shrink the group instead",
                path
            )));
        }

        mgr.catalog(catalog_id)?.database.unlink(&hash)?;
        mgr.catalog_mut(catalog_id)?.mark_dirty();
        Ok(())
    }

    /// Removes the directory at `path`, which must be empty.
    #[instrument(skip(self))]
    pub fn remove_directory(&self, path: &RepoPath) -> Result<(), Error> {
        if path.is_root() {
            return Err(Error::Invariant(
                "cannot remove the repository root".to_string(),
            ));
        }

        let mut mgr = self.lock()?;
        let catalog_id = mgr.find_catalog(path)?;
        mgr.catalog(catalog_id)?.ensure_mutable()?;

        let hash = PathHash::of(path);
        let owner = mgr.catalog(catalog_id)?.owner;
        let row = mgr
            .catalog(catalog_id)?
            .database
            .lookup_path(&hash, owner, true)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !row.entry.is_directory() {
            return Err(Error::Invariant(format!(
                "remove_directory called on non-directory {}",
                path
            )));
        }
        if row.entry.is_nested_mountpoint() || row.entry.is_nested_root() {
            // The subtree lives in a nested catalog; it has to be
            // joined back before its mountpoint can go away.
            return Err(Error::NotEmpty(path.to_string()));
        }
        if !mgr.catalog(catalog_id)?.database.listing(&hash, owner, true)?.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        mgr.catalog(catalog_id)?.database.unlink(&hash)?;
        mgr.catalog_mut(catalog_id)?.mark_dirty();
        Ok(())
    }

    /// Updates the modification time of the entry at `path`.
    #[instrument(skip(self, entry))]
    pub fn touch_entry(&self, entry: &DirectoryEntry, path: &RepoPath) -> Result<(), Error> {
        let mut mgr = self.lock()?;
        let catalog_id = mgr.find_catalog(path)?;
        mgr.catalog(catalog_id)?.ensure_mutable()?;
        mgr.catalog(catalog_id)?
            .database
            .touch(&PathHash::of(path), entry.mtime())
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(path.to_string()),
                other => other,
            })?;
        mgr.catalog_mut(catalog_id)?.mark_dirty();
        Ok(())
    }

    /// Inserts a group of hardlinked entries under `parent_dir`. A
    /// fresh group id is allocated in the owning catalog; every member
    /// is stored with it and with the group's link count.
    #[instrument(skip(self, entries), fields(members = entries.len()))]
    pub fn add_hardlink_group(
        &self,
        entries: &[DirectoryEntry],
        parent_dir: &RepoPath,
    ) -> Result<(), Error> {
        if entries.is_empty() {
            return Err(Error::Invariant("empty hardlink group".to_string()));
        }
        if entries.iter().any(|e| e.is_directory()) {
            return Err(Error::Invariant(
                "directories cannot join hardlink groups".to_string(),
            ));
        }

        let mut mgr = self.lock()?;
        let catalog_id = mgr.find_catalog(parent_dir)?;
        mgr.catalog(catalog_id)?.ensure_mutable()?;

        let parent_hash = PathHash::of(parent_dir);
        let owner = mgr.catalog(catalog_id)?.owner;
        let parent_row = mgr
            .catalog(catalog_id)?
            .database
            .lookup_path(&parent_hash, owner, true)?
            .ok_or_else(|| Error::NotFound(format!("parent directory {}", parent_dir)))?;
        if !parent_row.entry.is_directory() {
            return Err(Error::Invariant(format!(
                "{} is not a directory",
                parent_dir
            )));
        }

        let group = mgr.catalog(catalog_id)?.database.max_hardlink_group()? + 1;
        let linkcount = entries.len() as u32;
        debug!(group, linkcount, "allocating hardlink group");

        for member in entries {
            let path = parent_dir.try_join(member.name()).map_err(|e| {
                Error::Invariant(format!("invalid hardlink member name: {}", e))
            })?;
            let mut member = member.clone();
            member.set_hardlinks(group, linkcount);
            mgr.catalog(catalog_id)?
                .database
                .insert(&PathHash::of(&path), &parent_hash, &member)?;
        }
        mgr.catalog_mut(catalog_id)?.mark_dirty();
        Ok(())
    }

    /// Removes one member from its hardlink group. When the group
    /// shrinks to a single member, the survivor's group id is cleared.
    #[instrument(skip(self))]
    pub fn shrink_hardlink_group(&self, path: &RepoPath) -> Result<(), Error> {
        let mut mgr = self.lock()?;
        let catalog_id = mgr.find_catalog(path)?;
        mgr.catalog(catalog_id)?.ensure_mutable()?;

        let hash = PathHash::of(path);
        let owner = mgr.catalog(catalog_id)?.owner;
        let row = mgr
            .catalog(catalog_id)?
            .database
            .lookup_path(&hash, owner, true)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        if !row.entry.hardlinks().is_grouped() {
            return Err(Error::Invariant(format!(
                "{} is not part of a hardlink group",
                path
            )));
        }

        mgr.catalog(catalog_id)?.database.adjust_linkcount(&hash, -1)?;
        mgr.catalog(catalog_id)?.database.unlink(&hash)?;
        mgr.catalog_mut(catalog_id)?.mark_dirty();
        Ok(())
    }

    /// Splits the subtree below `mountpoint` out of its catalog into a
    /// new nested catalog rooted there. The mountpoint directory stays
    /// in the parent catalog, flagged; the child is registered with a
    /// placeholder hash until its first snapshot.
    #[instrument(skip(self))]
    pub fn create_nested_catalog(&self, mountpoint: &RepoPath) -> Result<(), Error> {
        if mountpoint.is_root() {
            return Err(Error::Invariant(
                "the repository root cannot become a nested catalog".to_string(),
            ));
        }

        let mut mgr = self.lock()?;
        let parent_id = mgr.find_catalog(mountpoint)?;
        if mgr.catalog(parent_id)?.root_prefix.as_bytes() == mountpoint.as_bytes() {
            return Err(Error::AlreadyExists(format!(
                "{} is already a nested catalog mountpoint",
                mountpoint
            )));
        }
        mgr.catalog(parent_id)?.ensure_mutable()?;

        let hash = PathHash::of(mountpoint);
        let owner = mgr.catalog(parent_id)?.owner;
        let row = mgr
            .catalog(parent_id)?
            .database
            .lookup_path(&hash, owner, true)?
            .ok_or_else(|| Error::NotFound(mountpoint.to_string()))?;
        if !row.entry.is_directory() {
            return Err(Error::NotFound(format!(
                "no directory at {}",
                mountpoint
            )));
        }

        // The child's synthetic root entry is a copy of the mountpoint
        // directory.
        let mut root_entry = row.entry.clone();
        root_entry.set_is_nested_root(true);
        root_entry.set_is_nested_mountpoint(false);

        let file = self.next_catalog_path();
        CatalogDatabase::create(&file, &root_entry, mountpoint)?;
        let child_id = mgr.attach(file, mountpoint.to_owned(), Some(parent_id))?;

        move_subtree(&mut mgr, parent_id, child_id, mountpoint)?;
        relocate_nested_references(&mut mgr, parent_id, child_id, mountpoint)?;
        reparent_mounted_children(&mut mgr, parent_id, child_id, mountpoint)?;

        let mut mountpoint_entry = row.entry;
        mountpoint_entry.set_is_nested_mountpoint(true);
        mountpoint_entry.set_is_nested_root(false);
        mgr.catalog(parent_id)?.database.update(&hash, &mountpoint_entry)?;
        mgr.catalog(parent_id)?
            .database
            .nested_upsert(mountpoint, &ContentHash::NULL)?;

        mgr.catalog_mut(parent_id)?.mark_dirty();
        mgr.catalog_mut(child_id)?.mark_dirty();
        mgr.drop_caches();
        Ok(())
    }

    /// Joins the nested catalog mounted at `mountpoint` back into its
    /// parent: all rows and nested references move up, both nested
    /// flags are cleared and the registration row is deleted.
    #[instrument(skip(self))]
    pub fn remove_nested_catalog(&self, mountpoint: &RepoPath) -> Result<(), Error> {
        let mut mgr = self.lock()?;
        let child_id = mgr.find_catalog(mountpoint)?;
        if mgr.catalog(child_id)?.root_prefix.as_bytes() != mountpoint.as_bytes() {
            return Err(Error::NotFound(format!(
                "{} is not a nested catalog mountpoint",
                mountpoint
            )));
        }
        let Some(parent_id) = mgr.catalog(child_id)?.parent else {
            return Err(Error::NotFound(format!(
                "{} is not a nested catalog mountpoint",
                mountpoint
            )));
        };
        mgr.catalog(parent_id)?.ensure_mutable()?;
        mgr.catalog(child_id)?.ensure_mutable()?;

        move_subtree(&mut mgr, child_id, parent_id, mountpoint)?;
        relocate_nested_references(&mut mgr, child_id, parent_id, mountpoint)?;

        // Everything mounted below the child hangs off the parent now.
        let grandchildren = mgr.catalog(child_id)?.children.clone();
        for grandchild in grandchildren {
            mgr.catalog_mut(child_id)?.children.retain(|c| *c != grandchild);
            mgr.catalog_mut(parent_id)?.children.push(grandchild);
            mgr.catalog_mut(grandchild)?.parent = Some(parent_id);
        }

        let hash = PathHash::of(mountpoint);
        let owner = mgr.catalog(parent_id)?.owner;
        let row = mgr
            .catalog(parent_id)?
            .database
            .lookup_path(&hash, owner, true)?
            .ok_or_else(|| {
                Error::Invariant(format!("mountpoint row at {} disappeared", mountpoint))
            })?;
        let mut mountpoint_entry = row.entry;
        mountpoint_entry.set_is_nested_mountpoint(false);
        mountpoint_entry.set_is_nested_root(false);
        mgr.catalog(parent_id)?.database.update(&hash, &mountpoint_entry)?;
        mgr.catalog(parent_id)?.database.nested_delete(mountpoint)?;

        let detached = mgr.detach(child_id)?;
        let stale_file = detached.local_path.clone();
        drop(detached);
        if let Err(e) = std::fs::remove_file(&stale_file) {
            warn!(path = %stale_file.display(), err = %e, "could not remove joined catalog file");
        }

        mgr.catalog_mut(parent_id)?.mark_dirty();
        mgr.drop_caches();
        Ok(())
    }

    /// Pre-computes directory listing statistics in all dirty catalogs
    /// ahead of snapshot. Advisory and idempotent.
    #[instrument(skip(self))]
    pub fn precalculate_listings(&self) -> Result<(), Error> {
        let mgr = self.lock()?;
        for id in mgr.mounted_ids() {
            let catalog = mgr.catalog(id)?;
            if catalog.is_dirty() {
                catalog.database.analyze()?;
            }
        }
        Ok(())
    }

    /// Snapshots all dirty catalogs bottom-up and returns the manifest
    /// of the new repository revision.
    ///
    /// Children are finalized before their parents so that every child
    /// hash recorded in a parent names the artifact actually uploaded.
    /// On failure no manifest is produced; already uploaded children
    /// remain as unreferenced, content-addressed artifacts.
    #[instrument(skip(self))]
    pub fn commit(&self) -> Result<Manifest, Error> {
        let order = {
            let mgr = self.lock()?;
            let root = mgr.root_id()?;
            let mut order = Vec::new();
            collect_dirty(&mgr, root, &mut order)?;
            order
        };
        debug!(dirty = order.len(), "snapshotting catalogs");

        for id in order {
            // Finalize the file under the lock.
            let mut mgr = self.lock()?;
            let catalog = mgr.catalog_mut(id)?;
            catalog.begin_snapshot();
            let prepared = catalog
                .database
                .bump_revision()
                .and_then(|_| catalog.database.vacuum())
                .map(|_| {
                    (
                        catalog.local_path.clone(),
                        catalog.root_prefix.clone(),
                        catalog.parent,
                    )
                });
            let (local_path, root_prefix, parent) = match prepared {
                Ok(v) => v,
                Err(e) => {
                    catalog.finish_snapshot(false);
                    return Err(e);
                }
            };
            drop(mgr);

            // Upload without holding the sync lock.
            let uploaded = self.spooler.upload(&local_path);

            let mut mgr = self.lock()?;
            let hash = match uploaded {
                Ok(hash) => hash,
                Err(e) => {
                    mgr.catalog_mut(id)?.finish_snapshot(false);
                    return Err(e);
                }
            };
            match parent {
                Some(parent_id) => {
                    // Recording the child hash is what forces parents
                    // to snapshot after their children.
                    mgr.catalog(parent_id)?
                        .database
                        .nested_upsert(&root_prefix, &hash)?;
                }
                None => {
                    mgr.root_hash = Some(hash);
                }
            }
            mgr.catalog_mut(id)?.finish_snapshot(true);
        }

        let mgr = self.lock()?;
        let root = mgr.root_id()?;
        let revision = mgr.catalog(root)?.database.revision()?;
        let root_hash = mgr
            .root_hash
            .ok_or_else(|| Error::Invariant("no root catalog hash after commit".to_string()))?;
        Ok(Manifest::new(root_hash, revision, now_secs()))
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Inserts `entry` below `parent_dir` in the catalog owning the parent.
fn add_entry(
    mgr: &mut CatalogManager,
    entry: &DirectoryEntry,
    parent_dir: &RepoPath,
) -> Result<(), Error> {
    let catalog_id = mgr.find_catalog(parent_dir)?;
    mgr.catalog(catalog_id)?.ensure_mutable()?;

    let parent_hash = PathHash::of(parent_dir);
    let owner = mgr.catalog(catalog_id)?.owner;
    let parent_row = mgr
        .catalog(catalog_id)?
        .database
        .lookup_path(&parent_hash, owner, true)?
        .ok_or_else(|| Error::NotFound(format!("parent directory {}", parent_dir)))?;
    if !parent_row.entry.is_directory() {
        return Err(Error::Invariant(format!(
            "{} is not a directory",
            parent_dir
        )));
    }

    let path = parent_dir
        .try_join(entry.name())
        .map_err(|e| Error::Invariant(format!("invalid entry name: {}", e)))?;
    mgr.catalog(catalog_id)?
        .database
        .insert(&PathHash::of(&path), &parent_hash, entry)?;
    mgr.catalog_mut(catalog_id)?.mark_dirty();
    Ok(())
}

/// Moves every row strictly below `dir` from one catalog's store to
/// another's. Row keys are hashes of full repository paths, so the keys
/// survive the move unchanged. Symlink targets are relocated raw.
fn move_subtree(
    mgr: &mut CatalogManager,
    from: CatalogId,
    to: CatalogId,
    dir: &RepoPath,
) -> Result<(), Error> {
    let dir_hash = PathHash::of(dir);
    let owner = mgr.catalog(from)?.owner;
    let rows = mgr.catalog(from)?.database.listing(&dir_hash, owner, true)?;

    for row in rows {
        let path = dir
            .try_join(row.entry.name())
            .map_err(|e| Error::Invariant(format!("malformed name in catalog: {}", e)))?;
        let path_hash = PathHash::of(&path);
        mgr.catalog(to)?
            .database
            .insert(&path_hash, &dir_hash, &row.entry)?;
        if row.entry.is_directory() {
            move_subtree(mgr, from, to, &path)?;
        }
        mgr.catalog(from)?.database.unlink(&path_hash)?;
    }
    Ok(())
}

/// Moves the `nested_catalogs` registrations strictly below
/// `mountpoint` from one catalog to another.
fn relocate_nested_references(
    mgr: &mut CatalogManager,
    from: CatalogId,
    to: CatalogId,
    mountpoint: &RepoPath,
) -> Result<(), Error> {
    let nested = mgr.catalog(from)?.database.nested_listing()?;
    for (path, hash) in nested {
        if mountpoint.is_strict_prefix_of(&path) {
            mgr.catalog(to)?.database.nested_upsert(&path, &hash)?;
            mgr.catalog(from)?.database.nested_delete(&path)?;
        }
    }
    Ok(())
}

/// Re-hangs already mounted catalogs below `mountpoint` from the old
/// parent onto the new child.
fn reparent_mounted_children(
    mgr: &mut CatalogManager,
    parent_id: CatalogId,
    child_id: CatalogId,
    mountpoint: &RepoPath,
) -> Result<(), Error> {
    let candidates = mgr.catalog(parent_id)?.children.clone();
    for candidate in candidates {
        if candidate == child_id {
            continue;
        }
        let moves = mountpoint.is_strict_prefix_of(&mgr.catalog(candidate)?.root_prefix);
        if moves {
            mgr.catalog_mut(parent_id)?.children.retain(|c| *c != candidate);
            mgr.catalog_mut(child_id)?.children.push(candidate);
            mgr.catalog_mut(candidate)?.parent = Some(child_id);
        }
    }
    Ok(())
}

/// Post-order walk of the mount tree collecting the dirty closure: a
/// catalog is visited iff it is dirty itself or any descendant is.
fn collect_dirty(
    mgr: &CatalogManager,
    id: CatalogId,
    order: &mut Vec<CatalogId>,
) -> Result<bool, Error> {
    let children = mgr.catalog(id)?.children.clone();
    let mut dirty = mgr.catalog(id)?.is_dirty();
    for child in children {
        let child_dirty = collect_dirty(mgr, child, order)?;
        dirty = dirty || child_dirty;
    }
    if dirty {
        order.push(id);
    }
    Ok(dirty)
}
