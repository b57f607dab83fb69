//! End-to-end write-path scenarios: repository bootstrap, mutation
//! routing, nested-catalog splits and joins, and commit/mount cycles
//! against a directory-backed artifact store.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use crate::digests::ContentHash;
use crate::entry::DirectoryEntry;
use crate::errors::Error;
use crate::fixtures::DiskStore;
use crate::manager::{CatalogManager, ManagerConfig, UploadSpooler, WritableCatalogManager};
use crate::path::{RepoPath, RepoPathBuf};

struct Harness {
    // Owns every file the session touches.
    _temp: TempDir,
    store: DiskStore,
    repo: WritableCatalogManager,
}

fn harness() -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let store = DiskStore::new(temp.path().join("store"), temp.path().join("scratch"))
        .expect("disk store");
    let repo = WritableCatalogManager::create_repository(
        temp.path().join("txn"),
        Box::new(store.clone()),
        Box::new(store.clone()),
        ManagerConfig::default(),
    )
    .expect("create repository");
    Harness {
        _temp: temp,
        store,
        repo,
    }
}

fn reader(store: &DiskStore, root_hash: &ContentHash) -> CatalogManager {
    let mut mgr = CatalogManager::new(Box::new(store.clone()), ManagerConfig::default());
    mgr.mount_root(root_hash).expect("mount root");
    mgr
}

/// A spooler whose transport can be switched off, for exercising the
/// snapshot failure path.
struct FlakySpooler {
    inner: DiskStore,
    offline: Arc<AtomicBool>,
}

impl UploadSpooler for FlakySpooler {
    fn upload(&self, local: &Path) -> Result<ContentHash, Error> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(Error::Storage("spool transport offline".to_string()));
        }
        self.inner.upload(local)
    }
}

fn path(s: &str) -> RepoPathBuf {
    s.parse().expect("path")
}

fn dir(name: &str) -> DirectoryEntry {
    DirectoryEntry::new_directory(name.try_into().unwrap(), 0o755, 1000)
}

fn file(name: &str, size: u64) -> DirectoryEntry {
    DirectoryEntry::new_file(
        name.try_into().unwrap(),
        size,
        ContentHash::of_bytes(name.as_bytes()),
        0o644,
        1000,
    )
}

fn sorted_names(entries: &[DirectoryEntry]) -> Vec<Vec<u8>> {
    let mut names: Vec<Vec<u8>> = entries.iter().map(|e| e.name().to_vec()).collect();
    names.sort();
    names
}

#[test]
fn empty_repository_commits_to_a_single_root_row() {
    let h = harness();
    let manifest = h.repo.commit().expect("commit");
    assert_eq!(manifest.revision(), 1);
    assert!(h.store.contains(manifest.root_hash()));

    let mut read = reader(&h.store, manifest.root_hash());
    let root = read
        .lookup_path(RepoPath::ROOT)
        .unwrap()
        .expect("root entry");
    assert!(root.is_directory());
    assert_eq!(root.mode() & 0o7777, 0o755);
    assert!(read.list_directory(RepoPath::ROOT).unwrap().is_empty());
}

#[test]
fn add_then_list() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_file(&file("f", 3), &path("/a")).unwrap();

    let listing = h.repo.list_directory(&path("/a")).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name(), b"f");
    assert_eq!(listing[0].size(), 3);
    assert_eq!(listing[0].checksum(), &ContentHash::of_bytes(b"f"));

    // Mutations applied before commit are visible in the revision.
    let manifest = h.repo.commit().unwrap();
    let mut read = reader(&h.store, manifest.root_hash());
    let f = read.lookup_path(&path("/a/f")).unwrap().expect("file");
    assert_eq!(f.size(), 3);
    assert_ne!(f.inode(), 0);
    assert_eq!(
        read.lookup_path(&path("/a/missing")).unwrap().map(|_| ()),
        None
    );
}

#[test]
fn inode_lookup_round_trip() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_file(&file("f", 3), &path("/a")).unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    let f = read.lookup_path(&path("/a/f")).unwrap().unwrap();
    let by_inode = read.lookup_inode(f.inode()).unwrap().expect("by inode");
    assert_eq!(by_inode.name(), b"f");

    assert!(read.lookup_inode(0xdead_beef).unwrap().is_none());
    // Second miss is served from the negative cache.
    assert!(read.lookup_inode(0xdead_beef).unwrap().is_none());
}

#[test]
fn hardlink_group_lifecycle() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo
        .add_hardlink_group(&[file("x", 1), file("y", 1)], &path("/a"))
        .unwrap();

    let x = h.repo.lookup_path(&path("/a/x")).unwrap().expect("x");
    let y = h.repo.lookup_path(&path("/a/y")).unwrap().expect("y");
    assert_eq!(x.linkcount(), 2);
    assert_eq!(y.linkcount(), 2);
    assert_ne!(x.hardlink_group(), 0);
    assert_eq!(x.hardlink_group(), y.hardlink_group());

    h.repo.shrink_hardlink_group(&path("/a/x")).unwrap();
    assert!(h.repo.lookup_path(&path("/a/x")).unwrap().is_none());
    let survivor = h.repo.lookup_path(&path("/a/y")).unwrap().expect("y");
    assert_eq!(survivor.linkcount(), 1);
    assert_eq!(survivor.hardlink_group(), 0);
}

#[test]
fn hardlink_members_share_a_session_inode() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo
        .add_hardlink_group(&[file("x", 1), file("y", 1)], &path("/a"))
        .unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    let x = read.lookup_path(&path("/a/x")).unwrap().unwrap();
    let y = read.lookup_path(&path("/a/y")).unwrap().unwrap();
    assert_eq!(x.inode(), y.inode());
    assert_eq!(x.stat().nlink, 2);
}

#[test]
fn nested_split() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_directory(&dir("b"), &path("/a")).unwrap();
    h.repo.add_file(&file("c", 9), &path("/a/b")).unwrap();

    h.repo.create_nested_catalog(&path("/a")).unwrap();
    let manifest = h.repo.commit().expect("commit");

    let mut read = reader(&h.store, manifest.root_hash());
    let listing = read.list_directory(RepoPath::ROOT).unwrap();
    assert_eq!(listing.len(), 1);
    assert!(listing[0].is_nested_mountpoint());

    let nested = read.list_nested_catalogs(RepoPath::ROOT).unwrap();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].0, path("/a"));
    assert!(!nested[0].1.is_null());

    // Resolving below the mountpoint transparently mounts the child;
    // its root row supersedes the parent's mountpoint row.
    let a = read.lookup_path(&path("/a")).unwrap().expect("/a");
    assert!(a.is_nested_root());
    let c = read.lookup_path(&path("/a/b/c")).unwrap().expect("/a/b/c");
    assert_eq!(c.size(), 9);
}

#[test]
fn mutations_route_into_the_nested_catalog() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.create_nested_catalog(&path("/a")).unwrap();

    h.repo.add_file(&file("inner", 5), &path("/a")).unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    let inner = read.lookup_path(&path("/a/inner")).unwrap().expect("inner");
    assert_eq!(inner.size(), 5);
    // The row lives in the child catalog, not the root.
    assert_ne!(inner.catalog(), read.lookup_path(RepoPath::ROOT).unwrap().unwrap().catalog());
}

#[test]
fn nested_join_restores_the_flat_repository() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_directory(&dir("b"), &path("/a")).unwrap();
    h.repo.add_file(&file("c", 9), &path("/a/b")).unwrap();

    let flat_root = sorted_names(&h.repo.list_directory(RepoPath::ROOT).unwrap());
    let flat_a = sorted_names(&h.repo.list_directory(&path("/a")).unwrap());
    let flat_b = sorted_names(&h.repo.list_directory(&path("/a/b")).unwrap());

    h.repo.create_nested_catalog(&path("/a")).unwrap();
    h.repo.remove_nested_catalog(&path("/a")).unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    assert!(read.list_nested_catalogs(RepoPath::ROOT).unwrap().is_empty());
    assert_eq!(sorted_names(&read.list_directory(RepoPath::ROOT).unwrap()), flat_root);
    assert_eq!(sorted_names(&read.list_directory(&path("/a")).unwrap()), flat_a);
    assert_eq!(sorted_names(&read.list_directory(&path("/a/b")).unwrap()), flat_b);

    let a = read.lookup_path(&path("/a")).unwrap().expect("/a");
    assert!(!a.is_nested_mountpoint());
    assert!(!a.is_nested_root());
}

#[test]
fn join_after_snapshot_round_trip() {
    // Split, publish, then join in a later state of the same session.
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_file(&file("f", 1), &path("/a")).unwrap();
    h.repo.create_nested_catalog(&path("/a")).unwrap();
    h.repo.commit().unwrap();

    h.repo.remove_nested_catalog(&path("/a")).unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    assert!(read.list_nested_catalogs(RepoPath::ROOT).unwrap().is_empty());
    assert!(read.lookup_path(&path("/a/f")).unwrap().is_some());
}

#[test]
fn revision_increases_exactly_when_dirty() {
    let h = harness();
    let first = h.repo.commit().unwrap();
    assert_eq!(first.revision(), 1);

    // Nothing changed: same revision, same root hash.
    let second = h.repo.commit().unwrap();
    assert_eq!(second.revision(), 1);
    assert_eq!(second.root_hash(), first.root_hash());

    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    let third = h.repo.commit().unwrap();
    assert_eq!(third.revision(), 2);
    assert_ne!(third.root_hash(), first.root_hash());
}

#[test]
fn touch_updates_mtime_only() {
    let h = harness();
    h.repo.add_file(&file("f", 3), RepoPath::ROOT).unwrap();

    let touched = DirectoryEntry::new_file(
        "f".try_into().unwrap(),
        3,
        ContentHash::of_bytes(b"f"),
        0o644,
        4242,
    );
    h.repo.touch_entry(&touched, &path("/f")).unwrap();

    let f = h.repo.lookup_path(&path("/f")).unwrap().unwrap();
    assert_eq!(f.mtime(), 4242);
    assert_eq!(f.size(), 3);

    match h.repo.touch_entry(&touched, &path("/missing")) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn removal_restores_previous_row_set() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    let before = sorted_names(&h.repo.list_directory(&path("/a")).unwrap());

    h.repo.add_file(&file("f", 1), &path("/a")).unwrap();
    h.repo.remove_file(&path("/a/f")).unwrap();
    assert_eq!(sorted_names(&h.repo.list_directory(&path("/a")).unwrap()), before);

    h.repo.remove_directory(&path("/a")).unwrap();
    assert!(h.repo.list_directory(RepoPath::ROOT).unwrap().is_empty());
}

#[test]
fn mutation_errors() {
    let h = harness();

    match h.repo.add_file(&file("f", 1), &path("/nope")) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }

    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_file(&file("f", 1), &path("/a")).unwrap();
    match h.repo.add_file(&file("f", 1), &path("/a")) {
        Err(Error::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
    }

    match h.repo.remove_directory(&path("/a")) {
        Err(Error::NotEmpty(_)) => {}
        other => panic!("expected NotEmpty, got {:?}", other.map(|_| ())),
    }

    match h.repo.remove_file(&path("/a/missing")) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }

    h.repo.create_nested_catalog(&path("/a")).unwrap();
    match h.repo.create_nested_catalog(&path("/a")) {
        Err(Error::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
    }

    match h.repo.remove_nested_catalog(&path("/a/f")) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn precalculate_listings_is_idempotent() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.precalculate_listings().unwrap();
    h.repo.precalculate_listings().unwrap();
    h.repo.commit().unwrap();
}

#[test]
fn deep_nested_split_reparents_existing_children() {
    // Splitting at /a while /a/b is already a nested catalog moves the
    // /a/b registration and mount below the new /a catalog.
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo.add_directory(&dir("b"), &path("/a")).unwrap();
    h.repo.add_file(&file("f", 2), &path("/a/b")).unwrap();

    h.repo.create_nested_catalog(&path("/a/b")).unwrap();
    h.repo.create_nested_catalog(&path("/a")).unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    // The root registers only /a; /a registers /a/b.
    let top = read.list_nested_catalogs(RepoPath::ROOT).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].0, path("/a"));
    let mid = read.list_nested_catalogs(&path("/a")).unwrap();
    assert_eq!(mid.len(), 1);
    assert_eq!(mid[0].0, path("/a/b"));

    let f = read.lookup_path(&path("/a/b/f")).unwrap().expect("f");
    assert_eq!(f.size(), 2);
}

#[test]
fn lookup_inode_on_hardlink_member_aliases() {
    let h = harness();
    h.repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    h.repo
        .add_hardlink_group(&[file("x", 1), file("y", 1)], &path("/a"))
        .unwrap();
    let manifest = h.repo.commit().unwrap();

    let mut read = reader(&h.store, manifest.root_hash());
    let x = read.lookup_path(&path("/a/x")).unwrap().unwrap();
    let canonical = x.inode();
    let y = read.lookup_path(&path("/a/y")).unwrap().unwrap();
    assert_eq!(y.inode(), canonical);

    // Probe the catalog's whole inode range, which covers the natural
    // offset+row_id inode of both group members. Whatever resolves must
    // report exactly the queried inode; the non-canonical member alias
    // must not resolve at all.
    let root_id = read.root_id().unwrap();
    let range = read.catalog(root_id).unwrap().inode_range;
    let mut group_hits = 0;
    for ino in range.offset + 1..=range.offset + range.size {
        if let Some(entry) = read.lookup_inode(ino).unwrap() {
            assert_eq!(entry.inode(), ino);
            if entry.hardlink_group() != 0 {
                group_hits += 1;
                assert_eq!(ino, canonical);
            }
        }
    }
    assert_eq!(group_hits, 1);

    let by_inode = read.lookup_inode(canonical).unwrap().expect("canonical");
    assert_eq!(by_inode.inode(), canonical);
    assert_eq!(by_inode.linkcount(), 2);
}

#[test]
fn failed_upload_aborts_commit_without_manifest() {
    let temp = TempDir::new().unwrap();
    let store = DiskStore::new(temp.path().join("store"), temp.path().join("scratch")).unwrap();
    let offline = Arc::new(AtomicBool::new(false));
    let spooler = FlakySpooler {
        inner: store.clone(),
        offline: offline.clone(),
    };
    let repo = WritableCatalogManager::create_repository(
        temp.path().join("txn"),
        Box::new(store.clone()),
        Box::new(spooler),
        ManagerConfig::default(),
    )
    .unwrap();

    repo.add_directory(&dir("a"), RepoPath::ROOT).unwrap();
    offline.store(true, Ordering::Relaxed);
    match repo.commit() {
        Err(Error::Storage(_)) => {}
        other => panic!("expected Storage error, got {:?}", other.map(|_| ())),
    }
    // Nothing was published for the failed revision.
    assert_eq!(
        std::fs::read_dir(temp.path().join("store")).unwrap().count(),
        0
    );

    // The session survives: the catalog fell back to dirty and stays
    // mutable.
    repo.add_file(&file("f", 1), &path("/a")).unwrap();
    assert_eq!(repo.list_directory(&path("/a")).unwrap().len(), 1);

    offline.store(false, Ordering::Relaxed);
    let manifest = repo.commit().expect("commit after transport recovery");
    let mut read = reader(&store, manifest.root_hash());
    assert!(read.lookup_path(&path("/a/f")).unwrap().is_some());
}
