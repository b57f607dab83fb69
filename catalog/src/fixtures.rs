//! Shared fixtures: a directory-backed artifact store for tests and
//! local experimentation, plus a few well-known digests.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::digests::ContentHash;
use crate::errors::Error;
use crate::manager::{CatalogFetch, UploadSpooler};
use crate::path::RepoPath;

lazy_static! {
    pub static ref DUMMY_HASH: ContentHash = ContentHash::of_bytes(b"dummy");
    pub static ref EMPTY_HASH: ContentHash = ContentHash::of_bytes(b"");
}

/// A content-addressed artifact store over a local directory. Uploads
/// hash the file and copy it into the store; fetches hand out private
/// writable copies in a scratch directory, the way a real fetcher
/// downloads and decompresses into temporary storage.
#[derive(Clone)]
pub struct DiskStore {
    store_dir: PathBuf,
    scratch_dir: PathBuf,
    counter: Arc<AtomicU64>,
}

impl DiskStore {
    pub fn new(store_dir: impl AsRef<Path>, scratch_dir: impl AsRef<Path>) -> Result<Self, Error> {
        let store_dir = store_dir.as_ref().to_owned();
        let scratch_dir = scratch_dir.as_ref().to_owned();
        fs::create_dir_all(&store_dir)?;
        fs::create_dir_all(&scratch_dir)?;
        Ok(Self {
            store_dir,
            scratch_dir,
            counter: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.store_dir.join(hash.to_hex()).exists()
    }
}

impl UploadSpooler for DiskStore {
    fn upload(&self, local: &Path) -> Result<ContentHash, Error> {
        let bytes = fs::read(local)?;
        let hash = ContentHash::of_bytes(&bytes);
        fs::write(self.store_dir.join(hash.to_hex()), &bytes)?;
        Ok(hash)
    }
}

impl CatalogFetch for DiskStore {
    fn fetch(&self, mountpoint: &RepoPath, hash: &ContentHash) -> Result<PathBuf, Error> {
        let source = self.store_dir.join(hash.to_hex());
        if !source.exists() {
            return Err(Error::Storage(format!(
                "no artifact {} for mountpoint '{}'",
                hash, mountpoint
            )));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let dest = self.scratch_dir.join(format!("fetched-{}.catalog", n));
        fs::copy(&source, &dest)?;
        Ok(dest)
    }
}
