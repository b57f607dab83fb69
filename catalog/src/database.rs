//! The persistent side of one catalog: schema, prepared statements and
//! the marshalling between rows and [DirectoryEntry] records.
//!
//! A catalog file contains three relations. `catalog` keys every entry
//! by the MD5 of its absolute repository path, split into two 64-bit
//! column halves; a secondary index on the parent halves serves
//! directory listings. `nested_catalogs` maps mountpoint paths to the
//! content hashes of child catalogs. `properties` carries the schema
//! version, the revision counter and an optional root prefix.
use std::path::{Path, PathBuf};

use bytes::Bytes;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::digests::{ContentHash, PathHash, SHA1_LEN};
use crate::entry::{DirectoryEntry, DirentFlags, EntryName, Hardlinks, LinkTarget};
use crate::errors::Error;
use crate::path::{RepoPath, RepoPathBuf};

/// The newest schema this implementation reads and writes.
pub const LATEST_SCHEMA: f64 = 2.0;

/// Decimal schema versions are compared with a small tolerance.
const SCHEMA_EPSILON: f64 = 0.05;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Session owner ids projected onto entries at read-out. The on-disk
/// schema does not persist ownership.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OwnerIds {
    pub uid: u32,
    pub gid: u32,
}

/// One row read back from the `catalog` relation: the marshalled entry
/// plus the row identifier that session inodes are derived from.
#[derive(Clone, Debug)]
pub struct DirentRow {
    pub entry: DirectoryEntry,
    pub row_id: u64,
}

const CREATE_SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS catalog
    (md5path_1 INTEGER, md5path_2 INTEGER, parent_1 INTEGER, parent_2 INTEGER,
     inode INTEGER, hash BLOB, size INTEGER, mode INTEGER, mtime INTEGER,
     flags INTEGER, name TEXT, symlink TEXT,
     CONSTRAINT pk_catalog PRIMARY KEY (md5path_1, md5path_2));
    CREATE INDEX IF NOT EXISTS idx_catalog_parent
    ON catalog (parent_1, parent_2);
    CREATE TABLE IF NOT EXISTS properties (key TEXT, value TEXT,
     CONSTRAINT pk_properties PRIMARY KEY (key));
    CREATE TABLE IF NOT EXISTS nested_catalogs (path TEXT, sha1 TEXT,
     CONSTRAINT pk_nested_catalogs PRIMARY KEY (path));
";

// Every row read-out relies on the shared column order
// hash, inode, size, mode, mtime, flags, name, symlink, rowid.
const LOOKUP_PATH_SQL: &str = "SELECT hash, inode, size, mode, mtime, flags, name, symlink, rowid \
     FROM catalog WHERE (md5path_1 = ?1) AND (md5path_2 = ?2);";
const LOOKUP_ROWID_SQL: &str = "SELECT hash, inode, size, mode, mtime, flags, name, symlink, rowid \
     FROM catalog WHERE rowid = ?1;";
const LISTING_SQL: &str = "SELECT hash, inode, size, mode, mtime, flags, name, symlink, rowid \
     FROM catalog WHERE (parent_1 = ?1) AND (parent_2 = ?2);";
const INSERT_SQL: &str = "INSERT OR IGNORE INTO catalog \
     (md5path_1, md5path_2, parent_1, parent_2, hash, inode, size, mode, mtime, flags, name, symlink) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);";
const UPDATE_SQL: &str = "UPDATE catalog \
     SET hash = ?3, inode = ?4, size = ?5, mode = ?6, mtime = ?7, flags = ?8, \
         name = ?9, symlink = ?10 \
     WHERE (md5path_1 = ?1) AND (md5path_2 = ?2);";
const TOUCH_SQL: &str =
    "UPDATE catalog SET mtime = ?3 WHERE (md5path_1 = ?1) AND (md5path_2 = ?2);";
const UNLINK_SQL: &str = "DELETE FROM catalog WHERE (md5path_1 = ?1) AND (md5path_2 = ?2);";
const NESTED_LOOKUP_SQL: &str = "SELECT sha1 FROM nested_catalogs WHERE path = ?1;";
const NESTED_LISTING_SQL: &str = "SELECT path, sha1 FROM nested_catalogs;";
const NESTED_UPSERT_SQL: &str =
    "INSERT OR REPLACE INTO nested_catalogs (path, sha1) VALUES (?1, ?2);";
const NESTED_DELETE_SQL: &str = "DELETE FROM nested_catalogs WHERE path = ?1;";
// Adjusts the link count of the hardlink group owning the row keyed by
// the path hash; a decrement from 2 dissolves the group. The packed
// field lives in the historical `inode` column, which makes this a
// single atomic statement.
const ADJUST_LINKCOUNT_SQL: &str = "UPDATE catalog SET inode = \
     CASE (inode << 32) >> 32 WHEN 2 THEN 0 ELSE inode + 1*(?1) END \
     WHERE inode = (SELECT inode FROM catalog \
                    WHERE md5path_1 = ?2 AND md5path_2 = ?3);";
const MAX_HARDLINKS_SQL: &str = "SELECT max(inode) FROM catalog;";
const MAX_ROWID_SQL: &str = "SELECT max(rowid) FROM catalog;";
const GET_PROPERTY_SQL: &str = "SELECT value FROM properties WHERE key = ?1;";
const SET_PROPERTY_SQL: &str = "INSERT OR REPLACE INTO properties (key, value) VALUES (?1, ?2);";

/// A handle on one catalog file. Prepared statements are created once
/// per handle and reused across calls.
pub struct CatalogDatabase {
    conn: Connection,
    path: PathBuf,
    schema_version: f64,
    read_write: bool,
}

impl CatalogDatabase {
    /// Opens an existing catalog file and probes its schema version.
    /// A missing `schema` property row means schema 1.0, which is
    /// accepted read-only.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let read_write = mode == OpenMode::ReadWrite;
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | match mode {
                OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
                OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
            };

        debug!("opening catalog database");
        let conn = Connection::open_with_flags(&path, flags)?;
        conn.set_prepared_statement_cache_capacity(32);

        readahead(&path);

        let schema_version = {
            let value: Option<String> = conn
                .query_row(GET_PROPERTY_SQL, params!["schema"], |row| row.get(0))
                .optional()?;
            match value {
                Some(text) => text
                    .parse::<f64>()
                    .map_err(|_| Error::SchemaMismatch(text.clone()))?,
                None => 1.0,
            }
        };

        if schema_version > LATEST_SCHEMA + SCHEMA_EPSILON {
            return Err(Error::SchemaMismatch(format!("{:.1}", schema_version)));
        }
        if read_write && schema_version < LATEST_SCHEMA - SCHEMA_EPSILON {
            return Err(Error::SchemaMismatch(format!(
                "{:.1} is read-only compatible",
                schema_version
            )));
        }

        Ok(Self {
            conn,
            path,
            schema_version,
            read_write,
        })
    }

    /// Creates a new catalog file: schema, the single root row, the
    /// `schema` and `revision` properties and, for nested catalogs, the
    /// `root_prefix`.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), root = %root_prefix))]
    pub fn create(
        path: impl AsRef<Path>,
        root_entry: &DirectoryEntry,
        root_prefix: &RepoPath,
    ) -> Result<(), Error> {
        debug!("creating new catalog");
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        conn.execute(
            "INSERT OR IGNORE INTO properties (key, value) VALUES ('revision', '0');",
            [],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO properties (key, value) VALUES ('schema', '2.0');",
            [],
        )?;

        let path_hash = PathHash::of(root_prefix);
        let parent_hash = match root_prefix.parent() {
            Some(parent) => PathHash::of(parent),
            None => PathHash::NULL,
        };
        insert_row(&conn, &path_hash, &parent_hash, root_entry)?;

        if !root_prefix.is_root() {
            conn.execute(
                SET_PROPERTY_SQL,
                params!["root_prefix", root_prefix.as_bytes()],
            )?;
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> f64 {
        self.schema_version
    }

    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// Looks up the row keyed by `hash`. The symlink target is expanded
    /// unless `raw` read-out is requested (row relocation must preserve
    /// unexpanded targets).
    pub fn lookup_path(
        &self,
        hash: &PathHash,
        owner: OwnerIds,
        raw: bool,
    ) -> Result<Option<DirentRow>, Error> {
        let (h1, h2) = hash.to_columns();
        let mut stmt = self.conn.prepare_cached(LOOKUP_PATH_SQL)?;
        let row = stmt
            .query_row(params![h1, h2], |row| RawRow::read(row))
            .optional()?;
        row.map(|r| r.marshal(owner, self.schema_version, raw))
            .transpose()
    }

    /// Looks up the row with the given row identifier.
    pub fn lookup_row_id(&self, row_id: u64, owner: OwnerIds) -> Result<Option<DirentRow>, Error> {
        let mut stmt = self.conn.prepare_cached(LOOKUP_ROWID_SQL)?;
        let row = stmt
            .query_row(params![row_id as i64], |row| RawRow::read(row))
            .optional()?;
        row.map(|r| r.marshal(owner, self.schema_version, false))
            .transpose()
    }

    /// Lists the rows whose parent key equals `parent_hash`.
    pub fn listing(
        &self,
        parent_hash: &PathHash,
        owner: OwnerIds,
        raw: bool,
    ) -> Result<Vec<DirentRow>, Error> {
        let (p1, p2) = parent_hash.to_columns();
        let mut stmt = self.conn.prepare_cached(LISTING_SQL)?;
        let rows = stmt.query_map(params![p1, p2], |row| RawRow::read(row))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.marshal(owner, self.schema_version, raw)?);
        }
        Ok(result)
    }

    /// Inserts a row. Fails with [Error::AlreadyExists] when the
    /// path-hash primary key is taken.
    pub fn insert(
        &self,
        hash: &PathHash,
        parent_hash: &PathHash,
        entry: &DirectoryEntry,
    ) -> Result<(), Error> {
        insert_row(&self.conn, hash, parent_hash, entry)
    }

    /// Rewrites all mutable fields of the row keyed by `hash`.
    pub fn update(&self, hash: &PathHash, entry: &DirectoryEntry) -> Result<(), Error> {
        let (h1, h2) = hash.to_columns();
        let mut stmt = self.conn.prepare_cached(UPDATE_SQL)?;
        let changed = stmt.execute(params![
            h1,
            h2,
            entry.checksum().as_slice(),
            entry.hardlinks().raw() as i64,
            entry.size() as i64,
            entry.mode() as i64,
            entry.mtime(),
            entry.flags().bits() as i64,
            entry.name(),
            symlink_column(entry),
        ])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("no row for {}", hash)));
        }
        Ok(())
    }

    /// Updates the modification time of the row keyed by `hash`.
    pub fn touch(&self, hash: &PathHash, mtime: i64) -> Result<(), Error> {
        let (h1, h2) = hash.to_columns();
        let mut stmt = self.conn.prepare_cached(TOUCH_SQL)?;
        let changed = stmt.execute(params![h1, h2, mtime])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("no row for {}", hash)));
        }
        Ok(())
    }

    /// Deletes the row keyed by `hash`.
    pub fn unlink(&self, hash: &PathHash) -> Result<(), Error> {
        let (h1, h2) = hash.to_columns();
        let mut stmt = self.conn.prepare_cached(UNLINK_SQL)?;
        let changed = stmt.execute(params![h1, h2])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("no row for {}", hash)));
        }
        Ok(())
    }

    /// Adjusts the link count of the hardlink group owning the row
    /// keyed by `hash` by `delta`, atomically within the store. A
    /// decrement from 2 clears the group id on all remaining members.
    /// The caller guarantees the row belongs to a group.
    pub fn adjust_linkcount(&self, hash: &PathHash, delta: i64) -> Result<(), Error> {
        let (h1, h2) = hash.to_columns();
        let mut stmt = self.conn.prepare_cached(ADJUST_LINKCOUNT_SQL)?;
        let changed = stmt.execute(params![delta, h1, h2])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("no hardlink group for {}", hash)));
        }
        Ok(())
    }

    /// The highest hardlink group id in use in this catalog.
    pub fn max_hardlink_group(&self) -> Result<u32, Error> {
        let mut stmt = self.conn.prepare_cached(MAX_HARDLINKS_SQL)?;
        let max: Option<i64> = stmt.query_row([], |row| row.get(0))?;
        Ok(Hardlinks::from_raw(max.unwrap_or(0) as u64).group())
    }

    /// The highest row identifier in use, which bounds the catalog's
    /// inode range on mount.
    pub fn max_row_id(&self) -> Result<u64, Error> {
        let mut stmt = self.conn.prepare_cached(MAX_ROWID_SQL)?;
        let max: Option<i64> = stmt.query_row([], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// The registered child catalog hash for `mountpoint`, if any.
    /// A placeholder registration reads back as the null hash.
    pub fn nested_lookup(&self, mountpoint: &RepoPath) -> Result<Option<ContentHash>, Error> {
        let mut stmt = self.conn.prepare_cached(NESTED_LOOKUP_SQL)?;
        let hex: Option<String> = stmt
            .query_row(params![mountpoint.as_bytes()], |row| row.get(0))
            .optional()?;
        hex.map(|hex| content_hash_from_hex_column(hex.as_bytes())).transpose()
    }

    /// All registered nested catalogs of this catalog.
    pub fn nested_listing(&self) -> Result<Vec<(RepoPathBuf, ContentHash)>, Error> {
        let mut stmt = self.conn.prepare_cached(NESTED_LISTING_SQL)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (path, hex) = row?;
            let mountpoint = RepoPathBuf::parse_canonical(&path)
                .map_err(|e| Error::Invariant(format!("malformed mountpoint in catalog: {}", e)))?;
            result.push((mountpoint, content_hash_from_hex_column(hex.as_bytes())?));
        }
        Ok(result)
    }

    /// Registers or replaces the child catalog hash for `mountpoint`.
    /// The null hash is stored as the empty-text placeholder.
    pub fn nested_upsert(&self, mountpoint: &RepoPath, hash: &ContentHash) -> Result<(), Error> {
        let hex = if hash.is_null() {
            String::new()
        } else {
            hash.to_hex()
        };
        let mut stmt = self.conn.prepare_cached(NESTED_UPSERT_SQL)?;
        stmt.execute(params![mountpoint.as_bytes(), hex])?;
        Ok(())
    }

    /// Unregisters the child catalog at `mountpoint`.
    pub fn nested_delete(&self, mountpoint: &RepoPath) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(NESTED_DELETE_SQL)?;
        let changed = stmt.execute(params![mountpoint.as_bytes()])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("no nested catalog at {}", mountpoint)));
        }
        Ok(())
    }

    pub fn property(&self, key: &str) -> Result<Option<String>, Error> {
        let mut stmt = self.conn.prepare_cached(GET_PROPERTY_SQL)?;
        Ok(stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?)
    }

    fn property_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut stmt = self.conn.prepare_cached(GET_PROPERTY_SQL)?;
        Ok(stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_property(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(SET_PROPERTY_SQL)?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    /// The catalog revision, a monotonic counter bumped on snapshot.
    pub fn revision(&self) -> Result<u64, Error> {
        match self.property("revision")? {
            Some(text) => text
                .parse::<u64>()
                .map_err(|_| Error::Invariant(format!("malformed revision '{}'", text))),
            None => Ok(0),
        }
    }

    pub fn bump_revision(&self) -> Result<u64, Error> {
        let next = self.revision()? + 1;
        self.set_property("revision", &next.to_string())?;
        Ok(next)
    }

    /// The path this catalog is rooted at; empty for the repository
    /// root catalog.
    pub fn root_prefix(&self) -> Result<RepoPathBuf, Error> {
        match self.property_bytes("root_prefix")? {
            Some(text) => RepoPathBuf::parse_canonical(&text)
                .map_err(|e| Error::Invariant(format!("malformed root_prefix: {}", e))),
            None => Ok(RepoPathBuf::root()),
        }
    }

    /// Compacts the file ahead of snapshot upload.
    pub fn vacuum(&self) -> Result<(), Error> {
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// Refreshes the planner statistics backing the listing index.
    /// Idempotent; purely advisory.
    pub fn analyze(&self) -> Result<(), Error> {
        self.conn.execute_batch("ANALYZE;")?;
        Ok(())
    }
}

fn insert_row(
    conn: &Connection,
    hash: &PathHash,
    parent_hash: &PathHash,
    entry: &DirectoryEntry,
) -> Result<(), Error> {
    let (h1, h2) = hash.to_columns();
    let (p1, p2) = parent_hash.to_columns();
    let mut stmt = conn.prepare_cached(INSERT_SQL)?;
    let changed = stmt.execute(params![
        h1,
        h2,
        p1,
        p2,
        entry.checksum().as_slice(),
        entry.hardlinks().raw() as i64,
        entry.size() as i64,
        entry.mode() as i64,
        entry.mtime(),
        entry.flags().bits() as i64,
        entry.name(),
        symlink_column(entry),
    ])?;
    if changed == 0 {
        return Err(Error::AlreadyExists(format!("row for {}", hash)));
    }
    Ok(())
}

fn symlink_column(entry: &DirectoryEntry) -> Vec<u8> {
    entry
        .symlink()
        .map(|t| t.as_bytes().to_vec())
        .unwrap_or_default()
}

fn content_hash_from_hex_column(hex: &[u8]) -> Result<ContentHash, Error> {
    if hex.is_empty() {
        return Ok(ContentHash::NULL);
    }
    let hex = std::str::from_utf8(hex)
        .map_err(|_| Error::Invariant("malformed hash in nested_catalogs".to_string()))?;
    ContentHash::from_hex(hex)
        .map_err(|e| Error::Invariant(format!("malformed hash in nested_catalogs: {}", e)))
}

/// The column values of one row, read before marshalling so that
/// sqlite-level errors stay separable from semantic ones.
struct RawRow {
    hash: Vec<u8>,
    hardlinks: i64,
    size: i64,
    mode: i64,
    mtime: i64,
    flags: i64,
    name: Vec<u8>,
    symlink: Vec<u8>,
    row_id: i64,
}

impl RawRow {
    fn read(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            hash: row.get(0)?,
            hardlinks: row.get(1)?,
            size: row.get(2)?,
            mode: row.get(3)?,
            mtime: row.get(4)?,
            flags: row.get(5)?,
            name: row.get(6)?,
            symlink: row.get(7)?,
            row_id: row.get(8)?,
        })
    }

    fn marshal(self, owner: OwnerIds, schema_version: f64, raw: bool) -> Result<DirentRow, Error> {
        let name = EntryName::try_from(Bytes::from(self.name))
            .map_err(|e| Error::Invariant(format!("malformed name in catalog: {}", e)))?;

        let checksum = if self.hash.is_empty() {
            ContentHash::NULL
        } else if self.hash.len() == SHA1_LEN {
            ContentHash::try_from(self.hash.as_slice())
                .map_err(|e| Error::Invariant(format!("malformed content hash: {}", e)))?
        } else {
            return Err(Error::Invariant(format!(
                "content hash of width {} in catalog",
                self.hash.len()
            )));
        };

        let hardlinks = if schema_version < LATEST_SCHEMA - SCHEMA_EPSILON {
            // Schema 1.0 predates hardlink groups.
            Hardlinks::default()
        } else {
            Hardlinks::from_raw(self.hardlinks as u64)
        };

        let symlink = if self.symlink.is_empty() {
            None
        } else {
            let target = LinkTarget::try_from(self.symlink.as_slice())
                .map_err(|e| Error::Invariant(format!("malformed symlink in catalog: {}", e)))?;
            Some(if raw { target } else { target.expand() })
        };

        let flags = DirentFlags::from_bits_truncate(self.flags as u32);

        let entry = DirectoryEntry {
            name,
            symlink,
            mode: self.mode as u32,
            uid: owner.uid,
            gid: owner.gid,
            size: self.size as u64,
            mtime: self.mtime,
            checksum,
            inode: crate::entry::INVALID_INODE,
            parent_inode: crate::entry::INVALID_INODE,
            hardlinks,
            is_nested_root: flags.contains(DirentFlags::DIR_NESTED_ROOT),
            is_nested_mountpoint: flags.contains(DirentFlags::DIR_NESTED_MOUNTPOINT),
            catalog: None,
        };

        Ok(DirentRow {
            entry,
            row_id: self.row_id as u64,
        })
    }
}

/// Hints the kernel to read the catalog file ahead into the page cache.
fn readahead(path: &Path) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        match std::fs::File::open(path) {
            Ok(file) => {
                let ret = unsafe {
                    libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_WILLNEED)
                };
                if ret != 0 {
                    warn!(path = %path.display(), ret, "read-ahead hint failed");
                }
            }
            Err(e) => warn!(path = %path.display(), err = %e, "cannot open catalog for read-ahead"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = path;
}
