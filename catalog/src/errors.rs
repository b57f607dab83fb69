use thiserror::Error;

/// Errors surfaced by the catalog engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A path or inode is absent from the catalog tree.
    #[error("not found: {0}")]
    NotFound(String),

    /// An insertion would violate the path-hash primary key.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory removal was attempted on a non-empty directory.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The catalog schema is newer than this implementation supports,
    /// or too old for the requested open mode.
    #[error("unsupported catalog schema {0}")]
    SchemaMismatch(String),

    /// The underlying store or a collaborator failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A structural invariant was violated. This indicates an internal
    /// bug; the session is not recoverable and the embedding process is
    /// expected to terminate with the diagnostic.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
