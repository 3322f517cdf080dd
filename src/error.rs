//! Crate-wide error type.
//!
//! Every fallible operation in the engine returns [`Result`]. Structural
//! invariants (illegal header width, misaligned write, overlapping freelist
//! entries) remain `debug_assert!`/`assert!` panics rather than `Error`
//! variants — they indicate a corrupt in-memory structure, not a condition
//! a caller can recover from.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong opening, reading, or committing a database.
#[derive(Debug, Error)]
pub enum Error {
    /// The file header magic/checksum did not match, or a slot's flag byte
    /// selected a top ref of zero on first open.
    #[error("not a valid database file: {0}")]
    InvalidDatabase(String),

    /// The allocator could not satisfy a request from the freelist or by
    /// extending the file, or extending the file would exceed the 32-bit
    /// size cap.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Extending the file would push it past the maximum size representable
    /// by the current ref encoding.
    #[error("extending file to {attempted} bytes exceeds the maximum file size")]
    MaximumFileSizeExceeded { attempted: u64 },

    /// A commit was attempted while a link column still referenced a row in
    /// a table being removed.
    #[error("table is the target of a cross-table link and cannot be removed")]
    CrossTableLinkTarget,

    /// The caller used the transaction/table API in a way the state machine
    /// forbids (e.g. writing through a stale read transaction).
    #[error("logic error: {0}")]
    LogicError(&'static str),

    /// A schema-dependent operation was attempted against a table whose
    /// column layout does not match what the caller expected.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// An element wider than 64 bits was requested of a [`crate::node::Node`].
    /// Unreachable through the public API; named rather than panicking so
    /// callers across an FFI-style boundary can still match on it.
    #[error("requested element width exceeds 64 bits")]
    WidthOverflow,

    /// The on-disk path could not be opened, read, written, mapped, or
    /// synced.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
