//! Embedded, copy-on-write object-store storage engine: adaptive bit-packed
//! columns built out of [`node`], B+-tree columns over those in [`btree`],
//! anchored by a positional table directory ([`group`]) inside a versioned
//! slab allocator ([`alloc`]), persisted through mmap-backed commits
//! ([`group_writer`]) behind the top-level [`file::Db`] handle.
//!
//! Every mutation is copy-on-write: a write transaction never overwrites
//! bytes a concurrently running reader might still be looking at. Commits
//! are published with a two-slot atomic flip in the file header, so a crash
//! mid-commit always leaves the file pointing at either the prior snapshot
//! or the new one, never a torn mix of both.

pub mod alloc;
pub mod btree;
pub mod config;
pub mod error;
pub mod file;
pub mod group;
pub mod group_writer;
pub mod node;
pub mod ref_;

pub use config::{Config, Durability};
pub use error::{Error, Result};
pub use file::{Db, ReadTransaction, WriteTransaction};
pub use group::{Group, TableKey};
pub use ref_::Ref;
