//! The allocator contract that [`crate::node::Node`] and
//! [`crate::btree::BpTreeColumn`] are written against.
//!
//! [`crate::alloc::SlabAlloc`] is the only production implementation; tests
//! use a plain in-memory implementation so node/btree logic can be exercised
//! without a backing file.

use std::sync::Arc;

use crate::error::Result;
use crate::ref_::Ref;

/// Translates refs to bytes and hands out fresh refs for new or grown
/// arrays. Every `Ref` an `Allocator` returns is 8-byte aligned.
pub trait Allocator {
    /// Returns the bytes stored at `r`, at least as long as the node at that
    /// ref actually occupies (header-declared size). Callers read the
    /// 8-byte header first to know how much of the slice is theirs.
    fn translate(&self, r: Ref) -> &[u8];

    /// Allocates a fresh, zeroed region of at least `size` bytes (rounded up
    /// to 8) and returns its ref.
    fn alloc(&mut self, size: usize) -> Result<Ref>;

    /// Writes `bytes` into the region at `r`. `bytes.len()` must not exceed
    /// the size the ref was allocated with.
    fn write_at(&mut self, r: Ref, bytes: &[u8]);

    /// Releases the region at `r` of `size` bytes back to the allocator.
    /// The region may be reused by a later `alloc` once no reader depending
    /// on the current version still needs it (see
    /// [`crate::alloc::SlabAlloc`]'s versioned freelist).
    fn free(&mut self, r: Ref, size: usize);

    /// True if `r` falls in the mutable (slab) region and may be rewritten
    /// in place; false if it lies in the immutable region (the file, or an
    /// already-committed prior version) and must be copy-on-written before
    /// any mutation. See `spec.md` §4.1 "Copy-on-write".
    fn is_mutable(&self, r: Ref) -> bool;
}

/// A simple bump/freelist-reusing in-memory allocator used by node and
/// B+-tree unit tests that don't need file persistence.
#[derive(Default)]
pub struct MemAllocator {
    arena: Vec<u8>,
}

impl MemAllocator {
    pub fn new() -> Self {
        Self { arena: vec![0u8; 8] } // ref 0 is reserved/null
    }
}

impl Allocator for MemAllocator {
    fn translate(&self, r: Ref) -> &[u8] {
        &self.arena[r.0 as usize..]
    }

    fn alloc(&mut self, size: usize) -> Result<Ref> {
        let size = (size + 7) & !7;
        let pos = self.arena.len();
        self.arena.resize(pos + size, 0);
        Ok(Ref(pos as u64))
    }

    fn write_at(&mut self, r: Ref, bytes: &[u8]) {
        let pos = r.0 as usize;
        self.arena[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    fn free(&mut self, _r: Ref, _size: usize) {
        // MemAllocator never reclaims; fine for short-lived unit tests.
    }

    fn is_mutable(&self, _r: Ref) -> bool {
        // There is no immutable/file region in the test-only allocator:
        // everything it hands out is freshly allocated arena memory.
        true
    }
}

/// A read-only view over a pinned snapshot's byte image, used by
/// [`crate::file::ReadTransaction`]. Every mutating method is unreachable:
/// a reader never allocates, writes, or frees.
pub struct ReadOnlyAllocator<'a> {
    image: &'a [u8],
}

impl<'a> ReadOnlyAllocator<'a> {
    pub fn new(image: &'a [u8]) -> ReadOnlyAllocator<'a> {
        ReadOnlyAllocator { image }
    }
}

impl<'a> Allocator for ReadOnlyAllocator<'a> {
    fn translate(&self, r: Ref) -> &[u8] {
        &self.image[r.0 as usize..]
    }

    fn alloc(&mut self, _size: usize) -> Result<Ref> {
        unreachable!("ReadOnlyAllocator never allocates")
    }

    fn write_at(&mut self, _r: Ref, _bytes: &[u8]) {
        unreachable!("ReadOnlyAllocator never writes")
    }

    fn free(&mut self, _r: Ref, _size: usize) {
        unreachable!("ReadOnlyAllocator never frees")
    }

    fn is_mutable(&self, _r: Ref) -> bool {
        false
    }
}

/// A read-only view over a whole-file byte snapshot shared (via `Arc`, not
/// copied) across every [`crate::file::ReadTransaction`] pinned to the same
/// version. Cheap to clone: a reader just bumps the refcount on the bytes the
/// writer already committed, never the file itself.
#[derive(Clone)]
pub struct SnapshotAllocator {
    image: Arc<[u8]>,
}

impl SnapshotAllocator {
    pub fn new(image: Arc<[u8]>) -> SnapshotAllocator {
        SnapshotAllocator { image }
    }
}

impl Allocator for SnapshotAllocator {
    fn translate(&self, r: Ref) -> &[u8] {
        &self.image[r.0 as usize..]
    }

    fn alloc(&mut self, _size: usize) -> Result<Ref> {
        unreachable!("SnapshotAllocator never allocates")
    }

    fn write_at(&mut self, _r: Ref, _bytes: &[u8]) {
        unreachable!("SnapshotAllocator never writes")
    }

    fn free(&mut self, _r: Ref, _size: usize) {
        unreachable!("SnapshotAllocator never frees")
    }

    fn is_mutable(&self, _r: Ref) -> bool {
        false
    }
}
