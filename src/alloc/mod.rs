//! `SlabAlloc`: the versioned, copy-on-write allocator every [`crate::node::Node`]
//! and [`crate::btree::BpTreeColumn`] is written against, plus the mmap
//! window machinery [`crate::group_writer::GroupWriter`] uses to flush a
//! commit to disk.
//!
//! Allocation never overwrites bytes a concurrent reader might still be
//! looking at: freeing a region only records it as a `(pos, size,
//! released_at_version)` triple in the freelist, and a region only becomes
//! eligible for reuse once every reader that could have seen the version it
//! was released at has advanced past it (tracked by the caller via
//! [`SlabAlloc::set_oldest_reachable_version`]). This is what lets readers
//! run lock-free against a concurrently-committing writer.

pub mod allocator;
pub mod mmap;

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ref_::Ref;

pub use allocator::{Allocator, MemAllocator, ReadOnlyAllocator, SnapshotAllocator};

/// A free (reusable) byte range, tagged with the version it became free at.
/// A range only becomes reusable once [`SlabAlloc::oldest_reachable_version`]
/// has advanced past `released_at_version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeEntry {
    pub pos: u64,
    pub size: u64,
    pub released_at_version: u64,
}

/// The versioned slab allocator.
///
/// `image` holds every byte the allocator currently knows about, addressed
/// by `Ref` (== byte offset). New allocations either reuse a covered
/// freelist entry (best fit: an exact match, or the smallest entry at least
/// twice the requested size, so large future requests aren't starved) or
/// extend `image`.
pub struct SlabAlloc {
    image: Vec<u8>,
    free: Vec<FreeEntry>,
    current_version: u64,
    oldest_reachable_version: u64,
    /// The logical address at which the current write transaction began.
    /// Refs below `baseline` were reachable before this transaction started
    /// and are therefore immutable (owned by the file, or by an
    /// already-committed snapshot); refs at or above it were allocated
    /// during this transaction and may be mutated in place. Reset to the
    /// current logical size by [`SlabAlloc::begin_write`].
    baseline: u64,
    /// Lowest byte position touched by `write_at`/`alloc`/`free` since the
    /// last call to `begin_write`. `GroupCommitter` only needs to flush
    /// `[dirty_floor, logical_size)` to disk — everything below is
    /// unchanged from the already-durable previous snapshot.
    dirty_floor: Option<u64>,
    /// When set by [`crate::group_writer::GroupWriter`] during a compacting
    /// commit, `alloc` prefers reusable free entries wholly below this
    /// position over any other candidate, so that live data currently above
    /// it migrates downward and the tail can be evacuated by
    /// [`SlabAlloc::try_shrink_to`].
    evacuation_limit: Option<u64>,
}

impl SlabAlloc {
    /// A fresh, empty allocator starting at version 0. Byte 0 is reserved
    /// (it is the null ref), so the image starts with an 8-byte pad.
    pub fn new() -> SlabAlloc {
        SlabAlloc {
            image: vec![0u8; 8],
            free: Vec::new(),
            current_version: 0,
            oldest_reachable_version: 0,
            baseline: 8,
            dirty_floor: None,
            evacuation_limit: None,
        }
    }

    /// Wraps an existing byte image read back from a file (used when
    /// opening an existing database). Everything in `image` is immutable
    /// file content until the next [`SlabAlloc::begin_write`].
    pub fn from_image(image: Vec<u8>, current_version: u64) -> SlabAlloc {
        let baseline = image.len() as u64;
        SlabAlloc {
            image,
            free: Vec::new(),
            current_version,
            oldest_reachable_version: current_version,
            baseline,
            dirty_floor: None,
            evacuation_limit: None,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn logical_size(&self) -> u64 {
        self.image.len() as u64
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Marks every currently-reachable ref as immutable and opens a new
    /// mutable region above the current logical size. Must be called
    /// exactly once before the first mutation of a write transaction.
    pub fn begin_write(&mut self) {
        self.baseline = self.image.len() as u64;
        self.dirty_floor = None;
    }

    /// The lowest file position dirtied since `begin_write`, if any.
    pub fn dirty_floor(&self) -> Option<u64> {
        self.dirty_floor
    }

    fn mark_dirty(&mut self, pos: u64) {
        self.dirty_floor = Some(self.dirty_floor.map_or(pos, |f| f.min(pos)));
    }

    /// Called once a commit completes: every region freed before this
    /// version is now safe to reuse once no reader predates it either.
    pub fn bump_version(&mut self) -> u64 {
        self.current_version += 1;
        self.current_version
    }

    /// Removes and returns every freelist entry, for `GroupWriter` to
    /// serialize. Callers must put the (possibly modified) entries back via
    /// [`SlabAlloc::restore_free_entries`] before further allocation.
    pub fn take_free_entries(&mut self) -> Vec<FreeEntry> {
        std::mem::take(&mut self.free)
    }

    /// Restores a freelist previously removed with
    /// [`SlabAlloc::take_free_entries`].
    pub fn restore_free_entries(&mut self, free: Vec<FreeEntry>) {
        self.free = free;
    }

    /// The oldest version any live reader might still be observing.
    /// Regions released at or after this version must not be reused yet.
    pub fn set_oldest_reachable_version(&mut self, v: u64) {
        self.oldest_reachable_version = v;
    }

    pub fn oldest_reachable_version(&self) -> u64 {
        self.oldest_reachable_version
    }

    /// Total bytes sitting in the freelist, reusable or not.
    pub fn free_space(&self) -> u64 {
        self.free.iter().map(|e| e.size).sum()
    }

    /// Used bytes: logical size minus everything in the freelist.
    pub fn used_space(&self) -> u64 {
        self.logical_size() - self.free_space()
    }

    /// Compaction heuristic: evacuate once free space exceeds twice used
    /// space, and the file has grown past the point where compacting a
    /// tiny file would just be churn.
    pub fn should_compact(&self) -> bool {
        const MIN_LOGICAL_SIZE_FOR_COMPACTION: u64 = 0x10_0000; // 1 MiB
        self.logical_size() >= MIN_LOGICAL_SIZE_FOR_COMPACTION
            && self.free_space() > 2 * self.used_space()
    }

    /// Arms (or disarms, with `None`) the evacuation preference `alloc`
    /// consults in [`SlabAlloc::find_reusable`].
    pub fn set_evacuation_limit(&mut self, limit: Option<u64>) {
        self.evacuation_limit = limit;
    }

    pub fn evacuation_limit(&self) -> Option<u64> {
        self.evacuation_limit
    }

    /// Evacuates the tail: if every byte at or above `limit` is covered by
    /// a reusable freelist entry (i.e. nothing live still lives up there),
    /// drops those entries and truncates the image to `limit`, returning
    /// the number of bytes reclaimed. Returns 0 ("give up compaction") if
    /// any gap above `limit` isn't accounted for by the freelist — meaning
    /// some live array still has to be evacuated first, which this pass
    /// didn't manage to route below the limit via [`SlabAlloc::alloc`]'s
    /// evacuation preference.
    pub fn try_shrink_to(&mut self, limit: u64) -> u64 {
        if limit >= self.logical_size() {
            return 0;
        }
        let mut above: Vec<(u64, u64)> = self
            .free
            .iter()
            .filter(|e| e.pos >= limit)
            .map(|e| (e.pos, e.size))
            .collect();
        above.sort();
        let mut expect = limit;
        for &(pos, size) in &above {
            if pos != expect {
                return 0;
            }
            expect += size;
        }
        if expect != self.logical_size() {
            return 0;
        }
        let reclaimed = self.logical_size() - limit;
        self.image.truncate(limit as usize);
        self.free.retain(|e| e.pos < limit);
        reclaimed
    }

    /// Walks the freelist lowering `released_at_version` wherever an
    /// earlier, still-live version's freelist already covered the same
    /// range — the "backdating" pass `GroupWriter::write_group` runs before
    /// recomputing which entries are reusable, so that ranges freed in a
    /// since-superseded snapshot don't each pin their own version forever.
    ///
    /// `history` holds prior freelist snapshots, oldest first, each paired
    /// with the version it was captured at.
    pub fn backdate(&mut self, history: &[(u64, Vec<FreeEntry>)]) {
        for entry in &mut self.free {
            let mut v = entry.released_at_version;
            for (hist_version, hist_free) in history.iter().rev() {
                if *hist_version >= v {
                    continue;
                }
                let covered = hist_free
                    .iter()
                    .any(|h| h.pos <= entry.pos && entry.pos + entry.size <= h.pos + h.size);
                if covered {
                    v = *hist_version;
                } else {
                    break;
                }
            }
            entry.released_at_version = v;
        }
    }

    fn find_reusable(&self, size: u64) -> Option<usize> {
        if let Some(limit) = self.evacuation_limit {
            if let Some(ix) = self.best_fit(size, |e| e.pos + e.size <= limit) {
                return Some(ix);
            }
        }
        self.best_fit(size, |_| true)
    }

    fn best_fit(&self, size: u64, pred: impl Fn(&FreeEntry) -> bool) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, e) in self.free.iter().enumerate() {
            if e.released_at_version >= self.oldest_reachable_version {
                continue; // still possibly visible to a live reader
            }
            if !pred(e) {
                continue;
            }
            if e.size == size {
                return Some(i);
            }
            if e.size >= 2 * size {
                match best {
                    Some((_, best_size)) if best_size <= e.size => {}
                    _ => best = Some((i, e.size)),
                }
            }
        }
        best.map(|(i, _)| i)
    }

    fn extend(&mut self, size: u64) -> Ref {
        let pos = self.image.len() as u64;
        self.image.resize(self.image.len() + size as usize, 0);
        Ref(pos)
    }
}

impl Default for SlabAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for SlabAlloc {
    fn translate(&self, r: Ref) -> &[u8] {
        &self.image[r.0 as usize..]
    }

    fn alloc(&mut self, size: usize) -> Result<Ref> {
        let size = ((size + 7) & !7) as u64;
        if let Some(ix) = self.find_reusable(size) {
            let entry = self.free.remove(ix);
            if entry.size > size {
                // Split: return the tail to the freelist immediately reusable
                // (it was never handed out, so it carries no version tag).
                self.free.push(FreeEntry {
                    pos: entry.pos + size,
                    size: entry.size - size,
                    released_at_version: 0,
                });
            }
            return Ok(Ref(entry.pos));
        }
        const MAX_32BIT_FILE_SIZE: u64 = 3 * (1 << 30);
        let prospective = self.image.len() as u64 + size;
        if cfg!(target_pointer_width = "32") && prospective > MAX_32BIT_FILE_SIZE {
            return Err(Error::MaximumFileSizeExceeded { attempted: prospective });
        }
        Ok(self.extend(size))
    }

    fn write_at(&mut self, r: Ref, bytes: &[u8]) {
        let pos = r.0 as usize;
        if pos + bytes.len() > self.image.len() {
            self.image.resize(pos + bytes.len(), 0);
        }
        self.image[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.mark_dirty(r.0);
    }

    fn free(&mut self, r: Ref, size: usize) {
        self.free.push(FreeEntry {
            pos: r.0,
            size: ((size + 7) & !7) as u64,
            released_at_version: self.current_version,
        });
    }

    fn is_mutable(&self, r: Ref) -> bool {
        r.0 >= self.baseline
    }
}

/// Coalesces adjacent freelist entries sharing the same `released_at_version`
/// into one, keeping the freelist compact. `GroupWriter::recreate_freelist`
/// runs this after backdating.
pub fn coalesce(free: &mut Vec<FreeEntry>) {
    free.sort_by_key(|e| e.pos);
    let mut out: Vec<FreeEntry> = Vec::with_capacity(free.len());
    for e in free.drain(..) {
        if let Some(last) = out.last_mut() {
            if last.pos + last.size == e.pos && last.released_at_version == e.released_at_version {
                last.size += e.size;
                continue;
            }
        }
        out.push(e);
    }
    *free = out;
}

/// Groups freelist entries by the mmap-aligned section they fall within, so
/// allocation/splitting never hands out a region spanning two sections
/// (`GroupWriter::split_freelist_chunk`'s invariant).
pub fn by_section(free: &[FreeEntry], section_size: u64) -> BTreeMap<u64, Vec<FreeEntry>> {
    let mut out: BTreeMap<u64, Vec<FreeEntry>> = BTreeMap::new();
    for &e in free {
        out.entry(e.pos / section_size).or_default().push(e);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_extends_when_freelist_empty() {
        let mut a = SlabAlloc::new();
        let r1 = a.alloc(16).unwrap();
        let r2 = a.alloc(32).unwrap();
        assert!(r2.get() >= r1.get() + 16);
    }

    #[test]
    fn refs_below_baseline_are_immutable_above_are_mutable() {
        let mut a = SlabAlloc::new();
        let before = a.alloc(16).unwrap();
        a.begin_write();
        let after = a.alloc(16).unwrap();
        assert!(!a.is_mutable(before), "pre-transaction ref should be immutable");
        assert!(a.is_mutable(after), "this-transaction ref should be mutable");
    }

    #[test]
    fn write_at_tracks_dirty_floor() {
        let mut a = SlabAlloc::new();
        let r1 = a.alloc(16).unwrap();
        a.begin_write();
        let r2 = a.alloc(16).unwrap();
        assert_eq!(a.dirty_floor(), None);
        a.write_at(r2, &[1, 2, 3]);
        assert_eq!(a.dirty_floor(), Some(r2.get()));
        a.write_at(r1, &[9]);
        assert_eq!(a.dirty_floor(), Some(r1.get()));
    }

    #[test]
    fn freed_space_not_reused_until_version_advances() {
        let mut a = SlabAlloc::new();
        let r = a.alloc(64).unwrap();
        a.free(r, 64);
        a.bump_version();
        // oldest_reachable_version still 0: a reader on version 0 might
        // still be looking at this region through a ref alias.
        let r2 = a.alloc(64).unwrap();
        assert_ne!(r2, r, "freed region reused while still reachable");
        a.set_oldest_reachable_version(1);
        let r3 = a.alloc(64).unwrap();
        assert_eq!(r3, r, "freed region should now be reusable");
    }

    #[test]
    fn compaction_heuristic_triggers_above_threshold() {
        let mut a = SlabAlloc::new();
        let r = a.alloc(3 * 1024 * 1024).unwrap();
        a.free(r, 3 * 1024 * 1024);
        a.bump_version();
        a.set_oldest_reachable_version(1);
        assert!(a.should_compact());
    }

    #[test]
    fn coalesce_merges_adjacent_same_version_entries() {
        let mut free = vec![
            FreeEntry { pos: 8, size: 8, released_at_version: 1 },
            FreeEntry { pos: 16, size: 8, released_at_version: 1 },
            FreeEntry { pos: 100, size: 8, released_at_version: 1 },
        ];
        coalesce(&mut free);
        assert_eq!(free.len(), 2);
        assert_eq!(free[0], FreeEntry { pos: 8, size: 16, released_at_version: 1 });
    }
}
