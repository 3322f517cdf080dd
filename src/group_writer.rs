//! `GroupWriter`/`GroupCommitter`: serializing a modified [`Group`] back to
//! disk and atomically publishing the result.
//!
//! Writing a commit is two passes over the allocator for a reason: the
//! freelist arrays themselves need space allocated for them, and that
//! allocation changes the freelist. `write_group` commits the table
//! directory once to learn its size, builds the freelist arrays from the
//! allocator's current state, then re-commits the top array with the
//! freelist refs filled in. `GroupCommitter::commit` is the only place an
//! external reader can observe — it flips a single flag bit between two
//! top-ref slots in the file header, with a flush+sync+barrier on each side
//! of the flip, so a crash at any point during a commit still leaves the
//! file pointing at either the old snapshot or the new one, never a torn
//! mix of both.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::alloc::mmap::WriteWindowMgr;
use crate::alloc::{coalesce, FreeEntry, SlabAlloc};
use crate::config::Durability;
use crate::error::Result;
use crate::group::Group;
use crate::node::Node;
use crate::ref_::Ref;

/// On-disk file header: two top-ref slots plus the single bit that selects
/// which one is authoritative.
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub top_refs: [u64; 2],
    pub flags: u8,
    pub file_format_version: u8,
}

pub const FILE_HEADER_SIZE: usize = 32;
pub const MAGIC: [u8; 8] = *b"PACKDB01";

/// Bit of `FileHeader::flags` selecting which `top_refs` slot is live.
const FLAGS_SELECT_BIT: u8 = 0x01;

impl FileHeader {
    pub fn new() -> FileHeader {
        FileHeader {
            magic: MAGIC,
            top_refs: [0, 0],
            flags: 0,
            file_format_version: 1,
        }
    }

    pub fn active_slot(&self) -> usize {
        (self.flags & FLAGS_SELECT_BIT) as usize
    }

    pub fn active_top_ref(&self) -> Ref {
        Ref(self.top_refs[self.active_slot()])
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut b = [0u8; FILE_HEADER_SIZE];
        b[0..8].copy_from_slice(&self.magic);
        b[8..16].copy_from_slice(&self.top_refs[0].to_le_bytes());
        b[16..24].copy_from_slice(&self.top_refs[1].to_le_bytes());
        b[24] = self.flags;
        b[25] = self.file_format_version;
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<FileHeader> {
        if b.len() < FILE_HEADER_SIZE || b[0..8] != MAGIC {
            return Err(crate::error::Error::InvalidDatabase(
                "file header magic mismatch".into(),
            ));
        }
        Ok(FileHeader {
            magic: MAGIC,
            top_refs: [
                u64::from_le_bytes(b[8..16].try_into().unwrap()),
                u64::from_le_bytes(b[16..24].try_into().unwrap()),
            ],
            flags: b[24],
            file_format_version: b[25],
        })
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds and commits the freelist arrays (`positions`, `sizes`,
/// `versions`) for the allocator's current free entries, each as its own
/// plain-integer [`Node`].
fn commit_freelist(alloc: &mut SlabAlloc, free: &[FreeEntry]) -> Result<(Ref, Ref, Ref)> {
    let mut positions = Node::new_leaf();
    let mut sizes = Node::new_leaf();
    let mut versions = Node::new_leaf();
    for e in free {
        positions.push(e.pos as i64);
        sizes.push(e.size as i64);
        versions.push(e.released_at_version as i64);
    }
    Ok((positions.commit(alloc)?, sizes.commit(alloc)?, versions.commit(alloc)?))
}

/// Conventional OS page size; the unit `should_compact`'s evacuation limit
/// is rounded up to, so compaction doesn't chase a handful of stray bytes.
const PAGE_SIZE: u64 = 4096;

fn round_up_to_page(n: u64) -> u64 {
    (n + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// Drives the write-transaction-to-disk pipeline described at module level.
pub struct GroupWriter<'a> {
    alloc: &'a mut SlabAlloc,
    history: Vec<(u64, Vec<FreeEntry>)>,
}

impl<'a> GroupWriter<'a> {
    pub fn new(alloc: &'a mut SlabAlloc) -> GroupWriter<'a> {
        GroupWriter { alloc, history: Vec::new() }
    }

    /// Records the freelist as of a past commit, for [`SlabAlloc::backdate`]
    /// to consult on the next write.
    pub fn record_history(&mut self, version: u64, free: Vec<FreeEntry>) {
        self.history.push((version, free));
    }

    /// Runs the full commit-to-disk pipeline against `group` and returns the
    /// new top ref. The caller (normally [`GroupCommitter::commit`]) is
    /// responsible for publishing it.
    pub fn write_group(&mut self, group: &mut Group) -> Result<Ref> {
        debug!(
            "write_group: logical_size={} free_space={}",
            self.alloc.logical_size(),
            self.alloc.free_space()
        );

        // First pass: commit everything except the freelist, to learn its
        // footprint before the freelist arrays themselves need allocating.
        let provisional_top = group.commit_top(self.alloc)?;
        let _ = provisional_top;

        if !self.history.is_empty() {
            self.alloc.backdate(&self.history);
        }

        let evacuation_limit = if self.alloc.should_compact() {
            let used = self.alloc.used_space();
            let limit = round_up_to_page(used + used / 2);
            info!(
                "compaction triggered: free={} used={} evacuation_limit={limit}",
                self.alloc.free_space(),
                used,
            );
            self.alloc.set_evacuation_limit(Some(limit));
            Some(limit)
        } else {
            None
        };

        // Collect the allocator's current freelist via its public view.
        // `SlabAlloc` only exposes aggregate sizes to callers outside this
        // module; the writer is given direct access to the entries it needs
        // through `take_free_entries`.
        let mut free = self.alloc.take_free_entries();
        coalesce(&mut free);

        let (pos_ref, size_ref, ver_ref) = commit_freelist(self.alloc, &free)?;
        self.alloc.restore_free_entries(free);

        if let Some(limit) = evacuation_limit {
            let before = self.alloc.logical_size();
            let reclaimed = self.alloc.try_shrink_to(limit);
            if reclaimed > 0 {
                info!(
                    "compaction finished: logical_size {before} -> {}",
                    self.alloc.logical_size()
                );
            } else {
                warn!("Give up compaction: live data still reaches above evacuation_limit={limit}");
            }
            self.alloc.set_evacuation_limit(None);
        }

        group.set_freelist_refs(pos_ref, size_ref, ver_ref);
        group.set_logical_size(self.alloc.logical_size());
        let new_version = self.alloc.bump_version();
        group.set_current_version(new_version);

        // Second pass: re-commit the top array now that the freelist refs
        // are known.
        let final_top = group.commit_top(self.alloc)?;
        info!("write_group: committed top_ref={:#x} version={new_version}", final_top.get());
        Ok(final_top)
    }
}

/// Durability-aware two-slot atomic commit.
pub struct GroupCommitter {
    windows: WriteWindowMgr,
    durability: Durability,
}

impl GroupCommitter {
    pub fn new(file: Arc<std::fs::File>, file_size: u64, durability: Durability) -> GroupCommitter {
        GroupCommitter {
            windows: WriteWindowMgr::new(file, file_size, crate::alloc::mmap::DEFAULT_NUM_WINDOWS),
            durability,
        }
    }

    /// Writes `bytes` at absolute file offset `file_offset` through the
    /// window cache, then flushes and/or syncs according to durability
    /// (`Unsafe` does neither, `MemOnly` flushes only, `Full` does both).
    /// Used to push a transaction's dirtied node-data range to disk ahead of
    /// the slot flip in [`GroupCommitter::commit`].
    pub fn flush_range(&mut self, file_offset: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let w = self.windows.get_window(file_offset, bytes.len() as u64)?;
        w.write_barrier();
        w.slice_mut(file_offset, bytes.len() as u64).copy_from_slice(bytes);
        if !matches!(self.durability, Durability::Unsafe) {
            w.flush()?;
        }
        if matches!(self.durability, Durability::Full) {
            w.sync()?;
        }
        Ok(())
    }

    /// Publishes `new_top_ref` as the current snapshot.
    ///
    /// 1. Read the header, compute the inactive slot and the flipped flags
    ///    byte.
    /// 2. Write `new_top_ref` into the *inactive* slot (the active one, and
    ///    hence every existing reader, is untouched).
    /// 3. Flush unless durability is [`Durability::Unsafe`], and sync on top
    ///    of that only for [`Durability::Full`]; a write barrier surrounds
    ///    the flush/sync pair on either side.
    /// 4. Write the flipped flags byte — this one-byte write is what
    ///    atomically switches readers onto the new slot.
    /// 5. Flush/sync/barrier again, under the same durability gating.
    ///
    /// A crash between steps 2 and 4 leaves the flags byte pointing at the
    /// old, still-valid slot: the new top ref was written but never made
    /// live, so the file reopens at the prior snapshot. `Unsafe` skips both
    /// the flush and the sync — `MapWindow::flush` is itself a synchronous
    /// `msync(MS_SYNC)`, so omitting it is what actually makes `Unsafe`
    /// unsafe; calling it unconditionally would make every mode crash-durable.
    pub fn commit(&mut self, header: &mut FileHeader, new_top_ref: Ref) -> Result<()> {
        let inactive = 1 - header.active_slot();
        header.top_refs[inactive] = new_top_ref.get();
        let new_flags = header.flags ^ FLAGS_SELECT_BIT;

        {
            let w = self.windows.get_window(8 + inactive as u64 * 8, 8)?;
            w.write_barrier();
            w.slice_mut(8 + inactive as u64 * 8, 8).copy_from_slice(&new_top_ref.get().to_le_bytes());
            if !matches!(self.durability, Durability::Unsafe) {
                w.flush()?;
            }
            if matches!(self.durability, Durability::Full) {
                w.sync()?;
            }
        }

        header.flags = new_flags;
        {
            let w = self.windows.get_window(24, 1)?;
            w.write_barrier();
            w.slice_mut(24, 1)[0] = new_flags;
            if !matches!(self.durability, Durability::Unsafe) {
                w.flush()?;
            }
            if matches!(self.durability, Durability::Full) {
                w.sync()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let mut h = FileHeader::new();
        h.top_refs = [8, 4096];
        h.flags = 1;
        let bytes = h.to_bytes();
        let h2 = FileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h2.top_refs, h.top_refs);
        assert_eq!(h2.flags, h.flags);
        assert_eq!(h2.active_top_ref(), Ref(4096));
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0u8; FILE_HEADER_SIZE];
        assert!(FileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn write_group_produces_a_committable_top() {
        let mut alloc = SlabAlloc::new();
        let mut group = Group::new();
        group.add_table(&mut alloc, "t", Ref(8)).unwrap();
        let mut writer = GroupWriter::new(&mut alloc);
        let top = writer.write_group(&mut group).unwrap();
        assert!(top.get() > 0);
    }
}
