//! `Group`/`Top`: the fixed positional array that anchors a whole database
//! snapshot, and the table directory it holds.
//!
//! The top array is a ref-array with a fixed slot layout (see
//! [`TopSlot`]); everything reachable in a snapshot hangs off one of these
//! ten slots. Table identity survives table removal and reuse of a freed
//! slot via [`TableKey`]: a key packs a generation tag with a slot index, so
//! a stale key from before a `remove_table` can be detected and rejected
//! even if its slot has since been reused by an unrelated table.

use crate::alloc::{Allocator, FreeEntry};
use crate::error::{Error, Result};
use crate::node::string_node::StringNode;
use crate::node::Node;
use crate::ref_::{Ref, RefOrTagged};

/// Fixed slots of the top array. Unused trailing slots in an older-format
/// file are tolerated on open (the top array may be shorter than
/// [`TopSlot::COUNT`]); they're filled in lazily on first use.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopSlot {
    TableNames = 0,
    Tables = 1,
    TableKeys = 2,
    FreePositions = 3,
    FreeSizes = 4,
    FreeVersions = 5,
    LogicalSize = 6,
    CurrentVersion = 7,
    HistoryRef = 8,
    EvacuationPoint = 9,
}

impl TopSlot {
    pub const COUNT: usize = 10;
}

/// A stable handle to a table: a generation tag packed with a slot index in
/// the `Tables`/`TableNames`/`TableKeys` arrays. `(tag << 16) | index`,
/// matching the packed-integer table identity scheme the table directory
/// uses instead of raw positional indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TableKey(u32);

impl TableKey {
    const TAG_SHIFT: u32 = 16;
    const INDEX_MASK: u32 = 0xFFFF;

    fn new(tag: u16, index: u16) -> TableKey {
        TableKey(((tag as u32) << Self::TAG_SHIFT) | index as u32)
    }

    pub fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    fn tag(self) -> u16 {
        (self.0 >> Self::TAG_SHIFT) as u16
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> TableKey {
        TableKey(raw)
    }
}

/// A tombstoned slot's tag is never reused verbatim: removing a table bumps
/// its tag so any `TableKey` still held by a caller compares unequal to the
/// new occupant's key even though the slot index matches.
const TOMBSTONE_TAG_BUMP: u16 = 1;

/// One database snapshot: the set of tables reachable from a top array.
#[derive(Clone)]
pub struct Group {
    names: StringNode,
    tables: Node,
    /// Per-slot `(tag, in_use)` — `tombstone` slots keep their freed tag so
    /// the next table placed there gets a strictly greater one.
    key_tags: Vec<u16>,
    free_slots: Vec<usize>,
    logical_size: u64,
    current_version: u64,
    history_ref: Option<Ref>,
    evacuation_point: Option<Ref>,
    /// Refs of the three freelist arrays, filled in by
    /// [`crate::group_writer::GroupWriter::write_group`] after
    /// [`Group::commit_top`]'s first pass.
    free_positions_ref: Option<Ref>,
    free_sizes_ref: Option<Ref>,
    free_versions_ref: Option<Ref>,
    top_ref: Option<Ref>,
}

impl Group {
    pub fn new() -> Group {
        Group {
            names: StringNode::new(),
            tables: Node::new_ref_array(false),
            key_tags: Vec::new(),
            free_slots: Vec::new(),
            logical_size: 0,
            current_version: 0,
            history_ref: None,
            evacuation_point: None,
            free_positions_ref: None,
            free_sizes_ref: None,
            free_versions_ref: None,
            top_ref: None,
        }
    }

    pub fn from_ref(alloc: &dyn Allocator, top_ref: Ref) -> Group {
        let top = Node::from_ref(alloc, top_ref);
        let slot = |i: usize| -> Option<i64> { if i < top.len() { Some(top.get(i)) } else { None } };

        let names_ref = slot(TopSlot::TableNames as usize).map(|v| Ref(v as u64)).filter(|r| !r.is_null());
        let tables_ref = slot(TopSlot::Tables as usize).map(|v| Ref(v as u64));
        let table_keys_ref = slot(TopSlot::TableKeys as usize).map(|v| Ref(v as u64));

        let names = names_ref.map(|r| StringNode::from_ref(alloc, r)).unwrap_or_default();
        let tables = tables_ref
            .map(|r| Node::from_ref(alloc, r))
            .unwrap_or_else(|| Node::new_ref_array(false));
        let key_tags = table_keys_ref
            .map(|r| {
                let n = Node::from_ref(alloc, r);
                (0..n.len()).map(|i| n.get(i) as u16).collect()
            })
            .unwrap_or_default();

        let logical_size = slot(TopSlot::LogicalSize as usize)
            .map(|v| RefOrTagged::from_raw(v as u64).as_tagged().unwrap_or(0))
            .unwrap_or(0);
        let current_version = slot(TopSlot::CurrentVersion as usize)
            .map(|v| RefOrTagged::from_raw(v as u64).as_tagged().unwrap_or(0))
            .unwrap_or(0);
        let history_ref = slot(TopSlot::HistoryRef as usize)
            .map(|v| Ref(v as u64))
            .filter(|r| !r.is_null());
        let evacuation_point = slot(TopSlot::EvacuationPoint as usize)
            .map(|v| Ref(v as u64))
            .filter(|r| !r.is_null());
        let free_positions_ref = slot(TopSlot::FreePositions as usize).map(|v| Ref(v as u64)).filter(|r| !r.is_null());
        let free_sizes_ref = slot(TopSlot::FreeSizes as usize).map(|v| Ref(v as u64)).filter(|r| !r.is_null());
        let free_versions_ref = slot(TopSlot::FreeVersions as usize).map(|v| Ref(v as u64)).filter(|r| !r.is_null());

        let free_slots = key_tags
            .iter()
            .enumerate()
            .filter(|(i, _)| tables.get(*i) == 0)
            .map(|(i, _)| i)
            .collect();

        Group {
            names,
            tables,
            key_tags,
            free_slots,
            logical_size,
            current_version,
            history_ref,
            evacuation_point,
            free_positions_ref,
            free_sizes_ref,
            free_versions_ref,
            top_ref: Some(top_ref),
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len() - self.free_slots.len()
    }

    /// Adds a table with the given name and an (initially empty) ref of its
    /// own; returns the key a caller should hold to refer to it.
    pub fn add_table(&mut self, alloc: &mut dyn Allocator, name: &str, table_ref: Ref) -> Result<TableKey> {
        if self.table_exists(alloc, name) {
            return Err(Error::SchemaMismatch(format!("table {name:?} already exists")));
        }
        if let Some(ix) = self.free_slots.pop() {
            self.tables.set(ix, table_ref.0 as i64);
            if ix < self.names.len() {
                self.names.set(alloc, ix, name)?;
            } else {
                self.names.push(alloc, name)?;
            }
            let tag = self.key_tags[ix];
            return Ok(TableKey::new(tag, ix as u16));
        }
        let ix = self.tables.len();
        self.tables.push(table_ref.0 as i64);
        self.names.push(alloc, name)?;
        self.key_tags.push(0);
        Ok(TableKey::new(0, ix as u16))
    }

    fn table_exists(&self, alloc: &dyn Allocator, name: &str) -> bool {
        (0..self.tables.len())
            .filter(|&i| self.tables.get(i) != 0)
            .any(|i| i < self.names.len() && self.names.get(alloc, i) == name)
    }

    /// Returns a live table's name, or `None` if `key` is stale.
    pub fn table_name(&self, alloc: &dyn Allocator, key: TableKey) -> Option<String> {
        self.resolve(key)?;
        let ix = key.index();
        if ix < self.names.len() {
            Some(self.names.get(alloc, ix))
        } else {
            None
        }
    }

    /// Removes a table, tombstoning its slot: the slot's tag is bumped so a
    /// `TableKey` obtained before the removal will fail [`Group::resolve`]
    /// rather than silently resolving to whatever table reuses the slot.
    pub fn remove_table(&mut self, key: TableKey) -> Result<()> {
        let ix = key.index();
        if ix >= self.tables.len() || self.key_tags[ix] != key.tag() || self.tables.get(ix) == 0 {
            return Err(Error::LogicError("remove_table: stale or unknown TableKey"));
        }
        self.tables.set(ix, 0);
        self.key_tags[ix] = self.key_tags[ix].wrapping_add(TOMBSTONE_TAG_BUMP);
        self.free_slots.push(ix);
        Ok(())
    }

    /// Resolves a `TableKey` to its current table ref, or `None` if the key
    /// is stale (its slot was tombstoned or reused since the key was
    /// issued).
    pub fn resolve(&self, key: TableKey) -> Option<Ref> {
        let ix = key.index();
        if ix >= self.tables.len() || self.key_tags[ix] != key.tag() {
            return None;
        }
        let raw = self.tables.get(ix);
        if raw == 0 {
            None
        } else {
            Some(Ref(raw as u64))
        }
    }

    pub fn set_table_ref(&mut self, key: TableKey, new_ref: Ref) -> Result<()> {
        let ix = key.index();
        if self.resolve(key).is_none() {
            return Err(Error::LogicError("set_table_ref: stale TableKey"));
        }
        self.tables.set(ix, new_ref.0 as i64);
        Ok(())
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn set_logical_size(&mut self, v: u64) {
        self.logical_size = v;
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn set_current_version(&mut self, v: u64) {
        self.current_version = v;
    }

    pub fn top_ref(&self) -> Option<Ref> {
        self.top_ref
    }

    /// Reconstructs the allocator's freelist as of this snapshot, or an
    /// empty one if this group predates the first commit that wrote
    /// freelist slots. [`crate::file::Db::begin_write`] seeds a fresh
    /// transaction's allocator with this so space freed in earlier
    /// transactions stays reusable.
    pub fn free_entries(&self, alloc: &dyn Allocator) -> Vec<FreeEntry> {
        let (Some(pos_ref), Some(size_ref), Some(ver_ref)) =
            (self.free_positions_ref, self.free_sizes_ref, self.free_versions_ref)
        else {
            return Vec::new();
        };
        let positions = Node::from_ref(alloc, pos_ref);
        let sizes = Node::from_ref(alloc, size_ref);
        let versions = Node::from_ref(alloc, ver_ref);
        (0..positions.len())
            .map(|i| FreeEntry {
                pos: positions.get(i) as u64,
                size: sizes.get(i) as u64,
                released_at_version: versions.get(i) as u64,
            })
            .collect()
    }

    /// Fills in the three freelist slots once
    /// [`crate::group_writer::GroupWriter::write_group`] has committed the
    /// allocator's current free entries as arrays of their own.
    pub fn set_freelist_refs(&mut self, positions: Ref, sizes: Ref, versions: Ref) {
        self.free_positions_ref = Some(positions);
        self.free_sizes_ref = Some(sizes);
        self.free_versions_ref = Some(versions);
    }

    /// Serializes the table directory and logical scalars into the fixed
    /// top-slot layout and commits it, returning the new top ref.
    ///
    /// `write_group` calls this twice: once before the freelist arrays
    /// exist (to learn their footprint) and once after
    /// [`Group::set_freelist_refs`] has filled them in, so the first call's
    /// freelist slots are legitimately zero.
    pub fn commit_top(&mut self, alloc: &mut dyn Allocator) -> Result<Ref> {
        let names_ref = self.names.commit(alloc)?;
        let tables_ref = self.tables.commit(alloc)?;
        let mut key_tags_node = Node::new_leaf();
        for &t in &self.key_tags {
            key_tags_node.push(t as i64);
        }
        let table_keys_ref = key_tags_node.commit(alloc)?;

        let mut top = Node::new_ref_array(false);
        let mut slots = vec![0i64; TopSlot::COUNT];
        slots[TopSlot::TableNames as usize] = names_ref.0 as i64;
        slots[TopSlot::Tables as usize] = tables_ref.0 as i64;
        slots[TopSlot::TableKeys as usize] = table_keys_ref.0 as i64;
        slots[TopSlot::FreePositions as usize] = self.free_positions_ref.map(|r| r.0 as i64).unwrap_or(0);
        slots[TopSlot::FreeSizes as usize] = self.free_sizes_ref.map(|r| r.0 as i64).unwrap_or(0);
        slots[TopSlot::FreeVersions as usize] = self.free_versions_ref.map(|r| r.0 as i64).unwrap_or(0);
        slots[TopSlot::LogicalSize as usize] = RefOrTagged::make_tagged(self.logical_size).to_raw() as i64;
        slots[TopSlot::CurrentVersion as usize] = RefOrTagged::make_tagged(self.current_version).to_raw() as i64;
        slots[TopSlot::HistoryRef as usize] = self.history_ref.map(|r| r.0 as i64).unwrap_or(0);
        slots[TopSlot::EvacuationPoint as usize] = self.evacuation_point.map(|r| r.0 as i64).unwrap_or(0);
        for s in slots {
            top.push(s);
        }
        let r = top.commit(alloc)?;
        self.top_ref = Some(r);
        Ok(r)
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocator::MemAllocator;

    #[test]
    fn add_then_resolve_table() {
        let mut alloc = MemAllocator::new();
        let mut g = Group::new();
        let key = g.add_table(&mut alloc, "people", Ref(8)).unwrap();
        assert_eq!(g.resolve(key), Some(Ref(8)));
        assert_eq!(g.table_name(&alloc, key), Some("people".to_string()));
    }

    #[test]
    fn duplicate_table_name_is_rejected() {
        let mut alloc = MemAllocator::new();
        let mut g = Group::new();
        g.add_table(&mut alloc, "people", Ref(8)).unwrap();
        assert!(g.add_table(&mut alloc, "people", Ref(16)).is_err());
    }

    #[test]
    fn removed_table_key_no_longer_resolves() {
        let mut alloc = MemAllocator::new();
        let mut g = Group::new();
        let key = g.add_table(&mut alloc, "people", Ref(8)).unwrap();
        g.remove_table(key).unwrap();
        assert_eq!(g.resolve(key), None);
    }

    #[test]
    fn reused_slot_gets_a_new_tag_so_old_key_stays_stale() {
        let mut alloc = MemAllocator::new();
        let mut g = Group::new();
        let first = g.add_table(&mut alloc, "a", Ref(8)).unwrap();
        g.remove_table(first).unwrap();
        let second = g.add_table(&mut alloc, "b", Ref(16)).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first.raw(), second.raw());
        assert_eq!(g.resolve(first), None);
        assert_eq!(g.resolve(second), Some(Ref(16)));
    }

    #[test]
    fn commit_and_reload_round_trips_tables() {
        let mut alloc = MemAllocator::new();
        let mut g = Group::new();
        g.add_table(&mut alloc, "a", Ref(8)).unwrap();
        g.add_table(&mut alloc, "b", Ref(16)).unwrap();
        g.set_logical_size(1000);
        let r = g.commit_top(&mut alloc).unwrap();
        let g2 = Group::from_ref(&alloc, r);
        assert_eq!(g2.table_count(), 2);
        assert_eq!(g2.logical_size(), 1000);
        assert_eq!(g2.table_name(&alloc, TableKey::new(0, 0)), Some("a".to_string()));
    }
}
