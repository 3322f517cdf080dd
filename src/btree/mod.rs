//! `BpTreeColumn`: a B+-tree of [`Node`] leaves, used for every column
//! whose element count can outgrow a single node.
//!
//! Each inner level is a pair of sibling arrays: `offsets` (plain integers,
//! the cumulative element count through each child) and `refs` (an
//! array-of-refs, the children themselves — either leaves or further inner
//! levels). A leaf holds up to [`MAX_LIST_SIZE`] elements directly; once
//! full it splits, and the split propagates upward exactly as far as
//! necessary, producing a taller tree only when the root itself splits.

use crate::alloc::Allocator;
use crate::error::Result;
use crate::node::Node;
use crate::ref_::Ref;

/// Maximum number of elements held directly by a leaf, and maximum number
/// of children held directly by an inner node, before a split is required.
pub const MAX_LIST_SIZE: usize = 1000;

/// Outcome of inserting into a subtree, reported to the caller one level up
/// so it can patch its own `offsets`/`refs` arrays (or, at the true root,
/// grow the tree by one level).
enum InsertResult {
    /// The subtree absorbed the insert; `new_ref` is where it now lives
    /// (unchanged from before the call if the child's storage didn't move).
    None { new_ref: Ref },
    /// The subtree split in two; the caller must insert `right` as a new
    /// sibling immediately after the slot that used to hold this subtree,
    /// and `left` replaces that slot.
    Split { left: Ref, right: Ref },
}

/// A single node in the tree: either a leaf of values, or an inner node
/// made of the `offsets`/`refs` sibling pair described above.
enum Level {
    Leaf(Node),
    Inner { offsets: Node, refs: Node },
}

impl Level {
    fn count(&self) -> usize {
        match self {
            Level::Leaf(n) => n.len(),
            Level::Inner { offsets, .. } => {
                if offsets.is_empty() {
                    0
                } else {
                    offsets.get(offsets.len() - 1) as usize
                }
            }
        }
    }

    fn load(alloc: &dyn Allocator, r: Ref) -> Level {
        let probe = Node::from_ref(alloc, r);
        if !probe.is_inner() {
            Level::Leaf(probe)
        } else {
            // An inner node's two elements are [offsets_ref, refs_ref].
            let offsets_ref = Ref(probe.get(0) as u64);
            let refs_ref = Ref(probe.get(1) as u64);
            Level::Inner {
                offsets: Node::from_ref(alloc, offsets_ref),
                refs: Node::from_ref(alloc, refs_ref),
            }
        }
    }

    fn commit(&mut self, alloc: &mut dyn Allocator) -> Result<Ref> {
        match self {
            Level::Leaf(n) => n.commit(alloc),
            Level::Inner { offsets, refs } => {
                let offsets_ref = offsets.commit(alloc)?;
                let refs_ref = refs.commit(alloc)?;
                let mut header = Node::new_ref_array(true);
                header.push(offsets_ref.0 as i64);
                header.push(refs_ref.0 as i64);
                header.commit(alloc)
            }
        }
    }
}

/// A persistent, copy-on-write B+-tree column. `BpTreeColumn` is a thin
/// handle: every mutating call reloads the relevant subtree from its ref,
/// mutates, and commits, matching the rest of this crate's copy-on-write
/// discipline (a node is never mutated in place behind a ref another
/// reader might still hold).
pub struct BpTreeColumn {
    root_ref: Option<Ref>,
    count: usize,
}

impl BpTreeColumn {
    pub fn new() -> BpTreeColumn {
        BpTreeColumn {
            root_ref: None,
            count: 0,
        }
    }

    pub fn from_ref(alloc: &dyn Allocator, r: Ref) -> BpTreeColumn {
        let count = Level::load(alloc, r).count();
        BpTreeColumn {
            root_ref: Some(r),
            count,
        }
    }

    pub fn ref_(&self) -> Option<Ref> {
        self.root_ref
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> i64 {
        assert!(ndx < self.count);
        let mut level = Level::load(alloc, self.root_ref.expect("get on empty column"));
        let mut local = ndx;
        loop {
            match level {
                Level::Leaf(n) => return n.get(local),
                Level::Inner { offsets, refs } => {
                    let child_ix = child_for_ndx(&offsets, local);
                    let child_start = if child_ix == 0 { 0 } else { offsets.get(child_ix - 1) as usize };
                    local -= child_start;
                    let child_ref = Ref(refs.get(child_ix) as u64);
                    level = Level::load(alloc, child_ref);
                }
            }
        }
    }

    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        assert!(ndx <= self.count);
        let new_root = match self.root_ref {
            None => {
                let mut leaf = Node::new_leaf();
                leaf.push(value);
                leaf.commit(alloc)?
            }
            Some(r) => match insert_into(alloc, r, ndx, value)? {
                InsertResult::None { new_ref } => new_ref,
                InsertResult::Split { left, right } => new_inner(alloc, &[left, right])?,
            },
        };
        self.root_ref = Some(new_root);
        self.count += 1;
        Ok(())
    }

    pub fn push(&mut self, alloc: &mut dyn Allocator, value: i64) -> Result<()> {
        let n = self.count;
        self.insert(alloc, n, value)
    }

    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        assert!(ndx < self.count);
        let r = self.root_ref.expect("erase on empty column");
        let new_root = erase_from(alloc, r, ndx)?;
        self.root_ref = Some(new_root);
        self.count -= 1;
        Ok(())
    }

    pub fn find_first(&self, alloc: &dyn Allocator, value: i64) -> Option<usize> {
        self.find_first_impl(alloc, self.root_ref?, value, 0)
    }

    fn find_first_impl(&self, alloc: &dyn Allocator, r: Ref, value: i64, base: usize) -> Option<usize> {
        match Level::load(alloc, r) {
            Level::Leaf(n) => n.find_first(value, 0).map(|i| base + i),
            Level::Inner { offsets, refs } => {
                let mut child_start = 0usize;
                for i in 0..refs.len() {
                    let child_ref = Ref(refs.get(i) as u64);
                    if let Some(hit) = self.find_first_impl(alloc, child_ref, value, base + child_start) {
                        return Some(hit);
                    }
                    child_start = offsets.get(i) as usize;
                }
                None
            }
        }
    }
}

impl Default for BpTreeColumn {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the child whose span covers element `local_ndx`, given the
/// cumulative-count `offsets` array: the inner-node navigation variant of
/// `find_pos` (`Node::find_pos_gt`), since a child's cumulative offset is
/// its end-exclusive bound.
fn child_for_ndx(offsets: &Node, local_ndx: usize) -> usize {
    offsets
        .find_pos_gt(local_ndx as i64)
        .unwrap_or_else(|| offsets.len().saturating_sub(1))
}

fn new_inner(alloc: &mut dyn Allocator, children: &[Ref]) -> Result<Ref> {
    let mut offsets = Node::new_leaf();
    let mut refs = Node::new_ref_array(false);
    let mut running = 0i64;
    for &c in children {
        let n = Level::load(alloc, c).count() as i64;
        running += n;
        offsets.push(running);
        refs.push(c.0 as i64);
    }
    let mut level = Level::Inner { offsets, refs };
    level.commit(alloc)
}

fn insert_into(alloc: &mut dyn Allocator, r: Ref, ndx: usize, value: i64) -> Result<InsertResult> {
    let mut level = Level::load(alloc, r);
    match &mut level {
        Level::Leaf(n) => {
            if n.len() < MAX_LIST_SIZE {
                n.insert(ndx, value);
                let new_ref = n.commit(alloc)?;
                Ok(InsertResult::None { new_ref })
            } else {
                let mid = n.len() / 2;
                let mut left = Node::new_leaf();
                let mut right = Node::new_leaf();
                for i in 0..mid {
                    left.push(n.get(i));
                }
                for i in mid..n.len() {
                    right.push(n.get(i));
                }
                if ndx <= mid {
                    left.insert(ndx, value);
                } else {
                    right.insert(ndx - mid, value);
                }
                let left_ref = left.commit(alloc)?;
                let right_ref = right.commit(alloc)?;
                Ok(InsertResult::Split { left: left_ref, right: right_ref })
            }
        }
        Level::Inner { offsets, refs } => {
            let child_ix = child_for_ndx(offsets, ndx);
            let child_start = if child_ix == 0 { 0 } else { offsets.get(child_ix - 1) as usize };
            let child_ref = Ref(refs.get(child_ix) as u64);
            let result = insert_into(alloc, child_ref, ndx - child_start, value)?;
            match result {
                InsertResult::None { new_ref } => {
                    refs.set(child_ix, new_ref.0 as i64);
                    bump_offsets_from(offsets, child_ix);
                    let new_self = level.commit(alloc)?;
                    Ok(InsertResult::None { new_ref: new_self })
                }
                InsertResult::Split { left, right } => {
                    refs.set(child_ix, left.0 as i64);
                    refs.insert(child_ix + 1, right.0 as i64);
                    rebuild_offsets(alloc, offsets, refs);
                    if refs.len() <= MAX_LIST_SIZE {
                        let new_self = level.commit(alloc)?;
                        Ok(InsertResult::None { new_ref: new_self })
                    } else {
                        split_inner(alloc, offsets, refs)
                    }
                }
            }
        }
    }
}

fn bump_offsets_from(offsets: &mut Node, from_ix: usize) {
    for i in from_ix..offsets.len() {
        let cur = offsets.get(i);
        offsets.set(i, cur + 1);
    }
}

fn rebuild_offsets(alloc: &dyn Allocator, offsets: &mut Node, refs: &Node) {
    let mut running = 0i64;
    let mut fresh = Node::new_leaf();
    for i in 0..refs.len() {
        let child_ref = Ref(refs.get(i) as u64);
        running += Level::load(alloc, child_ref).count() as i64;
        fresh.push(running);
    }
    *offsets = fresh;
}

fn split_inner(alloc: &mut dyn Allocator, offsets: &mut Node, refs: &mut Node) -> Result<InsertResult> {
    let mid = refs.len() / 2;
    let left_children: Vec<Ref> = (0..mid).map(|i| Ref(refs.get(i) as u64)).collect();
    let right_children: Vec<Ref> = (mid..refs.len()).map(|i| Ref(refs.get(i) as u64)).collect();
    let left_ref = new_inner(alloc, &left_children)?;
    let right_ref = new_inner(alloc, &right_children)?;
    Ok(InsertResult::Split { left: left_ref, right: right_ref })
}

/// Frees every node reachable from `r` — the node itself, and, if it's an
/// inner node, its header/offsets/refs arrays and the whole subtree under
/// each child. Used when a child collapses to empty and its slot is erased
/// outright rather than kept under a new ref: without this the committed
/// storage it (and everything below it) occupied would never make it back
/// onto the freelist.
fn free_subtree(alloc: &mut dyn Allocator, r: Ref) {
    let probe = Node::from_ref(alloc, r);
    if probe.is_inner() {
        let offsets_ref = Ref(probe.get(0) as u64);
        let refs_ref = Ref(probe.get(1) as u64);
        let refs = Node::from_ref(alloc, refs_ref);
        for i in 0..refs.len() {
            free_subtree(alloc, Ref(refs.get(i) as u64));
        }
        let offsets = Node::from_ref(alloc, offsets_ref);
        let offsets_size = offsets.on_disk_size();
        alloc.free(offsets_ref, offsets_size);
        let refs_size = refs.on_disk_size();
        alloc.free(refs_ref, refs_size);
    }
    let size = probe.on_disk_size();
    alloc.free(r, size);
}

fn erase_from(alloc: &mut dyn Allocator, r: Ref, ndx: usize) -> Result<Ref> {
    let mut level = Level::load(alloc, r);
    match &mut level {
        Level::Leaf(n) => {
            n.erase(ndx);
            n.commit(alloc)
        }
        Level::Inner { offsets, refs } => {
            let child_ix = child_for_ndx(offsets, ndx);
            let child_start = if child_ix == 0 { 0 } else { offsets.get(child_ix - 1) as usize };
            let child_ref = Ref(refs.get(child_ix) as u64);
            let child_count_before = Level::load(alloc, child_ref).count();
            let new_child = erase_from(alloc, child_ref, ndx - child_start)?;
            if child_count_before == 1 {
                free_subtree(alloc, new_child);
                refs.erase(child_ix);
            } else {
                refs.set(child_ix, new_child.0 as i64);
            }
            rebuild_offsets(alloc, offsets, refs);
            level.commit(alloc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocator::MemAllocator;

    #[test]
    fn insert_get_within_single_leaf() {
        let mut alloc = MemAllocator::new();
        let mut col = BpTreeColumn::new();
        for i in 0..50 {
            col.push(&mut alloc, i as i64).unwrap();
        }
        assert_eq!(col.len(), 50);
        for i in 0..50 {
            assert_eq!(col.get(&alloc, i), i as i64);
        }
    }

    #[test]
    fn insert_past_max_list_size_splits_into_tree() {
        let mut alloc = MemAllocator::new();
        let mut col = BpTreeColumn::new();
        let total = MAX_LIST_SIZE * 2 + 137;
        for i in 0..total {
            col.push(&mut alloc, i as i64).unwrap();
        }
        assert_eq!(col.len(), total);
        for i in (0..total).step_by(97) {
            assert_eq!(col.get(&alloc, i), i as i64);
        }
        assert_eq!(col.get(&alloc, total - 1), (total - 1) as i64);
    }

    #[test]
    fn erase_maintains_order() {
        let mut alloc = MemAllocator::new();
        let mut col = BpTreeColumn::new();
        for i in 0..2500 {
            col.push(&mut alloc, i as i64).unwrap();
        }
        col.erase(&mut alloc, 1200).unwrap();
        assert_eq!(col.len(), 2499);
        assert_eq!(col.get(&alloc, 1199), 1199);
        assert_eq!(col.get(&alloc, 1200), 1201);
    }

    #[test]
    fn find_first_across_leaves() {
        let mut alloc = MemAllocator::new();
        let mut col = BpTreeColumn::new();
        for i in 0..2500 {
            col.push(&mut alloc, (i % 7) as i64).unwrap();
        }
        let hit = col.find_first(&alloc, 3).unwrap();
        assert_eq!(hit, 3);
    }
}
