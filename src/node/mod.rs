//! `Node`: the adaptive bit-packed array that underlies every column, every
//! B+-tree inner node, and the top array itself.
//!
//! A node stores a homogeneous array of up to 64-bit signed integers (or,
//! when `has_refs` is set, an array of child [`Ref`]s/tagged scalars) packed
//! at the narrowest width in `{0,1,2,4,8,16,32,64}` bits that represents
//! every element currently held. Writing a value that doesn't fit the
//! current width widens the whole array in place before the write proceeds;
//! nodes never narrow on their own (only [`crate::group_writer::GroupWriter`]
//! compaction can shrink the file around them).
//!
//! A node is either a leaf (`is_inner == false`) or an inner B+-tree node
//! (`is_inner == true`, see [`crate::btree`]); `Node` itself only knows how
//! to store/retrieve/resize elements — tree topology lives one layer up.

pub mod find;
pub mod string_node;
pub mod width;

use crate::alloc::Allocator;
use crate::error::Result;
use crate::ref_::Ref;

/// Size of the fixed node header, in bytes.
pub const HEADER_SIZE: usize = 8;

/// Growth factor applied when a node outgrows its current capacity:
/// `new_capacity = max(128, capacity + capacity / 2)`, matching the
/// resize policy of every other array-of-bytes growth in this codebase.
fn grow(capacity: usize) -> usize {
    if capacity == 0 {
        128
    } else {
        capacity + capacity / 2
    }
}

fn width_to_log2(width: u8) -> u8 {
    match width {
        0 => 0,
        1 => 1,
        2 => 2,
        4 => 3,
        8 => 4,
        16 => 5,
        32 => 6,
        64 => 7,
        w => unreachable!("illegal width {w}"),
    }
}

fn log2_to_width(log2: u8) -> u8 {
    width::WIDTHS[log2 as usize]
}

fn encode_header(is_inner: bool, has_refs: bool, width: u8, count: usize, capacity: usize) -> [u8; 8] {
    debug_assert!(count <= 0xFF_FFFF, "count exceeds 24-bit field");
    debug_assert!(capacity <= 0xFF_FFFF, "capacity exceeds 24-bit field");
    let mut b = [0u8; 8];
    let flags = (is_inner as u8) | ((has_refs as u8) << 1) | (width_to_log2(width) << 2);
    b[0] = flags;
    b[1] = ((count >> 16) & 0xFF) as u8;
    b[2] = ((count >> 8) & 0xFF) as u8;
    b[3] = (count & 0xFF) as u8;
    b[4] = ((capacity >> 16) & 0xFF) as u8;
    b[5] = ((capacity >> 8) & 0xFF) as u8;
    b[6] = (capacity & 0xFF) as u8;
    b[7] = 0; // reserved
    b
}

fn decode_header(b: &[u8]) -> (bool, bool, u8, usize, usize) {
    let flags = b[0];
    let is_inner = flags & 0x01 != 0;
    let has_refs = flags & 0x02 != 0;
    let width = log2_to_width((flags >> 2) & 0x07);
    let count = ((b[1] as usize) << 16) | ((b[2] as usize) << 8) | (b[3] as usize);
    let capacity = ((b[4] as usize) << 16) | ((b[5] as usize) << 8) | (b[6] as usize);
    (is_inner, has_refs, width, count, capacity)
}

/// An in-memory, mutable view of one array node. Call [`Node::commit`] to
/// persist it (and obtain the ref a parent should point at).
#[derive(Debug, Clone)]
pub struct Node {
    is_inner: bool,
    has_refs: bool,
    width: u8,
    count: usize,
    capacity: usize,
    body: Vec<u8>,
    ref_: Option<Ref>,
    /// Total on-disk size (header + body) reserved at `ref_` as of the last
    /// commit/load, used to decide whether the next commit can overwrite in
    /// place instead of reallocating.
    allocated_size: Option<usize>,
}

impl Node {
    /// A new, empty, detached leaf node.
    pub fn new_leaf() -> Node {
        Node {
            is_inner: false,
            has_refs: false,
            width: 0,
            count: 0,
            capacity: 0,
            body: Vec::new(),
            ref_: None,
            allocated_size: None,
        }
    }

    /// A new, empty, detached node for holding child refs (inner B+-tree
    /// node, or any array-of-refs such as a table's column list).
    pub fn new_ref_array(is_inner: bool) -> Node {
        Node {
            is_inner,
            has_refs: true,
            width: 0,
            count: 0,
            capacity: 0,
            body: Vec::new(),
            ref_: None,
            allocated_size: None,
        }
    }

    /// Loads a node from the allocator at `r`.
    pub fn from_ref(alloc: &dyn Allocator, r: Ref) -> Node {
        let bytes = alloc.translate(r);
        let (is_inner, has_refs, width, count, capacity) = decode_header(&bytes[..HEADER_SIZE]);
        let body_len = width::bytes_for(width, capacity);
        let body = bytes[HEADER_SIZE..HEADER_SIZE + body_len].to_vec();
        Node {
            is_inner,
            has_refs,
            width,
            count,
            capacity,
            body,
            ref_: Some(r),
            allocated_size: Some(HEADER_SIZE + body_len),
        }
    }

    pub fn ref_(&self) -> Option<Ref> {
        self.ref_
    }

    pub fn is_inner(&self) -> bool {
        self.is_inner
    }

    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Byte size this node currently occupies on disk (header + packed
    /// body, sized to `capacity` not `count` so future pushes don't always
    /// force a relocation).
    pub fn on_disk_size(&self) -> usize {
        HEADER_SIZE + width::bytes_for(self.width, self.capacity)
    }

    pub fn get(&self, ndx: usize) -> i64 {
        assert!(ndx < self.count, "index {ndx} out of bounds ({})", self.count);
        width::get(&self.body, self.width, ndx)
    }

    fn ensure_width(&mut self, value: i64) {
        let needed = width::bit_width(value).max(self.width);
        if needed != self.width {
            self.set_width(needed);
        }
    }

    fn set_width(&mut self, new_width: u8) {
        let mut new_body = vec![0u8; width::bytes_for(new_width, self.capacity.max(self.count))];
        for i in 0..self.count {
            let v = width::get(&self.body, self.width, i);
            width::set(&mut new_body, new_width, i, v);
        }
        self.width = new_width;
        self.body = new_body;
    }

    fn ensure_capacity(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity {
            return;
        }
        let mut new_capacity = grow(self.capacity);
        if new_capacity < min_capacity {
            new_capacity = min_capacity;
        }
        let mut new_body = vec![0u8; width::bytes_for(self.width, new_capacity)];
        new_body[..self.body.len().min(new_body.len())]
            .copy_from_slice(&self.body[..self.body.len().min(new_body.len())]);
        self.body = new_body;
        self.capacity = new_capacity;
    }

    pub fn set(&mut self, ndx: usize, value: i64) {
        assert!(ndx < self.count, "index {ndx} out of bounds ({})", self.count);
        self.ensure_width(value);
        width::set(&mut self.body, self.width, ndx, value);
    }

    pub fn insert(&mut self, ndx: usize, value: i64) {
        assert!(ndx <= self.count, "insert index {ndx} out of bounds ({})", self.count);
        self.ensure_width(value);
        self.ensure_capacity(self.count + 1);
        for i in (ndx..self.count).rev() {
            let v = width::get(&self.body, self.width, i);
            width::set(&mut self.body, self.width, i + 1, v);
        }
        width::set(&mut self.body, self.width, ndx, value);
        self.count += 1;
    }

    pub fn push(&mut self, value: i64) {
        self.insert(self.count, value);
    }

    pub fn erase(&mut self, ndx: usize) {
        assert!(ndx < self.count, "erase index {ndx} out of bounds ({})", self.count);
        for i in ndx..self.count - 1 {
            let v = width::get(&self.body, self.width, i + 1);
            width::set(&mut self.body, self.width, i, v);
        }
        self.count -= 1;
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn find_first(&self, value: i64, start: usize) -> Option<usize> {
        find::find_first(&self.body, self.width, self.count, value, start)
    }

    pub fn find_all(&self, value: i64, start: usize, offset: usize, out: &mut Vec<usize>) {
        find::find_all(&self.body, self.width, self.count, value, start, offset, out)
    }

    /// Binary search for the first element `>= value` (original `FindPos`
    /// semantics): the array must be sorted ascending.
    pub fn lower_bound(&self, value: i64) -> usize {
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid) < value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// The last element. Panics on an empty node, same precondition as
    /// [`Node::get`].
    pub fn back(&self) -> i64 {
        self.get(self.count - 1)
    }

    /// `find_pos` variant used for sorted-index lookups: the smallest index
    /// whose element is `>= target`, or `None` if every element is smaller
    /// (including when the node is empty). The array must be sorted
    /// ascending. Ties go to the first equal element.
    pub fn find_pos_ge(&self, target: i64) -> Option<usize> {
        let ix = self.lower_bound(target);
        if ix == self.count {
            None
        } else {
            Some(ix)
        }
    }

    /// `find_pos` variant used for inner-node navigation: the smallest
    /// index whose element is strictly `> target`, or `None` if no element
    /// exceeds it. Equivalently, `index - 1` (when it exists) is the
    /// largest index whose element is `<= target`. The array must be
    /// sorted ascending.
    pub fn find_pos_gt(&self, target: i64) -> Option<usize> {
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid) > target {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo == self.count {
            None
        } else {
            Some(lo)
        }
    }

    /// Hamming-distance search: the first index in `[start, count)` whose
    /// element differs from `value` in at most `max_dist` bits. Only
    /// meaningful for width-64 nodes (narrower widths never hold the
    /// fingerprint-style values this search is for).
    pub fn find_hamming(&self, value: i64, max_dist: u32, start: usize) -> Option<usize> {
        assert_eq!(self.width, 64, "find_hamming is only defined for width-64 nodes");
        find::find_hamming(&self.body, self.count, value, max_dist, start)
    }

    /// Writes this node's current bytes to the allocator and returns the ref
    /// the parent should now point at.
    ///
    /// If this node's ref lies in the mutable (slab-owned) region and its
    /// previously reserved space is still large enough, it is overwritten
    /// in place and the ref is unchanged — matching `spec.md` §4.1's
    /// "in-place mutation when owned". Otherwise (the ref is file-owned and
    /// must be copy-on-written, or it simply outgrew its old reservation) a
    /// fresh region is allocated, the old one is freed, and the new ref is
    /// returned for the caller to propagate to its parent.
    pub fn commit(&mut self, alloc: &mut dyn Allocator) -> Result<Ref> {
        let header = encode_header(self.is_inner, self.has_refs, self.width, self.count, self.capacity);
        let total_size = HEADER_SIZE + self.body.len();

        if let (Some(old), Some(cap)) = (self.ref_, self.allocated_size) {
            if alloc.is_mutable(old) && total_size <= cap {
                let mut out = Vec::with_capacity(total_size);
                out.extend_from_slice(&header);
                out.extend_from_slice(&self.body);
                alloc.write_at(old, &out);
                return Ok(old);
            }
        }

        let new_ref = alloc.alloc(total_size)?;
        let mut out = Vec::with_capacity(total_size);
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.body);
        alloc.write_at(new_ref, &out);
        if let Some(old) = self.ref_ {
            if old != new_ref {
                alloc.free(old, self.allocated_size.unwrap_or_else(|| self.on_disk_size()));
            }
        }
        self.ref_ = Some(new_ref);
        self.allocated_size = Some(total_size);
        Ok(new_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocator::MemAllocator;

    #[test]
    fn insert_widens_as_needed() {
        let mut n = Node::new_leaf();
        for v in [1i64, 2, 3, 1_000_000_000] {
            n.push(v);
        }
        assert_eq!(n.width(), 32);
        assert_eq!(n.get(0), 1);
        assert_eq!(n.get(3), 1_000_000_000);
    }

    #[test]
    fn set_minus_one_widens_to_eight() {
        let mut n = Node::new_leaf();
        for i in 0..2049 {
            n.push(i as i64 % 2);
        }
        assert_eq!(n.width(), 1);
        n.set(5, -1);
        assert_eq!(n.width(), 8);
        assert_eq!(n.get(5), -1);
        assert_eq!(n.get(0), 0);
    }

    #[test]
    fn erase_shifts_left() {
        let mut n = Node::new_leaf();
        for v in [10i64, 20, 30, 40] {
            n.push(v);
        }
        n.erase(1);
        assert_eq!(n.len(), 3);
        assert_eq!(n.get(0), 10);
        assert_eq!(n.get(1), 30);
        assert_eq!(n.get(2), 40);
    }

    #[test]
    fn commit_round_trips_through_allocator() {
        let mut alloc = MemAllocator::new();
        let mut n = Node::new_leaf();
        for v in [5i64, -5, 100000] {
            n.push(v);
        }
        let r = n.commit(&mut alloc).unwrap();
        let loaded = Node::from_ref(&alloc, r);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get(1), -5);
        assert_eq!(loaded.get(2), 100000);
    }

    #[test]
    fn mutation_of_slab_owned_node_keeps_its_ref() {
        use crate::alloc::SlabAlloc;
        let mut alloc = SlabAlloc::new();
        let mut n = Node::new_leaf();
        n.push(1);
        n.push(2);
        let r1 = n.commit(&mut alloc).unwrap();
        n.set(0, 99);
        let r2 = n.commit(&mut alloc).unwrap();
        assert_eq!(r1, r2, "in-place mutation of a slab-owned node must not move");
    }

    #[test]
    fn mutation_of_file_owned_node_copies_on_write() {
        use crate::alloc::SlabAlloc;
        let mut alloc = SlabAlloc::new();
        let mut n = Node::new_leaf();
        n.push(1);
        n.push(2);
        let r1 = n.commit(&mut alloc).unwrap();
        // Simulate a commit boundary: everything allocated so far becomes
        // immutable file content for the next write transaction.
        alloc.begin_write();
        n.set(0, 99);
        let r2 = n.commit(&mut alloc).unwrap();
        assert_ne!(r1, r2, "mutating a file-owned node must copy-on-write");
    }

    #[test]
    fn lower_bound_matches_sorted_array() {
        let mut n = Node::new_leaf();
        for v in [1i64, 3, 5, 7, 9] {
            n.push(v);
        }
        assert_eq!(n.lower_bound(0), 0);
        assert_eq!(n.lower_bound(5), 2);
        assert_eq!(n.lower_bound(6), 3);
        assert_eq!(n.lower_bound(10), 5);
    }

    #[test]
    fn find_pos_ge_returns_none_past_the_end() {
        let mut n = Node::new_leaf();
        for v in [1i64, 3, 5] {
            n.push(v);
        }
        assert_eq!(n.find_pos_ge(0), Some(0));
        assert_eq!(n.find_pos_ge(5), Some(2));
        assert_eq!(n.find_pos_ge(6), None);
    }

    #[test]
    fn find_pos_gt_locates_the_first_strictly_larger_element() {
        let mut n = Node::new_leaf();
        for v in [1i64, 3, 5, 5, 9] {
            n.push(v);
        }
        assert_eq!(n.find_pos_gt(0), Some(0));
        assert_eq!(n.find_pos_gt(5), Some(4));
        assert_eq!(n.find_pos_gt(9), None);
    }

    #[test]
    fn find_pos_on_empty_node_is_not_found() {
        let n = Node::new_leaf();
        assert_eq!(n.find_pos_ge(0), None);
        assert_eq!(n.find_pos_gt(0), None);
    }

    #[test]
    fn back_returns_last_element() {
        let mut n = Node::new_leaf();
        for v in [1i64, 2, 3] {
            n.push(v);
        }
        assert_eq!(n.back(), 3);
    }

    #[test]
    fn find_hamming_requires_width_64() {
        let mut n = Node::new_leaf();
        n.push(i64::MAX);
        assert_eq!(n.find_hamming(i64::MAX, 0, 0), Some(0));
    }
}
