//! `StringNode`: a node variant specialized for short strings.
//!
//! Elements are stored in fixed-width byte slots instead of bit-packed
//! scalars: the slot width is the next power of two (minimum 8) at least as
//! large as the longest string stored so far, including its trailing zero
//! terminator. A string shorter than the slot width is zero-padded after
//! its terminator; the terminator is what lets `get` recover the true
//! length from a slot wider than the string itself.
//!
//! Strings that would need a slot wider than [`MAX_INLINE_WIDTH`] spill
//! into a side array of refs, each pointing at an independently allocated
//! blob. This keeps the common case (short strings) cheap to scan while
//! still supporting arbitrarily long values.
//!
//! On disk a `StringNode` is two sibling arrays behind one wrapper ref,
//! mirroring the inner-node `(offsets, refs)` pairing [`crate::btree`] uses:
//! a `content` array holding the packed inline slots behind a small header
//! (fixed-width string slots don't fit the `{0,1,2,4,8,16,32,64}`-bit width
//! set a plain [`crate::node::Node`] is restricted to), and a `blob_refs`
//! array of one ref per element (zero unless that element spilled to a
//! blob).

use crate::alloc::Allocator;
use crate::error::Result;
use crate::node::Node;
use crate::ref_::Ref;

/// Largest inline slot width, in bytes. Strings (plus terminator) longer
/// than this spill to the blob side array.
pub const MAX_INLINE_WIDTH: usize = 64;

/// `content` array header: slot width (u32 LE) followed by element count
/// (u32 LE).
const CONTENT_HEADER_SIZE: usize = 8;

fn slot_width_for(len_with_terminator: usize) -> usize {
    let mut w = 8usize;
    while w < len_with_terminator {
        w *= 2;
    }
    w
}

#[derive(Debug, Clone)]
enum Slot {
    Inline(Vec<u8>),
    Blob(Ref, usize),
}

#[derive(Debug, Clone)]
pub struct StringNode {
    slot_width: usize,
    slots: Vec<Slot>,
}

impl StringNode {
    pub fn new() -> StringNode {
        StringNode {
            slot_width: 8,
            slots: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn widen_if_needed(&mut self, s: &str) {
        let needed = s.len() + 1;
        if needed > MAX_INLINE_WIDTH {
            return;
        }
        let needed_width = slot_width_for(needed);
        if needed_width > self.slot_width {
            self.slot_width = needed_width;
        }
    }

    /// Inserts `s` at `ndx`, allocating a blob for it through `alloc` if it
    /// is too long to inline.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, s: &str) -> Result<()> {
        assert!(ndx <= self.slots.len());
        self.widen_if_needed(s);
        let slot = if s.len() + 1 > MAX_INLINE_WIDTH {
            let bytes = s.as_bytes();
            let r = alloc.alloc(bytes.len())?;
            alloc.write_at(r, bytes);
            Slot::Blob(r, bytes.len())
        } else {
            let mut bytes = vec![0u8; self.slot_width];
            bytes[..s.len()].copy_from_slice(s.as_bytes());
            Slot::Inline(bytes)
        };
        self.slots.insert(ndx, slot);
        Ok(())
    }

    pub fn push(&mut self, alloc: &mut dyn Allocator, s: &str) -> Result<()> {
        self.insert(alloc, self.slots.len(), s)
    }

    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, s: &str) -> Result<()> {
        self.erase(ndx);
        self.insert(alloc, ndx, s)
    }

    pub fn erase(&mut self, ndx: usize) {
        self.slots.remove(ndx);
    }

    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> String {
        match &self.slots[ndx] {
            Slot::Inline(bytes) => {
                let term = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                String::from_utf8_lossy(&bytes[..term]).into_owned()
            }
            Slot::Blob(r, len) => {
                let bytes = &alloc.translate(*r)[..*len];
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
    }

    /// Slot-wise scan for the first string equal to `needle`, starting at
    /// `start`. Unlike the packed-integer scan this is a plain `memcmp` per
    /// slot — fixed-width string slots don't admit the zero-byte SWAR trick
    /// since the terminator itself is a valid zero byte.
    pub fn find_first(&self, alloc: &dyn Allocator, needle: &str, start: usize) -> Option<usize> {
        (start..self.slots.len()).find(|&i| self.get(alloc, i) == needle)
    }

    /// Persists the content and blob-ref arrays and returns the ref of a
    /// two-element wrapper array pointing at both.
    pub fn commit(&mut self, alloc: &mut dyn Allocator) -> Result<Ref> {
        let mut content = Vec::with_capacity(CONTENT_HEADER_SIZE + self.slot_width * self.slots.len());
        content.extend_from_slice(&(self.slot_width as u32).to_le_bytes());
        content.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());
        for slot in &self.slots {
            match slot {
                Slot::Inline(bytes) => content.extend_from_slice(bytes),
                Slot::Blob(_, _) => content.extend(std::iter::repeat(0u8).take(self.slot_width)),
            }
        }
        let content_ref = alloc.alloc(content.len())?;
        alloc.write_at(content_ref, &content);

        let mut blob_refs = Node::new_ref_array(false);
        for slot in &self.slots {
            match slot {
                Slot::Inline(_) => blob_refs.push(0),
                Slot::Blob(r, _) => blob_refs.push(r.get() as i64),
            }
        }
        let blob_refs_ref = blob_refs.commit(alloc)?;

        let mut wrapper = Node::new_ref_array(false);
        wrapper.push(content_ref.get() as i64);
        wrapper.push(blob_refs_ref.get() as i64);
        wrapper.commit(alloc)
    }

    /// Loads a `StringNode` previously persisted by [`StringNode::commit`].
    pub fn from_ref(alloc: &dyn Allocator, r: Ref) -> StringNode {
        let wrapper = Node::from_ref(alloc, r);
        let content_ref = Ref(wrapper.get(0) as u64);
        let blob_refs_ref = Ref(wrapper.get(1) as u64);

        let content = alloc.translate(content_ref);
        let slot_width = u32::from_le_bytes(content[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(content[4..8].try_into().unwrap()) as usize;

        let blob_refs_node = Node::from_ref(alloc, blob_refs_ref);

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let off = CONTENT_HEADER_SIZE + i * slot_width;
            let blob_raw = blob_refs_node.get(i) as u64;
            if blob_raw != 0 {
                let blob_ref = Ref(blob_raw);
                let len = alloc.translate(blob_ref).len();
                slots.push(Slot::Blob(blob_ref, len));
            } else {
                slots.push(Slot::Inline(content[off..off + slot_width].to_vec()));
            }
        }
        StringNode { slot_width, slots }
    }
}

impl Default for StringNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocator::MemAllocator;

    #[test]
    fn insert_and_get_short_strings() {
        let mut alloc = MemAllocator::new();
        let mut s = StringNode::new();
        s.push(&mut alloc, "hi").unwrap();
        s.push(&mut alloc, "world").unwrap();
        assert_eq!(s.get(&alloc, 0), "hi");
        assert_eq!(s.get(&alloc, 1), "world");
    }

    #[test]
    fn widens_slot_for_longer_strings() {
        let mut alloc = MemAllocator::new();
        let mut s = StringNode::new();
        s.push(&mut alloc, "short").unwrap();
        assert_eq!(s.slot_width, 8);
        s.push(&mut alloc, "a string longer than eight bytes").unwrap();
        assert!(s.slot_width > 8);
        assert_eq!(s.get(&alloc, 0), "short");
        assert_eq!(s.get(&alloc, 1), "a string longer than eight bytes");
    }

    #[test]
    fn long_strings_spill_to_blob_refs() {
        let mut alloc = MemAllocator::new();
        let mut s = StringNode::new();
        let long = "x".repeat(200);
        s.push(&mut alloc, &long).unwrap();
        assert_eq!(s.get(&alloc, 0), long);
        assert!(s.slot_width <= MAX_INLINE_WIDTH);
    }

    #[test]
    fn find_first_matches_by_value() {
        let mut alloc = MemAllocator::new();
        let mut s = StringNode::new();
        for v in ["a", "b", "c", "b"] {
            s.push(&mut alloc, v).unwrap();
        }
        assert_eq!(s.find_first(&alloc, "b", 0), Some(1));
        assert_eq!(s.find_first(&alloc, "b", 2), Some(3));
        assert_eq!(s.find_first(&alloc, "z", 0), None);
    }

    #[test]
    fn commit_and_reload_round_trips() {
        let mut alloc = MemAllocator::new();
        let mut s = StringNode::new();
        s.push(&mut alloc, "alpha").unwrap();
        s.push(&mut alloc, "beta").unwrap();
        s.push(&mut alloc, &"z".repeat(100)).unwrap();
        let r = s.commit(&mut alloc).unwrap();
        let loaded = StringNode::from_ref(&alloc, r);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get(&alloc, 0), "alpha");
        assert_eq!(loaded.get(&alloc, 1), "beta");
        assert_eq!(loaded.get(&alloc, 2), "z".repeat(100));
    }
}
