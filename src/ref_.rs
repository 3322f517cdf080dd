//! Reference types: byte offsets into the database file, and the tagged
//! encoding used to store a small integer inline where a ref would
//! otherwise go.

use std::fmt;

/// A byte offset into the database file at which an array header begins.
///
/// Refs are always 8-byte aligned and never zero (zero is reserved to mean
/// "no ref" in optional-ref slots). A `Ref` is meaningful only together with
/// the [`crate::alloc::SlabAlloc`] that produced it — the same numeric value
/// can point to different bytes before and after a commit, since freed slab
/// regions are reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref(pub u64);

impl Ref {
    pub const NULL: Ref = Ref(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({:#x})", self.0)
    }
}

/// A slot in the top array can hold either a `Ref` to a child array, or a
/// small non-negative integer tagged inline. The tag is the low bit: an odd
/// value is `2*v + 1` for the stored integer `v`; an even value is a `Ref`.
///
/// This lets scalars like `logical_size` and `current_version` live directly
/// in the top array without a one-element child array to hold them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefOrTagged {
    Ref(Ref),
    Tagged(u64),
}

impl RefOrTagged {
    #[inline]
    pub fn from_raw(raw: u64) -> RefOrTagged {
        if raw & 1 == 1 {
            RefOrTagged::Tagged((raw - 1) / 2)
        } else {
            RefOrTagged::Ref(Ref(raw))
        }
    }

    #[inline]
    pub fn make_tagged(v: u64) -> RefOrTagged {
        RefOrTagged::Tagged(v)
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        match self {
            RefOrTagged::Ref(r) => r.0,
            RefOrTagged::Tagged(v) => 2 * v + 1,
        }
    }

    pub fn as_ref(self) -> Option<Ref> {
        match self {
            RefOrTagged::Ref(r) => Some(r),
            RefOrTagged::Tagged(_) => None,
        }
    }

    pub fn as_tagged(self) -> Option<u64> {
        match self {
            RefOrTagged::Tagged(v) => Some(v),
            RefOrTagged::Ref(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_round_trip() {
        for v in [0u64, 1, 2, 1000, u64::MAX / 4] {
            let t = RefOrTagged::make_tagged(v);
            assert_eq!(RefOrTagged::from_raw(t.to_raw()), t);
            assert_eq!(t.as_tagged(), Some(v));
        }
    }

    #[test]
    fn ref_round_trip() {
        for raw in [8u64, 16, 1 << 20] {
            let r = RefOrTagged::Ref(Ref(raw));
            assert_eq!(RefOrTagged::from_raw(r.to_raw()), r);
            assert_eq!(r.as_ref(), Some(Ref(raw)));
        }
    }
}
