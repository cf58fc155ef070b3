/// Converts a typed slot/index newtype into a plain `usize` suitable for indexing a `Vec`/slice.
///
/// Every stable handle the core hands out (`SlotIndex`, `WorkerId`, ...) is a thin newtype over
/// an integer so that a caller cannot accidentally mix up, say, a cache slot and a GC-set index.
/// This trait and its counterpart `FromIndex` are the two narrow seams where that newtype is
/// allowed to touch a raw `usize` again.
pub trait IntoIndex {
    fn into_index(self) -> usize;
}

/// The inverse of `IntoIndex`: builds a typed handle back up from a raw `usize`.
pub trait FromIndex {
    fn from_index(index: usize) -> Self;
}

impl IntoIndex for u64 {
    #[inline]
    fn into_index(self) -> usize {
        self as usize
    }
}

impl FromIndex for u64 {
    #[inline]
    fn from_index(index: usize) -> Self {
        index as u64
    }
}

impl IntoIndex for u32 {
    #[inline]
    fn into_index(self) -> usize {
        self as usize
    }
}

impl FromIndex for u32 {
    #[inline]
    fn from_index(index: usize) -> Self {
        index as u32
    }
}
