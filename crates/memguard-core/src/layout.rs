//! Size and alignment arithmetic shared by both backends.

use crate::error::AllocError;

/// Native pointer size. Payload pointers are always a multiple of this.
pub const WORD: usize = size_of::<usize>();

/// Smallest alignment honored by `malloc_aligned`; smaller requests are raised to it.
pub const MIN_ALIGNMENT: usize = 8;

/// Alignments must stay strictly below this bound.
pub const MAX_ALIGNMENT: usize = 1024;

/// Round `len` up to a multiple of 4.
#[must_use]
pub const fn align4(len: usize) -> Option<usize> {
    match len.checked_add(3) {
        Some(v) => Some(v & !3),
        None => None,
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub const fn round_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Clamp and validate a caller alignment.
///
/// Values below [`MIN_ALIGNMENT`] are raised to it; the result must be a power
/// of two strictly below [`MAX_ALIGNMENT`].
pub fn normalize_alignment(
    op: &'static str,
    alignment: usize,
    name: &'static str,
) -> Result<usize, AllocError> {
    let alignment = alignment.max(MIN_ALIGNMENT);
    if alignment >= MAX_ALIGNMENT || !alignment.is_power_of_two() {
        return Err(AllocError::InvalidAlignment {
            op,
            name,
            alignment,
        });
    }
    Ok(alignment)
}

/// True when `addr` could be a payload pointer handed out by either backend.
#[must_use]
pub const fn is_word_aligned(addr: usize) -> bool {
    addr & (WORD - 1) == 0
}

/// `count * size` for the array variants.
#[must_use]
pub const fn array_len(count: usize, size: usize) -> Option<usize> {
    count.checked_mul(size)
}
