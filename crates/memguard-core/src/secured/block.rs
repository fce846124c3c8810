//! Secured block layout: head guard tags, payload, tail guard tag.
//!
//! ```text
//! base
//! |<--------- header_offset --------->|
//! [ alignment padding ][ BlockHeader ][ payload (len bytes) ][ tail tag ]
//!                                     ^ payload pointer
//! ```
//!
//! The tail tag sits immediately after the requested length, so it is
//! written and read unaligned. Everything the allocator needs to release the
//! block is mirrored in the registry; the in-band header and tail exist only
//! to be checked.

use std::alloc::Layout;
use std::ptr;

use crate::layout::{MIN_ALIGNMENT, round_up};

/// First head tag of a live block.
pub const HEAD_TAG1: u32 = 0x4D45_4D31;
/// Second head tag of a live block.
pub const HEAD_TAG2: u32 = 0x4D45_4D32;
/// Tail tag of a live block.
pub const TAIL_TAG: u64 = 0x4D45_4D33_5441_494C;
/// Head tag value written on release.
pub const FREED_TAG: u32 = 0x4652_4545;
/// Tail tag value written on release.
pub const FREED_TAIL: u64 = 0x4652_4545_4652_4545;

/// Bytes occupied by the tail tag.
pub const TAIL_SIZE: usize = size_of::<u64>();

/// Alignment used for blocks allocated without an explicit one.
const NATURAL_ALIGN: usize = 16;

/// In-band header placed right before the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    pub tag1: u32,
    /// 0 for natural alignment.
    pub alignment: u32,
    pub len: usize,
    /// Registry slot owning this block.
    pub slot: usize,
    pub tag2: u32,
    reserved: u32,
}

/// Header size in bytes.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

impl BlockHeader {
    #[must_use]
    pub fn live(len: usize, alignment: usize, slot: usize) -> Self {
        Self {
            tag1: HEAD_TAG1,
            alignment: alignment as u32,
            len,
            slot,
            tag2: HEAD_TAG2,
            reserved: 0,
        }
    }

    /// Both head tags hold the live values.
    #[must_use]
    pub const fn tags_valid(&self) -> bool {
        self.tag1 == HEAD_TAG1 && self.tag2 == HEAD_TAG2
    }

    /// Both head tags hold the released sentinel.
    #[must_use]
    pub const fn tags_freed(&self) -> bool {
        self.tag1 == FREED_TAG && self.tag2 == FREED_TAG
    }
}

/// Geometry of one secured block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Layout handed to `std::alloc`.
    pub layout: Layout,
    /// Offset of the header from the allocation base.
    pub header_offset: usize,
    /// Offset of the payload from the allocation base.
    pub payload_offset: usize,
    /// Requested payload length.
    pub len: usize,
    /// Caller alignment, 0 for natural.
    pub alignment: usize,
}

impl BlockLayout {
    /// Compute the geometry for `len` payload bytes.
    ///
    /// `alignment` is 0 for natural alignment or an already-normalized
    /// power of two. Returns `None` on arithmetic overflow or an unsupported
    /// layout.
    #[must_use]
    pub fn new(len: usize, alignment: usize) -> Option<Self> {
        let align = if alignment == 0 {
            NATURAL_ALIGN
        } else {
            alignment.max(MIN_ALIGNMENT)
        }
        .max(align_of::<BlockHeader>());
        let payload_offset = round_up(HEADER_SIZE, align)?;
        let body = len.checked_add(TAIL_SIZE)?;
        // Keep the total a multiple of the alignment.
        let size = round_up(payload_offset.checked_add(body)?, align)?;
        let layout = Layout::from_size_align(size, align).ok()?;
        Some(Self {
            layout,
            header_offset: payload_offset - HEADER_SIZE,
            payload_offset,
            len,
            alignment,
        })
    }
}

/// Raw view of a secured block's in-band guards.
#[derive(Debug, Clone, Copy)]
pub struct BlockPtr {
    base: *mut u8,
    geometry: BlockLayout,
}

impl BlockPtr {
    /// Allocate fresh memory for `geometry`.
    #[must_use]
    pub fn allocate(geometry: BlockLayout, zeroed: bool) -> Option<Self> {
        // SAFETY: layout size is non-zero (it always includes header and tail).
        let base = unsafe {
            if zeroed {
                std::alloc::alloc_zeroed(geometry.layout)
            } else {
                std::alloc::alloc(geometry.layout)
            }
        };
        if base.is_null() {
            return None;
        }
        Some(Self { base, geometry })
    }

    /// Rebuild from the base address recorded in the registry.
    ///
    /// # Safety
    ///
    /// `base` must be the start of a live allocation made with `geometry`.
    #[must_use]
    pub unsafe fn from_base(base: usize, geometry: BlockLayout) -> Self {
        Self {
            base: base as *mut u8,
            geometry,
        }
    }

    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    #[must_use]
    pub fn payload(&self) -> *mut u8 {
        // SAFETY: payload_offset lies within the allocation.
        unsafe { self.base.add(self.geometry.payload_offset) }
    }

    fn header_ptr(&self) -> *mut BlockHeader {
        // SAFETY: header_offset lies within the allocation and is aligned for
        // BlockHeader because payload_offset is a multiple of its alignment.
        unsafe { self.base.add(self.geometry.header_offset).cast::<BlockHeader>() }
    }

    fn tail_ptr(&self) -> *mut u8 {
        // SAFETY: the tail occupies [payload + len, payload + len + TAIL_SIZE).
        unsafe { self.payload().add(self.geometry.len) }
    }

    /// Write live head and tail tags.
    pub fn write_guards(&self, slot: usize) {
        let header = BlockHeader::live(self.geometry.len, self.geometry.alignment, slot);
        // SAFETY: see header_ptr / tail_ptr.
        unsafe {
            self.header_ptr().write(header);
            self.tail_ptr().cast::<u64>().write_unaligned(TAIL_TAG);
        }
    }

    /// Point the header at another registry slot.
    pub fn set_slot(&self, slot: usize) {
        // SAFETY: see header_ptr.
        unsafe { (*self.header_ptr()).slot = slot };
    }

    /// Current header contents. Any bit pattern is a valid `BlockHeader`.
    #[must_use]
    pub fn header(&self) -> BlockHeader {
        // SAFETY: see header_ptr.
        unsafe { self.header_ptr().read() }
    }

    #[must_use]
    pub fn tail(&self) -> u64 {
        // SAFETY: see tail_ptr.
        unsafe { self.tail_ptr().cast::<u64>().read_unaligned() }
    }

    /// Head tags are live and agree with the registry's view of the block.
    #[must_use]
    pub fn header_intact(&self, slot: usize) -> bool {
        let header = self.header();
        header.tags_valid() && header.len == self.geometry.len && header.slot == slot
    }

    #[must_use]
    pub fn tail_intact(&self) -> bool {
        self.tail() == TAIL_TAG
    }

    /// Mark head and tail tags as released.
    pub fn mark_freed(&self) {
        // SAFETY: see header_ptr / tail_ptr.
        unsafe {
            let header = self.header_ptr();
            (*header).tag1 = FREED_TAG;
            (*header).tag2 = FREED_TAG;
            self.tail_ptr().cast::<u64>().write_unaligned(FREED_TAIL);
        }
    }

    /// Return the memory to the system allocator.
    ///
    /// # Safety
    ///
    /// The block must not be used afterwards.
    pub unsafe fn release(self) {
        // SAFETY: `base` was returned by std::alloc for this layout.
        unsafe { std::alloc::dealloc(self.base, self.geometry.layout) };
    }

    /// Copy `len` payload bytes into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` writes, `len <= self.geometry.len`.
    pub unsafe fn copy_payload_to(&self, dst: *mut u8, len: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { ptr::copy_nonoverlapping(self.payload(), dst, len) };
    }
}
