//! Light backend: system allocator passthrough with a one-word header.
//!
//! Block layout (plain):
//!
//! ```text
//! [len_word][payload ...]
//! ```
//!
//! Block layout (aligned, `span = round_up(2 * WORD, alignment)`):
//!
//! ```text
//! [padding][alignment][len_word][payload ...]
//! |<-------- span ------------->|
//! ```
//!
//! `len_word` stores the requested length shifted left by one with bit 0 set
//! for aligned blocks, so the word directly before the payload is always
//! enough to find the start of the system allocation. There is no corruption
//! detection here.

use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::AllocBackend;
use crate::config::BackendKind;
use crate::diag::Reporter;
use crate::error::AllocError;
use crate::layout::{WORD, align4, array_len, is_word_aligned, normalize_alignment, round_up};
use crate::stats::MemStats;

const ALIGNED_FLAG: usize = 1;

#[derive(Debug, Default)]
struct Counters {
    total_blocks: usize,
    mem_in_use: usize,
}

/// Header facts decoded from the words in front of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LightHeader {
    len: usize,
    /// 0 for plain blocks.
    alignment: usize,
}

impl LightHeader {
    fn encode_len(len: usize, aligned: bool) -> usize {
        (len << 1) | usize::from(aligned)
    }

    /// # Safety
    ///
    /// `payload` must be a live payload pointer of this backend.
    unsafe fn read(payload: *const u8) -> Self {
        // SAFETY: caller guarantees the header words precede `payload`.
        unsafe {
            let len_word = payload.sub(WORD).cast::<usize>().read();
            let alignment = if len_word & ALIGNED_FLAG != 0 {
                payload.sub(2 * WORD).cast::<usize>().read()
            } else {
                0
            };
            Self {
                len: len_word >> 1,
                alignment,
            }
        }
    }

    /// Start of the underlying system allocation.
    ///
    /// # Safety
    ///
    /// Same as [`LightHeader::read`], with `self` read from `payload`.
    unsafe fn base(self, payload: *mut u8) -> *mut u8 {
        let span = if self.alignment == 0 {
            WORD
        } else {
            aligned_span(self.alignment)
        };
        // SAFETY: the span was reserved in front of the payload at allocation.
        unsafe { payload.sub(span) }
    }
}

fn aligned_span(alignment: usize) -> usize {
    // Cannot overflow: alignment < 1024.
    (2 * WORD).next_multiple_of(alignment)
}

/// Counter-only allocator backend.
#[derive(Debug)]
pub struct LightBackend {
    counters: Mutex<Counters>,
    reporter: Arc<Reporter>,
}

impl LightBackend {
    #[must_use]
    pub fn new(reporter: Arc<Reporter>) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            reporter,
        }
    }

    fn report(&self, op: &'static str, err: AllocError) {
        let in_use = self.mem_in_use();
        self.reporter.report(BackendKind::Light, op, &err, in_use);
    }

    fn fail(&self, op: &'static str, len: usize, name: &'static str) -> *mut u8 {
        let in_use = self.mem_in_use();
        self.report(
            op,
            AllocError::AllocationFailure {
                op,
                name,
                requested: len,
                in_use,
            },
        );
        ptr::null_mut()
    }

    fn account_alloc(&self, len: usize) {
        let mut counters = self.counters.lock();
        counters.total_blocks += 1;
        counters.mem_in_use += len;
    }

    fn alloc_plain(
        &self,
        op: &'static str,
        len: usize,
        name: &'static str,
        zeroed: bool,
    ) -> *mut u8 {
        let Some(total) = align4(len).and_then(|l| l.checked_add(WORD)) else {
            return self.fail(op, len, name);
        };
        if len > usize::MAX >> 1 {
            return self.fail(op, len, name);
        }

        // SAFETY: plain libc allocation calls with a non-zero size.
        let base = unsafe {
            if zeroed {
                libc::calloc(1, total)
            } else {
                libc::malloc(total)
            }
        }
        .cast::<u8>();
        if base.is_null() {
            return self.fail(op, len, name);
        }

        // SAFETY: `base` is valid for `total >= WORD` bytes and malloc'd memory
        // is suitably aligned for a usize.
        let payload = unsafe {
            base.cast::<usize>().write(LightHeader::encode_len(len, false));
            base.add(WORD)
        };
        self.account_alloc(len);
        payload
    }

    fn alloc_aligned(
        &self,
        op: &'static str,
        len: usize,
        alignment: usize,
        name: &'static str,
        zeroed: bool,
    ) -> *mut u8 {
        let alignment = match normalize_alignment(op, alignment, name) {
            Ok(a) => a,
            Err(err) => {
                self.report(op, err);
                return ptr::null_mut();
            }
        };
        let span = aligned_span(alignment);
        // Body rounded to the alignment keeps the whole block a multiple of it.
        let body = align4(len)
            .and_then(|l| round_up(l.max(1), alignment))
            .filter(|_| len <= usize::MAX >> 1);
        let Some(total) = body.and_then(|b| b.checked_add(span)) else {
            return self.fail(op, len, name);
        };

        let mut raw: *mut libc::c_void = ptr::null_mut();
        // SAFETY: alignment is a power of two and a multiple of size_of::<*mut c_void>().
        let rc = unsafe { libc::posix_memalign(&mut raw, alignment, total) };
        if rc != 0 || raw.is_null() {
            return self.fail(op, len, name);
        }

        let base = raw.cast::<u8>();
        // SAFETY: `base` is valid for `total` bytes; `span >= 2 * WORD` and both
        // header words are word aligned because `alignment >= WORD`.
        let payload = unsafe {
            if zeroed {
                ptr::write_bytes(base, 0, total);
            }
            let payload = base.add(span);
            payload.sub(2 * WORD).cast::<usize>().write(alignment);
            payload
                .sub(WORD)
                .cast::<usize>()
                .write(LightHeader::encode_len(len, true));
            payload
        };
        self.account_alloc(len);
        payload
    }

    /// Allocate a block shaped like `header` (same alignment), zero-filled.
    fn alloc_like(
        &self,
        op: &'static str,
        header: LightHeader,
        len: usize,
        name: &'static str,
    ) -> *mut u8 {
        if header.alignment == 0 {
            self.alloc_plain(op, len, name, true)
        } else {
            self.alloc_aligned(op, len, header.alignment, name, true)
        }
    }
}

impl AllocBackend for LightBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Light
    }

    fn malloc(&self, len: usize, name: &'static str) -> *mut u8 {
        self.alloc_plain("malloc", len, name, false)
    }

    fn malloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8 {
        match array_len(count, size) {
            Some(len) => self.alloc_plain("malloc_array", len, name, false),
            None => self.fail("malloc_array", usize::MAX, name),
        }
    }

    fn malloc_aligned(&self, len: usize, alignment: usize, name: &'static str) -> *mut u8 {
        self.alloc_aligned("malloc_aligned", len, alignment, name, false)
    }

    fn calloc(&self, len: usize, name: &'static str) -> *mut u8 {
        self.alloc_plain("calloc", len, name, true)
    }

    fn calloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8 {
        match array_len(count, size) {
            Some(len) => self.alloc_plain("calloc_array", len, name, true),
            None => self.fail("calloc_array", usize::MAX, name),
        }
    }

    unsafe fn dupalloc(&self, ptr: *const u8, name: &'static str) -> *mut u8 {
        if ptr.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: caller contract, `ptr` is a live block of this backend.
        let header = unsafe { LightHeader::read(ptr) };
        let dup = if header.alignment == 0 {
            self.alloc_plain("dupalloc", header.len, name, false)
        } else {
            self.alloc_aligned("dupalloc", header.len, header.alignment, name, false)
        };
        if !dup.is_null() {
            // SAFETY: both blocks hold at least `header.len` payload bytes.
            unsafe { ptr::copy_nonoverlapping(ptr, dup, header.len) };
        }
        dup
    }

    unsafe fn realloc(&self, ptr: *mut u8, len: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_plain("realloc", len, "realloc", false);
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.realloc_id(ptr, len, "realloc") }
    }

    unsafe fn realloc_id(&self, ptr: *mut u8, len: usize, name: &'static str) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_plain("realloc_id", len, name, false);
        }
        // SAFETY: caller contract, `ptr` is a live block of this backend.
        let header = unsafe { LightHeader::read(ptr) };
        let fresh = self.alloc_like("realloc_id", header, len, name);
        if fresh.is_null() {
            // The old block stays valid when the replacement fails.
            return fresh;
        }
        // SAFETY: both blocks are live and distinct; copy within both lengths.
        unsafe {
            ptr::copy_nonoverlapping(ptr, fresh, header.len.min(len));
            self.free(ptr);
        }
        fresh
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            self.report("free", AllocError::NullPointer { op: "free" });
            return;
        }
        if !is_word_aligned(ptr as usize) {
            self.report(
                "free",
                AllocError::InvalidPointer {
                    op: "free",
                    addr: ptr as usize,
                    reason: "attempt to free illegal pointer",
                },
            );
            return;
        }

        // SAFETY: caller contract, `ptr` is a live block of this backend.
        let header = unsafe { LightHeader::read(ptr) };
        {
            let mut counters = self.counters.lock();
            counters.total_blocks = counters.total_blocks.saturating_sub(1);
            counters.mem_in_use = counters.mem_in_use.saturating_sub(header.len);
        }
        // SAFETY: `base` is the pointer libc returned for this block.
        unsafe { libc::free(header.base(ptr).cast::<libc::c_void>()) };
    }

    fn memstats(&self) -> MemStats {
        let counters = self.counters.lock();
        MemStats {
            backend: BackendKind::Light,
            mem_in_use: counters.mem_in_use,
            total_blocks: counters.total_blocks,
            entries: Vec::new(),
        }
    }

    fn check_memory(&self) -> bool {
        true
    }

    fn mem_in_use(&self) -> usize {
        self.counters.lock().mem_in_use
    }

    fn total_blocks(&self) -> usize {
        self.counters.lock().total_blocks
    }
}
