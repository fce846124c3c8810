//! The uniform operation set both backends implement.

use crate::config::BackendKind;
use crate::stats::MemStats;

/// Strategy interface behind [`crate::MemAllocator`].
///
/// Allocation functions return a payload pointer, or null after reporting the
/// failure on the diagnostic channel. `name` is only borrowed: the label must
/// outlive the block, which `&'static str` guarantees.
pub trait AllocBackend: Send + Sync {
    /// Backend selector this implementation answers to.
    fn kind(&self) -> BackendKind;

    fn malloc(&self, len: usize, name: &'static str) -> *mut u8;

    fn malloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8;

    fn malloc_aligned(&self, len: usize, alignment: usize, name: &'static str) -> *mut u8;

    /// Zero-initialized `malloc`.
    fn calloc(&self, len: usize, name: &'static str) -> *mut u8;

    fn calloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8;

    /// Allocate a block with the same size and alignment as `ptr` and copy its payload.
    ///
    /// # Safety
    ///
    /// See [`AllocBackend::free`] for the pointer contract.
    unsafe fn dupalloc(&self, ptr: *const u8, name: &'static str) -> *mut u8;

    /// Resize `ptr`, keeping its name.
    ///
    /// # Safety
    ///
    /// See [`AllocBackend::free`] for the pointer contract.
    unsafe fn realloc(&self, ptr: *mut u8, len: usize) -> *mut u8;

    /// Resize `ptr` under a new name.
    ///
    /// # Safety
    ///
    /// See [`AllocBackend::free`] for the pointer contract.
    unsafe fn realloc_id(&self, ptr: *mut u8, len: usize, name: &'static str) -> *mut u8;

    /// Release a block.
    ///
    /// # Safety
    ///
    /// - Light backend: `ptr` must be null or a live payload pointer returned by
    ///   this backend; the header in front of it is trusted.
    /// - Secured backend: any pointer value is accepted and diagnosed, but a
    ///   live block must not be freed concurrently with other operations on
    ///   the same block.
    unsafe fn free(&self, ptr: *mut u8);

    /// Structured form of the statistics table.
    fn memstats(&self) -> MemStats;

    /// `true` when no corruption is detected.
    fn check_memory(&self) -> bool;

    /// Bytes currently handed out (sum of requested lengths over live blocks).
    fn mem_in_use(&self) -> usize;

    /// Number of live blocks.
    fn total_blocks(&self) -> usize;
}
