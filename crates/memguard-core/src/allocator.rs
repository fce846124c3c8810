//! `MemAllocator`: the facade callers allocate through.
//!
//! Owns both backends and forwards every operation to whichever one is
//! selected. Switching is only legal while the active backend holds no live
//! blocks; `&mut self` rules out concurrent calls during the switch.

use std::io::Write;
use std::sync::Arc;

use crate::backend::AllocBackend;
use crate::config::{AllocatorConfig, BackendKind};
use crate::diag::{DiagnosticRecord, Reporter};
use crate::error::AllocError;
use crate::light::LightBackend;
use crate::secured::SecuredBackend;
use crate::stats::MemStats;

/// Thread-safe allocator with a switchable backend.
#[derive(Debug)]
pub struct MemAllocator {
    kind: BackendKind,
    light: LightBackend,
    secured: SecuredBackend,
    reporter: Arc<Reporter>,
}

impl Default for MemAllocator {
    fn default() -> Self {
        Self::with_config(AllocatorConfig::default())
    }
}

impl MemAllocator {
    /// Allocator with default settings and the given backend active.
    #[must_use]
    pub fn new(backend: BackendKind) -> Self {
        Self::with_config(AllocatorConfig::default().with_backend(backend))
    }

    #[must_use]
    pub fn with_config(config: AllocatorConfig) -> Self {
        let reporter = Arc::new(Reporter::new(config.report_sink, config.history_capacity));
        Self {
            kind: config.backend,
            light: LightBackend::new(Arc::clone(&reporter)),
            secured: SecuredBackend::new(Arc::clone(&reporter), config.freed_history),
            reporter,
        }
    }

    /// Settings from `MEMGUARD_BACKEND` / `MEMGUARD_QUIET`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_config(AllocatorConfig::from_env())
    }

    /// Currently active backend.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.active().kind()
    }

    fn active(&self) -> &dyn AllocBackend {
        match self.kind {
            BackendKind::Light => &self.light,
            BackendKind::Secured => &self.secured,
        }
    }

    pub fn malloc(&self, len: usize, name: &'static str) -> *mut u8 {
        self.active().malloc(len, name)
    }

    /// `malloc(count * size)` with overflow checking.
    pub fn malloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8 {
        self.active().malloc_array(count, size, name)
    }

    /// Payload address is a multiple of `alignment` (raised to at least 8).
    pub fn malloc_aligned(&self, len: usize, alignment: usize, name: &'static str) -> *mut u8 {
        self.active().malloc_aligned(len, alignment, name)
    }

    pub fn calloc(&self, len: usize, name: &'static str) -> *mut u8 {
        self.active().calloc(len, name)
    }

    pub fn calloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8 {
        self.active().calloc_array(count, size, name)
    }

    /// Copy of the block at `ptr` with the same length and alignment.
    ///
    /// # Safety
    ///
    /// In light mode `ptr` must be null or a live block of this allocator.
    pub unsafe fn dupalloc(&self, ptr: *const u8, name: &'static str) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.active().dupalloc(ptr, name) }
    }

    /// Resize keeping the block's name. Bytes past the old length are zero.
    /// On failure null is returned and `ptr` stays valid.
    ///
    /// # Safety
    ///
    /// See [`MemAllocator::dupalloc`].
    pub unsafe fn realloc(&self, ptr: *mut u8, len: usize) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.active().realloc(ptr, len) }
    }

    /// Resize and rename.
    ///
    /// # Safety
    ///
    /// See [`MemAllocator::dupalloc`].
    pub unsafe fn realloc_id(&self, ptr: *mut u8, len: usize, name: &'static str) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.active().realloc_id(ptr, len, name) }
    }

    /// Release a block. Null and invalid pointers are reported, never fatal.
    ///
    /// # Safety
    ///
    /// See [`MemAllocator::dupalloc`]. The block must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: forwarded caller contract.
        unsafe { self.active().free(ptr) }
    }

    /// Verify every live block. Always true in light mode.
    pub fn check_memory(&self) -> bool {
        self.active().check_memory()
    }

    /// Sum of requested lengths of live blocks.
    #[must_use]
    pub fn get_mem_in_use(&self) -> usize {
        self.active().mem_in_use()
    }

    /// Number of live blocks.
    #[must_use]
    pub fn get_totblock(&self) -> usize {
        self.active().total_blocks()
    }

    #[must_use]
    pub fn memstats(&self) -> MemStats {
        self.active().memstats()
    }

    pub fn write_memstats<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        self.memstats().write_table(out)
    }

    /// Statistics table on stdout.
    pub fn print_memstats(&self) {
        let mut stdout = std::io::stdout().lock();
        // Nowhere left to report a failing stdout.
        let _ = self.write_memstats(&mut stdout);
    }

    /// Recently reported diagnostics, oldest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<DiagnosticRecord> {
        self.reporter.snapshot()
    }

    /// Shared diagnostic sink, for draining or JSONL export.
    #[must_use]
    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Requested length of a live block (secured mode only).
    #[must_use]
    pub fn block_len(&self, ptr: *const u8) -> Option<usize> {
        match self.kind {
            BackendKind::Secured => self.secured.block_len(ptr),
            BackendKind::Light => None,
        }
    }

    /// Name of a live block (secured mode only).
    #[must_use]
    pub fn block_name(&self, ptr: *const u8) -> Option<&'static str> {
        match self.kind {
            BackendKind::Secured => self.secured.block_name(ptr),
            BackendKind::Light => None,
        }
    }

    /// Route all subsequent calls to the secured backend.
    ///
    /// # Panics
    ///
    /// If any block is live.
    pub fn use_secured_backend(&mut self) {
        self.switch_to(BackendKind::Secured);
    }

    /// Route all subsequent calls to the light backend.
    ///
    /// # Panics
    ///
    /// If any block is live.
    pub fn use_light_backend(&mut self) {
        self.switch_to(BackendKind::Light);
    }

    fn switch_to(&mut self, target: BackendKind) {
        let live_blocks = self.get_totblock();
        if live_blocks != 0 {
            let err = AllocError::ModeSwitchViolation { live_blocks };
            let in_use = self.get_mem_in_use();
            self.reporter.report(self.kind, "switch_backend", &err, in_use);
            if err.is_fatal() {
                panic!("{err}");
            }
            return;
        }
        if self.kind != target {
            self.reporter.note(
                target,
                "switch_backend",
                "backend_switch",
                format!("{} -> {}", self.kind, target),
            );
            self.kind = target;
        }
    }
}
