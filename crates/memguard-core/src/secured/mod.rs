//! Secured backend: guard tags, named blocks and a registry of live blocks.
//!
//! Every block carries head tags before the payload and a tail tag right
//! after it, and is linked into the [`Registry`]. `free` checks the guards
//! before releasing; when they are damaged it scans the registry forward and
//! backward to name what it can, reports, and always finishes by fully
//! unlinking the damaged block so the registry never stays half repaired.
//!
//! One `parking_lot::Mutex` guards the registry, the counters and the
//! released-address history. Payload copies for `realloc`/`dupalloc` run
//! outside of it.

pub mod block;
pub mod registry;

use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::AllocBackend;
use crate::config::BackendKind;
use crate::diag::Reporter;
use crate::error::AllocError;
use crate::layout::{array_len, is_word_aligned, normalize_alignment};
use crate::stats::{MemStats, aggregate};

use block::{BlockLayout, BlockPtr};
use registry::{Node, Registry, Walk};

const NO_NAME: &str = "no name found";

/// Bounded memory of released payload addresses.
#[derive(Debug)]
struct FreedHistory {
    order: VecDeque<(usize, u64)>,
    members: HashMap<usize, u64>,
    capacity: usize,
    stamp: u64,
}

impl FreedHistory {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashMap::new(),
            capacity,
            stamp: 0,
        }
    }

    fn remember(&mut self, addr: usize) {
        if self.capacity == 0 {
            return;
        }
        self.stamp += 1;
        self.members.insert(addr, self.stamp);
        self.order.push_back((addr, self.stamp));
        while self.order.len() > self.capacity {
            if let Some((old, stamp)) = self.order.pop_front() {
                if self.members.get(&old) == Some(&stamp) {
                    self.members.remove(&old);
                }
            }
        }
    }

    /// The address was handed out again.
    fn forget(&mut self, addr: usize) {
        self.members.remove(&addr);
    }

    fn contains(&self, addr: usize) -> bool {
        self.members.contains_key(&addr)
    }
}

#[derive(Debug)]
struct SecuredState {
    registry: Registry,
    total_blocks: usize,
    mem_in_use: usize,
    freed: FreedHistory,
}

impl SecuredState {
    /// Unlink `slot`, settle counters and remember its address.
    fn retire(&mut self, slot: usize) -> Option<Node> {
        let node = self.registry.unlink(slot)?;
        self.total_blocks = self.total_blocks.saturating_sub(1);
        self.mem_in_use = self.mem_in_use.saturating_sub(node.geometry.len);
        self.freed.remember(node.payload);
        Some(node)
    }
}

/// Outcome of a forward + backward registry scan.
#[derive(Debug, Clone, Copy)]
struct Scan {
    forward: Walk,
    backward: Walk,
    /// Name the predecessor of the located block recorded for it.
    breadcrumb: Option<&'static str>,
}

impl Scan {
    /// Walks stopped at different blocks.
    fn diverged(&self) -> bool {
        self.forward.stop != self.backward.stop
    }

    /// First block with damaged head tags seen from the front.
    fn corrupt(&self) -> Option<usize> {
        self.forward.stop
    }
}

/// Diagnostic allocator backend.
#[derive(Debug)]
pub struct SecuredBackend {
    state: Mutex<SecuredState>,
    reporter: Arc<Reporter>,
}

impl SecuredBackend {
    #[must_use]
    pub fn new(reporter: Arc<Reporter>, freed_history: usize) -> Self {
        Self {
            state: Mutex::new(SecuredState {
                registry: Registry::new(),
                total_blocks: 0,
                mem_in_use: 0,
                freed: FreedHistory::new(freed_history),
            }),
            reporter,
        }
    }

    /// Name of the live block at `ptr`.
    #[must_use]
    pub fn block_name(&self, ptr: *const u8) -> Option<&'static str> {
        let state = self.state.lock();
        let slot = state.registry.lookup(ptr as usize)?;
        state.registry.get(slot).map(|n| n.name)
    }

    /// Requested length of the live block at `ptr`.
    #[must_use]
    pub fn block_len(&self, ptr: *const u8) -> Option<usize> {
        let state = self.state.lock();
        let slot = state.registry.lookup(ptr as usize)?;
        state.registry.get(slot).map(|n| n.geometry.len)
    }

    fn report_all(&self, op: &'static str, errors: &[AllocError], in_use: usize) {
        for err in errors {
            self.reporter.report(BackendKind::Secured, op, err, in_use);
        }
    }

    fn report(&self, op: &'static str, err: AllocError) {
        let in_use = self.mem_in_use();
        self.report_all(op, &[err], in_use);
    }

    fn fail(&self, op: &'static str, len: usize, name: &'static str) -> *mut u8 {
        let in_use = self.mem_in_use();
        self.report_all(
            op,
            &[AllocError::AllocationFailure {
                op,
                name,
                requested: len,
                in_use,
            }],
            in_use,
        );
        ptr::null_mut()
    }

    /// Allocate, guard and register a block. `alignment` is 0 or normalized.
    fn alloc(
        &self,
        op: &'static str,
        len: usize,
        alignment: usize,
        name: &'static str,
        zeroed: bool,
    ) -> *mut u8 {
        let Some(geometry) = BlockLayout::new(len, alignment) else {
            return self.fail(op, len, name);
        };
        let Some(block) = BlockPtr::allocate(geometry, zeroed) else {
            return self.fail(op, len, name);
        };
        block.write_guards(usize::MAX);

        let mut state = self.state.lock();
        let slot = state.registry.append(Node::new(name, &block, geometry));
        block.set_slot(slot);
        state.total_blocks += 1;
        state.mem_in_use += len;
        state.freed.forget(block.payload() as usize);
        drop(state);

        block.payload()
    }

    fn alloc_aligned(
        &self,
        op: &'static str,
        len: usize,
        alignment: usize,
        name: &'static str,
    ) -> *mut u8 {
        match normalize_alignment(op, alignment, name) {
            Ok(alignment) => self.alloc(op, len, alignment, name, false),
            Err(err) => {
                self.report(op, err);
                ptr::null_mut()
            }
        }
    }

    /// Reject null, misaligned, released and untracked pointers.
    fn reject(&self, op: &'static str, addr: usize, state: &SecuredState) -> Option<AllocError> {
        if addr == 0 {
            return Some(AllocError::NullPointer { op });
        }
        if !is_word_aligned(addr) {
            return Some(AllocError::InvalidPointer {
                op,
                addr,
                reason: "attempt to free illegal pointer",
            });
        }
        if state.registry.lookup(addr).is_some() {
            return None;
        }
        if state.freed.contains(addr) {
            Some(AllocError::DoubleFree { name: None, addr })
        } else {
            Some(AllocError::InvalidPointer {
                op,
                addr,
                reason: "pointer not in memlist (possibly freed earlier)",
            })
        }
    }

    /// Registry entry for a live block, reporting when there is none.
    fn tracked(&self, op: &'static str, ptr: *const u8) -> Option<Node> {
        let addr = ptr as usize;
        let state = self.state.lock();
        if let Some(err) = self.reject(op, addr, &state) {
            let in_use = state.mem_in_use;
            drop(state);
            self.report_all(op, &[err], in_use);
            return None;
        }
        state
            .registry
            .lookup(addr)
            .and_then(|slot| state.registry.get(slot))
            .cloned()
    }

    fn resize(
        &self,
        op: &'static str,
        ptr: *mut u8,
        len: usize,
        name: Option<&'static str>,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(op, len, 0, name.unwrap_or(op), false);
        }
        let Some(source) = self.tracked(op, ptr) else {
            return ptr::null_mut();
        };
        let name = name.unwrap_or(source.name);

        let fresh = self.alloc(op, len, source.geometry.alignment, name, true);
        if fresh.is_null() {
            return fresh;
        }
        // SAFETY: `source` was live when looked up and both payloads hold at
        // least `min(old, new)` bytes.
        unsafe {
            source
                .block()
                .copy_payload_to(fresh, source.geometry.len.min(len));
        }
        self.release(op, ptr);
        fresh
    }

    /// Forward + backward scan for damaged head tags. The breadcrumb comes
    /// from `target`'s predecessor, or from the last intact block seen from
    /// the front when there is no target.
    fn scan(registry: &Registry, target: Option<usize>) -> Scan {
        let intact = |slot: usize, node: &Node| node.block().header_intact(slot);
        let forward = registry.walk_forward(intact);
        let backward = registry.walk_backward(intact);

        let predecessor = match target {
            Some(t) => registry.get(t).and_then(|n| n.prev),
            None => forward.last_fine,
        };
        let breadcrumb = predecessor
            .and_then(|slot| registry.get(slot))
            .and_then(|n| n.next_name);

        Scan {
            forward,
            backward,
            breadcrumb,
        }
    }

    fn release(&self, op: &'static str, ptr: *mut u8) {
        let addr = ptr as usize;
        let mut state = self.state.lock();
        if let Some(err) = self.reject(op, addr, &state) {
            let in_use = state.mem_in_use;
            drop(state);
            self.report_all(op, &[err], in_use);
            return;
        }
        let Some((slot, node)) = state
            .registry
            .lookup(addr)
            .and_then(|slot| state.registry.get(slot).map(|n| (slot, n.clone())))
        else {
            return;
        };

        let block = node.block();
        if block.header().tags_freed() {
            let in_use = state.mem_in_use;
            drop(state);
            self.report_all(
                op,
                &[AllocError::DoubleFree {
                    name: Some(node.name),
                    addr,
                }],
                in_use,
            );
            return;
        }

        let head_ok = block.header_intact(slot);
        if head_ok && block.tail_intact() {
            block.mark_freed();
            state.retire(slot);
            drop(state);
            // SAFETY: the block is unlinked and no longer reachable.
            unsafe { block.release() };
            return;
        }

        let scan = Self::scan(&state.registry, Some(slot));
        let mut errors = Vec::new();
        if head_ok {
            errors.push(AllocError::TailCorruption {
                name: node.name,
                breadcrumb: scan.breadcrumb.unwrap_or(NO_NAME),
            });
        } else {
            errors.push(AllocError::HeaderCorruption { name: node.name });
        }
        let mut others = vec![scan.corrupt(), scan.backward.stop];
        others.dedup();
        for other in others.into_iter().flatten() {
            if other != slot
                && let Some(n) = state.registry.get(other)
            {
                errors.push(AllocError::HeaderCorruption { name: n.name });
            }
        }
        if scan.diverged() {
            errors.push(AllocError::RegistryCorruption {
                detail: "more than one memory block corrupt".to_string(),
            });
        }

        // Unlink and release through the registry's layout record in every case.
        block.mark_freed();
        state.retire(slot);
        let in_use = state.mem_in_use;
        drop(state);
        // SAFETY: base and layout come from the registry, not the damaged header.
        unsafe { block.release() };
        self.report_all(op, &errors, in_use);
    }
}

impl AllocBackend for SecuredBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Secured
    }

    fn malloc(&self, len: usize, name: &'static str) -> *mut u8 {
        self.alloc("malloc", len, 0, name, false)
    }

    fn malloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8 {
        match array_len(count, size) {
            Some(len) => self.alloc("malloc_array", len, 0, name, false),
            None => self.fail("malloc_array", usize::MAX, name),
        }
    }

    fn malloc_aligned(&self, len: usize, alignment: usize, name: &'static str) -> *mut u8 {
        self.alloc_aligned("malloc_aligned", len, alignment, name)
    }

    fn calloc(&self, len: usize, name: &'static str) -> *mut u8 {
        self.alloc("calloc", len, 0, name, true)
    }

    fn calloc_array(&self, count: usize, size: usize, name: &'static str) -> *mut u8 {
        match array_len(count, size) {
            Some(len) => self.alloc("calloc_array", len, 0, name, true),
            None => self.fail("calloc_array", usize::MAX, name),
        }
    }

    unsafe fn dupalloc(&self, ptr: *const u8, name: &'static str) -> *mut u8 {
        if ptr.is_null() {
            return ptr::null_mut();
        }
        let Some(source) = self.tracked("dupalloc", ptr) else {
            return ptr::null_mut();
        };
        let len = source.geometry.len;
        let dup = self.alloc("dupalloc", len, source.geometry.alignment, name, false);
        if !dup.is_null() {
            // SAFETY: both blocks hold `len` payload bytes.
            unsafe { source.block().copy_payload_to(dup, len) };
        }
        dup
    }

    unsafe fn realloc(&self, ptr: *mut u8, len: usize) -> *mut u8 {
        self.resize("realloc", ptr, len, None)
    }

    unsafe fn realloc_id(&self, ptr: *mut u8, len: usize, name: &'static str) -> *mut u8 {
        self.resize("realloc_id", ptr, len, Some(name))
    }

    unsafe fn free(&self, ptr: *mut u8) {
        self.release("free", ptr);
    }

    fn memstats(&self) -> MemStats {
        let state = self.state.lock();
        let blocks: Vec<_> = state
            .registry
            .iter()
            .map(|(_, n)| (n.name, n.geometry.len))
            .collect();
        let (mem_in_use, total_blocks) = (state.mem_in_use, state.total_blocks);
        drop(state);

        MemStats {
            backend: BackendKind::Secured,
            mem_in_use,
            total_blocks,
            entries: aggregate(blocks),
        }
    }

    fn check_memory(&self) -> bool {
        let state = self.state.lock();
        let guarded = |slot: usize, node: &Node| {
            let block = node.block();
            block.header_intact(slot) && block.tail_intact()
        };
        let forward = state.registry.walk_forward(guarded);
        let backward = state.registry.walk_backward(guarded);

        let healthy = forward.stop.is_none()
            && backward.stop.is_none()
            && forward.visited == backward.visited
            && forward.visited == state.total_blocks
            && state.registry.len() == state.total_blocks;
        if healthy {
            return true;
        }

        let mut errors = Vec::new();
        let mut seen = Vec::new();
        for slot in [forward.stop, backward.stop].into_iter().flatten() {
            if seen.contains(&slot) {
                continue;
            }
            seen.push(slot);
            let Some(node) = state.registry.get(slot) else {
                continue;
            };
            if node.block().header_intact(slot) {
                let breadcrumb = node
                    .prev
                    .and_then(|p| state.registry.get(p))
                    .and_then(|p| p.next_name)
                    .unwrap_or(NO_NAME);
                errors.push(AllocError::TailCorruption {
                    name: node.name,
                    breadcrumb,
                });
            } else {
                errors.push(AllocError::HeaderCorruption { name: node.name });
            }
        }
        if forward.stop != backward.stop {
            errors.push(AllocError::RegistryCorruption {
                detail: "more than one memory block corrupt".to_string(),
            });
        } else if forward.stop.is_none() {
            errors.push(AllocError::RegistryCorruption {
                detail: format!(
                    "forward walk saw {} block(s), backward walk {}, counter {}",
                    forward.visited, backward.visited, state.total_blocks
                ),
            });
        }
        let in_use = state.mem_in_use;
        drop(state);
        self.report_all("check_memory", &errors, in_use);
        false
    }

    fn mem_in_use(&self) -> usize {
        self.state.lock().mem_in_use
    }

    fn total_blocks(&self) -> usize {
        self.state.lock().total_blocks
    }
}
