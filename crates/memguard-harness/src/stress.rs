//! Deterministic multi-threaded stress run.
//!
//! Each worker drives its own xorshift stream over a fixed set of slots,
//! mixing every allocation operation, and stamps each payload with a
//! per-slot byte so cross-block damage shows up on the next touch. When all
//! workers are done the remaining blocks are freed and the allocator must be
//! empty, healthy and silent.

use std::sync::Arc;
use std::thread;

use memguard_core::{AllocatorConfig, BackendKind, MemAllocator, ReportSink};
use serde::Serialize;

use crate::{HarnessError, ensure};

const SLOTS: usize = 64;
const MAX_LEN: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct StressConfig {
    pub backend: BackendKind,
    pub threads: usize,
    pub ops: usize,
    pub seed: u64,
}

/// Per-operation tallies summed over all workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpCounts {
    pub malloc: u64,
    pub calloc: u64,
    pub aligned: u64,
    pub realloc: u64,
    pub dupalloc: u64,
    pub free: u64,
}

impl OpCounts {
    fn merge(&mut self, other: Self) {
        self.malloc += other.malloc;
        self.calloc += other.calloc;
        self.aligned += other.aligned;
        self.realloc += other.realloc;
        self.dupalloc += other.dupalloc;
        self.free += other.free;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub backend: BackendKind,
    pub threads: usize,
    pub ops_per_thread: usize,
    pub seed: u64,
    pub ops: OpCounts,
    /// Blocks still live once every worker finished.
    pub live_at_join: usize,
    pub mem_in_use_at_join: usize,
    pub final_blocks: usize,
    pub final_mem_in_use: usize,
    pub healthy: bool,
    pub diagnostics: usize,
}

#[derive(Debug, Clone, Copy)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // Zero is a fixed point.
        Self { state: seed | 1 }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    addr: usize,
    len: usize,
    stamp: u8,
}

/// Fill `len` bytes at `addr` with `stamp`.
///
/// # Safety
///
/// `addr` must be a live payload of at least `len` bytes.
unsafe fn stamp(addr: usize, len: usize, stamp: u8) {
    unsafe { (addr as *mut u8).write_bytes(stamp, len) };
}

/// # Safety
///
/// Same as [`stamp`].
unsafe fn stamped(addr: usize, len: usize, stamp: u8) -> bool {
    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
    bytes.iter().all(|&b| b == stamp)
}

fn worker(
    alloc: &MemAllocator,
    worker_id: usize,
    ops: usize,
    seed: u64,
) -> Result<(OpCounts, Vec<usize>), HarnessError> {
    let mut rng = XorShift64::new(seed ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let mut slots: [Option<Slot>; SLOTS] = [None; SLOTS];
    let mut counts = OpCounts::default();

    for step in 0..ops {
        let index = rng.below(SLOTS);
        let fresh_stamp = (rng.next_u64() as u8) | 1;
        let len = rng.below(MAX_LEN);

        match slots[index] {
            None => {
                let p = match rng.below(3) {
                    0 => {
                        counts.malloc += 1;
                        alloc.malloc(len, "stress")
                    }
                    1 => {
                        counts.calloc += 1;
                        alloc.calloc(len, "stress")
                    }
                    _ => {
                        counts.aligned += 1;
                        let alignment = 8 << rng.below(7);
                        let p = alloc.malloc_aligned(len, alignment, "stress-aligned");
                        ensure(p as usize % alignment == 0, "alignment", || {
                            format!("worker {worker_id} step {step}: {p:p} vs {alignment}")
                        })?;
                        p
                    }
                };
                let addr = p as usize;
                ensure(addr != 0, "allocate", || format!("worker {worker_id} step {step}"))?;
                // SAFETY: fresh block of `len` bytes.
                unsafe { stamp(addr, len, fresh_stamp) };
                slots[index] = Some(Slot {
                    addr,
                    len,
                    stamp: fresh_stamp,
                });
            }
            Some(slot) => {
                // SAFETY: slot holds a live block owned by this worker.
                let intact = unsafe { stamped(slot.addr, slot.len, slot.stamp) };
                ensure(intact, "payload", || {
                    format!("worker {worker_id} step {step}: block {:#x} lost its stamp", slot.addr)
                })?;

                match rng.below(4) {
                    0 => {
                        counts.realloc += 1;
                        // SAFETY: live block of this allocator.
                        let q = unsafe { alloc.realloc(slot.addr as *mut u8, len) } as usize;
                        ensure(q != 0, "realloc", || format!("worker {worker_id} step {step}"))?;
                        let kept = slot.len.min(len);
                        // SAFETY: the replacement holds at least `len` bytes.
                        let preserved = unsafe { stamped(q, kept, slot.stamp) };
                        ensure(preserved, "realloc content", || {
                            format!("worker {worker_id} step {step}: {} -> {len}", slot.len)
                        })?;
                        unsafe { stamp(q, len, slot.stamp) };
                        slots[index] = Some(Slot { addr: q, len, ..slot });
                    }
                    1 => {
                        counts.dupalloc += 1;
                        // SAFETY: live block of this allocator.
                        let d = unsafe { alloc.dupalloc(slot.addr as *const u8, "stress-dup") };
                        let d = d as usize;
                        ensure(d != 0, "dupalloc", || format!("worker {worker_id} step {step}"))?;
                        // SAFETY: the duplicate holds `slot.len` bytes.
                        let same = unsafe { stamped(d, slot.len, slot.stamp) };
                        ensure(same, "dupalloc content", || {
                            format!("worker {worker_id} step {step}")
                        })?;
                        counts.free += 1;
                        unsafe { alloc.free(slot.addr as *mut u8) };
                        slots[index] = Some(Slot { addr: d, ..slot });
                    }
                    _ => {
                        counts.free += 1;
                        unsafe { alloc.free(slot.addr as *mut u8) };
                        slots[index] = None;
                    }
                }
            }
        }
    }

    let live = slots.iter().flatten().map(|s| s.addr).collect();
    Ok((counts, live))
}

/// Run the stress mix and verify the allocator ends empty and healthy.
pub fn run_stress(config: StressConfig) -> Result<StressReport, HarnessError> {
    if config.threads == 0 {
        return Err(HarnessError::InvalidArgument {
            arg: "threads",
            detail: "must be at least 1".to_string(),
        });
    }

    let alloc = Arc::new(MemAllocator::with_config(
        AllocatorConfig::default()
            .with_backend(config.backend)
            .with_report_sink(ReportSink::Silent),
    ));

    let handles: Vec<_> = (0..config.threads)
        .map(|id| {
            let alloc = Arc::clone(&alloc);
            thread::spawn(move || worker(&alloc, id, config.ops, config.seed))
        })
        .collect();

    let mut ops = OpCounts::default();
    let mut survivors = Vec::new();
    let mut first_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok((counts, live))) => {
                ops.merge(counts);
                survivors.extend(live);
            }
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(_) => {
                first_error.get_or_insert(HarnessError::WorkerPanicked);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let live_at_join = alloc.get_totblock();
    let mem_in_use_at_join = alloc.get_mem_in_use();
    ensure(live_at_join == survivors.len(), "totblock", || {
        format!("counter {live_at_join}, workers hold {}", survivors.len())
    })?;
    let healthy = alloc.check_memory();

    for addr in survivors {
        // SAFETY: every survivor is a live block no worker touches anymore.
        unsafe { alloc.free(addr as *mut u8) };
    }

    let report = StressReport {
        backend: config.backend,
        threads: config.threads,
        ops_per_thread: config.ops,
        seed: config.seed,
        ops,
        live_at_join,
        mem_in_use_at_join,
        final_blocks: alloc.get_totblock(),
        final_mem_in_use: alloc.get_mem_in_use(),
        healthy: healthy && alloc.check_memory(),
        diagnostics: alloc.diagnostics().len(),
    };
    ensure(report.final_blocks == 0 && report.final_mem_in_use == 0, "counters", || {
        format!(
            "{} block(s), {} byte(s) left",
            report.final_blocks, report.final_mem_in_use
        )
    })?;
    ensure(report.healthy, "check_memory", || "registry unhealthy".to_string())?;
    ensure(report.diagnostics == 0, "diagnostics", || {
        format!("{} unexpected report(s)", report.diagnostics)
    })?;
    Ok(report)
}
